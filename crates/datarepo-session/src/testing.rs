//! Fixture entities for unit-of-work tests.

use datarepo_core::{
    DescriptorBuilder, Entity, FieldInfo, FieldValues, Lazy, LifecyclePhase, Managed, RelationSlot,
    RelationshipInfo, Result, SchemaCatalog, SqlType, Value,
};

#[derive(Debug)]
pub(crate) struct Team {
    pub id: Option<i64>,
    pub name: String,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl Entity for Team {
    const ENTITY_NAME: &'static str = "Team";
    const TABLE_NAME: &'static str = "team";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .column("team_id")
                .primary_key()
                .generated(),
            FieldInfo::new("name", SqlType::Text),
        ];
        FIELDS
    }

    fn relationships() -> &'static [RelationshipInfo] {
        const RELS: &[RelationshipInfo] =
            &[RelationshipInfo::one_to_many("members", "Member", "team")];
        RELS
    }

    fn describe(descriptor: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
        descriptor.on(LifecyclePhase::PreInsert, |team| {
            if team.name.is_empty() {
                team.name = "unnamed".to_string();
            }
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.name.clone().into()]
    }

    fn from_values(values: &FieldValues<'_>) -> Result<Self> {
        Ok(Team {
            id: values.get("id")?,
            name: values.get("name")?,
        })
    }

    fn id(&self) -> Value {
        self.id.into()
    }

    fn set_id(&mut self, id: Value) {
        self.id = id.as_i64();
    }
}

#[derive(Debug)]
pub(crate) struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: Lazy<Team>,
}

impl Member {
    pub fn new(username: &str, age: i32, team: Option<&Managed<Team>>) -> Self {
        Self {
            id: None,
            username: username.to_string(),
            age,
            team: team.map_or_else(Lazy::none, Lazy::to),
        }
    }
}

impl Entity for Member {
    const ENTITY_NAME: &'static str = "Member";
    const TABLE_NAME: &'static str = "member";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::BigInt)
                .column("member_id")
                .primary_key()
                .generated(),
            FieldInfo::new("username", SqlType::Text),
            FieldInfo::new("age", SqlType::Integer),
        ];
        FIELDS
    }

    fn relationships() -> &'static [RelationshipInfo] {
        const RELS: &[RelationshipInfo] =
            &[RelationshipInfo::many_to_one("team", "Team", "team_id")];
        RELS
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.username.clone().into(), self.age.into()]
    }

    fn from_values(values: &FieldValues<'_>) -> Result<Self> {
        Ok(Member {
            id: values.get("id")?,
            username: values.get("username")?,
            age: values.get("age")?,
            team: Lazy::none(),
        })
    }

    fn id(&self) -> Value {
        self.id.into()
    }

    fn set_id(&mut self, id: Value) {
        self.id = id.as_i64();
    }

    fn relation(&self, name: &str) -> Option<&dyn RelationSlot> {
        (name == "team").then_some(&self.team as &dyn RelationSlot)
    }

    fn relation_mut(&mut self, name: &str) -> Option<&mut dyn RelationSlot> {
        (name == "team").then_some(&mut self.team as &mut dyn RelationSlot)
    }
}

pub(crate) fn catalog() -> SchemaCatalog {
    SchemaCatalog::builder()
        .register::<Member>()
        .register::<Team>()
        .build()
        .expect("fixture catalog is valid")
}
