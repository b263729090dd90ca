//! Fixture entities for the store tests.

use datarepo_core::{
    Entity, FieldInfo, FieldValues, RelationshipInfo, Result, SchemaCatalog, SqlType, Value,
};

pub(crate) struct Team;

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

    fn to_values(&self) -> Vec<Value> {
        Vec::new()
    }

    fn from_values(_: &FieldValues<'_>) -> Result<Self> {
        Ok(Team)
    }

    fn id(&self) -> Value {
        Value::Null
    }

    fn set_id(&mut self, _: Value) {}
}

pub(crate) struct Member;

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
        Vec::new()
    }

    fn from_values(_: &FieldValues<'_>) -> Result<Self> {
        Ok(Member)
    }

    fn id(&self) -> Value {
        Value::Null
    }

    fn set_id(&mut self, _: Value) {}
}

pub(crate) fn catalog() -> SchemaCatalog {
    SchemaCatalog::builder()
        .register::<Team>()
        .register::<Member>()
        .build()
        .expect("fixture catalog is valid")
}
