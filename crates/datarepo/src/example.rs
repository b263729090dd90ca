//! Example domain: members, teams and items.
//!
//! `Member.team` owns the `team_id` foreign key; `Team.members` is its
//! inverse and is read through [`Repository::back_reference`]. `Item` has an
//! application-assigned key and decides `is_new` from its audit timestamp.

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use datarepo_core::{
    Connection, DescriptorBuilder, Entity, FieldInfo, FieldValues, Lazy, LifecyclePhase, Managed,
    RelationSlot, RelationshipInfo, Result, Row, RowLock, SchemaCatalog, SqlType, Value,
};
use datarepo_query::{ParamDecl, QueryParser, QueryPlan, QueryPlanBuilder, Specification, Window};
use datarepo_session::{Projection, QueryHints, UnitOfWork};

use crate::method::{MethodDecl, MethodId};
use crate::repository::{Repository, RepositoryBuilder};

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Schema catalog of the example entities.
pub fn catalog() -> Result<SchemaCatalog> {
    SchemaCatalog::builder()
        .register::<Team>()
        .register::<Member>()
        .register::<Item>()
        .build()
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub created_date: Option<NaiveDateTime>,
    pub last_modified_date: Option<NaiveDateTime>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            created_date: None,
            last_modified_date: None,
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
            FieldInfo::new("created_date", SqlType::Timestamp)
                .nullable()
                .not_updatable(),
            FieldInfo::new("last_modified_date", SqlType::Timestamp).nullable(),
        ];
        FIELDS
    }

    fn relationships() -> &'static [RelationshipInfo] {
        const RELS: &[RelationshipInfo] =
            &[RelationshipInfo::one_to_many("members", "Member", "team")];
        RELS
    }

    fn describe(descriptor: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
        descriptor
            .on(LifecyclePhase::PreInsert, |team| {
                let now = now();
                team.created_date = Some(now);
                team.last_modified_date = Some(now);
            })
            .on(LifecyclePhase::PreUpdate, |team| {
                team.last_modified_date = Some(now());
            })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.name.clone().into(),
            self.created_date.into(),
            self.last_modified_date.into(),
        ]
    }

    fn from_values(values: &FieldValues<'_>) -> Result<Self> {
        Ok(Team {
            id: values.get("id")?,
            name: values.get("name")?,
            created_date: values.get("created_date")?,
            last_modified_date: values.get("last_modified_date")?,
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
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: Lazy<Team>,
    pub created_date: Option<NaiveDateTime>,
    pub last_modified_date: Option<NaiveDateTime>,
}

impl Member {
    pub fn new(username: &str, age: i32, team: Option<&Managed<Team>>) -> Self {
        Self {
            id: None,
            username: username.to_string(),
            age,
            team: team.map_or_else(Lazy::none, Lazy::to),
            created_date: None,
            last_modified_date: None,
        }
    }

    /// Move the member to `team`.
    pub fn change_team(&mut self, team: &Managed<Team>) {
        self.team = Lazy::to(team);
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
            FieldInfo::new("created_date", SqlType::Timestamp)
                .nullable()
                .not_updatable(),
            FieldInfo::new("last_modified_date", SqlType::Timestamp).nullable(),
        ];
        FIELDS
    }

    fn relationships() -> &'static [RelationshipInfo] {
        const RELS: &[RelationshipInfo] =
            &[RelationshipInfo::many_to_one("team", "Team", "team_id")];
        RELS
    }

    fn describe(descriptor: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
        descriptor
            .named_graph("Member.All", &["team"])
            .on(LifecyclePhase::PreInsert, |member| {
                let now = now();
                member.created_date = Some(now);
                member.last_modified_date = Some(now);
            })
            .on(LifecyclePhase::PreUpdate, |member| {
                member.last_modified_date = Some(now());
            })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.username.clone().into(),
            self.age.into(),
            self.created_date.into(),
            self.last_modified_date.into(),
        ]
    }

    fn from_values(values: &FieldValues<'_>) -> Result<Self> {
        Ok(Member {
            id: values.get("id")?,
            username: values.get("username")?,
            age: values.get("age")?,
            team: Lazy::none(),
            created_date: values.get("created_date")?,
            last_modified_date: values.get("last_modified_date")?,
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

/// An entity with an application-assigned key.
///
/// New until its `created_at` audit stamp is set, so saving an `Item`
/// whose key already exists merges only after the first insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub created_at: Option<NaiveDateTime>,
}

impl Item {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at: None,
        }
    }
}

impl Entity for Item {
    const ENTITY_NAME: &'static str = "Item";
    const TABLE_NAME: &'static str = "item";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", SqlType::Text).primary_key(),
            FieldInfo::new("created_at", SqlType::Timestamp)
                .nullable()
                .not_updatable(),
        ];
        FIELDS
    }

    fn describe(descriptor: DescriptorBuilder<Self>) -> DescriptorBuilder<Self> {
        descriptor.on(LifecyclePhase::PreInsert, |item| {
            item.created_at = Some(now());
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.id.clone().into(), self.created_at.into()]
    }

    fn from_values(values: &FieldValues<'_>) -> Result<Self> {
        Ok(Item {
            id: values.get("id")?,
            created_at: values.get("created_at")?,
        })
    }

    fn id(&self) -> Value {
        self.id.clone().into()
    }

    fn set_id(&mut self, id: Value) {
        if let Value::Text(id) = id {
            self.id = id;
        }
    }

    fn is_new(&self) -> bool {
        self.created_at.is_none()
    }
}

// ============================================================================
// Projections
// ============================================================================

/// `new MemberDto(m.id, m.username, t.name)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDto {
    pub id: i64,
    pub username: String,
    pub team_name: Option<String>,
}

impl Projection for MemberDto {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_at(0)?,
            username: row.get_at(1)?,
            team_name: row.get_at(2)?,
        })
    }
}

impl From<&Member> for MemberDto {
    fn from(member: &Member) -> Self {
        Self {
            id: member.id.unwrap_or_default(),
            username: member.username.clone(),
            team_name: None,
        }
    }
}

/// Class-based projection holding only the username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameOnlyDto {
    pub username: String,
}

impl Projection for UsernameOnlyDto {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            username: row.get_at(0)?,
        })
    }
}

/// Username plus the name of the member's team, read as a nested DTO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedClosedProjections {
    pub username: String,
    pub team: Option<TeamInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamInfo {
    pub name: String,
}

impl Projection for NestedClosedProjections {
    fn from_row(row: &Row) -> Result<Self> {
        let team: Option<String> = row.get_at(1)?;
        Ok(Self {
            username: row.get_at(0)?,
            team: team.map(|name| TeamInfo { name }),
        })
    }
}

/// Open projection: computed from the whole loaded member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNameOnly {
    pub username: String,
}

impl From<&Member> for UserNameOnly {
    fn from(member: &Member) -> Self {
        Self {
            username: format!("{} {}", member.username, member.age),
        }
    }
}

// ============================================================================
// Specifications
// ============================================================================

/// Members of the team named `team_name`; no restriction when it is empty.
pub fn team_name(team_name: &str) -> Specification<Member> {
    if team_name.is_empty() {
        return Specification::empty();
    }
    Specification::equal("team.name", team_name)
}

pub fn username(username: &str) -> Specification<Member> {
    Specification::equal("username", username)
}

// ============================================================================
// Repositories
// ============================================================================

/// The member repository and its declared methods.
pub struct MemberRepository {
    pub repo: Repository<Member>,
    pub find_by_username: MethodId,
    pub find_by_username_and_age_greater_than: MethodId,
    pub find_user: MethodId,
    pub find_usernames: MethodId,
    pub find_member_dto: MethodId,
    pub find_by_names: MethodId,
    pub find_list_by_username: MethodId,
    pub find_one_by_username: MethodId,
    pub find_optional_by_username: MethodId,
    pub find_by_age: MethodId,
    pub find_slice_by_age: MethodId,
    pub bulk_age_plus: MethodId,
    pub find_member_fetch_join: MethodId,
    pub find_member_entity_graph: MethodId,
    pub find_entity_graph_by_username: MethodId,
    pub find_read_only_by_username: MethodId,
    pub find_lock_by_username: MethodId,
    pub find_projections_by_username: MethodId,
    pub count_by_age: MethodId,
    pub exists_by_username: MethodId,
    pub find_top3_by_age_greater_than_equal: MethodId,
    pub find_nested_projections_by_username: MethodId,
    pub find_by_username_starting_with: MethodId,
    custom: MemberRepositoryImpl,
}

impl MemberRepository {
    /// Compile every declared method. Any invalid declaration fails here.
    pub fn build(catalog: Arc<SchemaCatalog>) -> Result<Self> {
        let mut b = RepositoryBuilder::<Member>::new(catalog.clone())?.find_all_fetch(&["team"]);
        let username = || ParamDecl::scalar("username");
        let age = || ParamDecl::scalar("age");

        Ok(Self {
            find_by_username: b.declare(MethodDecl::derived("findByUsername").param(username()))?,
            find_by_username_and_age_greater_than: b.declare(
                MethodDecl::derived("findByUsernameAndAgeGreaterThan")
                    .param(username())
                    .param(age()),
            )?,
            find_user: b.declare(
                MethodDecl::query(
                    "findUser",
                    "select m from Member m where m.username = :username and m.age = :age",
                )
                .param(username())
                .param(age()),
            )?,
            find_usernames: b.declare(MethodDecl::query(
                "findUsernames",
                "select m.username from Member m",
            ))?,
            find_member_dto: b.declare(MethodDecl::query(
                "findMemberDto",
                "select new MemberDto(m.id, m.username, t.name) from Member m join m.team t",
            ))?,
            find_by_names: b.declare(
                MethodDecl::query("findByNames", "select m from Member m where m.username in :names")
                    .param(ParamDecl::collection("names")),
            )?,
            find_list_by_username: b
                .declare(MethodDecl::derived("findListByUsername").param(username()))?,
            find_one_by_username: b
                .declare(MethodDecl::derived("findOneByUsername").param(username()))?,
            find_optional_by_username: b
                .declare(MethodDecl::derived("findOptionalByUsername").param(username()))?,
            find_by_age: b.declare(
                MethodDecl::derived("findByAge")
                    .param(age())
                    .param(ParamDecl::pageable()),
            )?,
            find_slice_by_age: b.declare(
                MethodDecl::derived("findSliceByAge")
                    .param(age())
                    .param(ParamDecl::pageable())
                    .count_query("select count(m) from Member m where m.age = :age"),
            )?,
            bulk_age_plus: b.declare(
                MethodDecl::query(
                    "bulkAgePlus",
                    "update Member m set m.age = m.age + 1 where m.age >= :age",
                )
                .param(age())
                .modifying(true),
            )?,
            find_member_fetch_join: b.declare(MethodDecl::query(
                "findMemberFetchJoin",
                "select m from Member m left join fetch m.team",
            ))?,
            find_member_entity_graph: b.declare(
                MethodDecl::query("findMemberEntityGraph", "select m from Member m")
                    .fetch(&["team"]),
            )?,
            find_entity_graph_by_username: b.declare(
                MethodDecl::derived("findEntityGraphByUsername")
                    .param(username())
                    .entity_graph("Member.All"),
            )?,
            find_read_only_by_username: b.declare(
                MethodDecl::derived("findReadOnlyByUsername")
                    .param(username())
                    .read_only(),
            )?,
            find_lock_by_username: b.declare(
                MethodDecl::derived("findLockByUsername")
                    .param(username())
                    .lock(RowLock::Update),
            )?,
            find_projections_by_username: b.declare(
                MethodDecl::derived("findProjectionsByUsername")
                    .param(username())
                    .dto("UsernameOnlyDto", &["username"]),
            )?,
            count_by_age: b.declare(MethodDecl::derived("countByAge").param(age()))?,
            exists_by_username: b
                .declare(MethodDecl::derived("existsByUsername").param(username()))?,
            find_top3_by_age_greater_than_equal: b.declare(
                MethodDecl::derived("findTop3ByAgeGreaterThanEqualOrderByAgeDesc").param(age()),
            )?,
            find_nested_projections_by_username: b.declare(
                MethodDecl::derived("findNestedProjectionsByUsername")
                    .param(username())
                    .dto("NestedClosedProjections", &["username", "team.name"]),
            )?,
            find_by_username_starting_with: b.declare(
                MethodDecl::derived("findByUsernameStartingWith")
                    .param(ParamDecl::scalar("prefix")),
            )?,
            custom: MemberRepositoryImpl::new(&catalog)?,
            repo: b.build()?,
        })
    }
}

impl MemberRepositoryCustom for MemberRepository {
    fn find_member_custom<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
    ) -> Result<Vec<Managed<Member>>> {
        self.custom.find_member_custom(uow)
    }
}

/// Member queries written by hand instead of declared.
pub trait MemberRepositoryCustom {
    fn find_member_custom<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
    ) -> Result<Vec<Managed<Member>>>;
}

/// [`MemberRepositoryCustom`] over plans compiled directly from query text.
#[derive(Debug)]
pub struct MemberRepositoryImpl {
    all_members: QueryPlan,
}

impl MemberRepositoryImpl {
    pub fn new(catalog: &Arc<SchemaCatalog>) -> Result<Self> {
        let member = catalog.descriptor_of::<Member>()?.clone();
        let parsed = QueryParser::new(catalog, &[]).parse("select m from Member m")?;
        let all_members =
            QueryPlanBuilder::new(catalog.clone(), member, "findMemberCustom").build_parsed(parsed)?;
        Ok(Self { all_members })
    }
}

impl MemberRepositoryCustom for MemberRepositoryImpl {
    fn find_member_custom<C: Connection>(
        &self,
        uow: &mut UnitOfWork<C>,
    ) -> Result<Vec<Managed<Member>>> {
        uow.list(&self.all_members, &[], Window::default(), QueryHints::default())
    }
}

/// Repository of the example `Team` entity.
pub fn team_repository(catalog: Arc<SchemaCatalog>) -> Result<Repository<Team>> {
    RepositoryBuilder::<Team>::new(catalog)?.build()
}

/// Repository of the example `Item` entity.
pub fn item_repository(catalog: Arc<SchemaCatalog>) -> Result<Repository<Item>> {
    RepositoryBuilder::<Item>::new(catalog)?.build()
}
