//! Declared and built-in member repository methods against the in-memory
//! store.

mod common;

use common::{harness, seed_members, usernames};
use datarepo::example::{
    self, Member, MemberDto, MemberRepositoryCustom, NestedClosedProjections, Team, TeamInfo,
    UserNameOnly, UsernameOnlyDto,
};
use datarepo::prelude::*;

/// Commit seven members aged 10, in no team.
fn seed_same_age(h: &common::Harness) {
    let mut uow = h.source.begin().unwrap();
    for i in 1..=7 {
        uow.save(Member::new(&format!("member{i}"), 10, None)).unwrap();
    }
    uow.save(Member::new("other", 20, None)).unwrap();
    uow.commit().unwrap();
}

// ============================================================================
// Identity and derived finders
// ============================================================================

#[test]
fn test_saved_member_found_by_id_is_same_handle() {
    let h = harness();
    let mut uow = h.source.begin().unwrap();
    let saved = h
        .members
        .repo
        .save(&mut uow, Member::new("memberA", 10, None))
        .unwrap();
    let id = saved.borrow().id.unwrap();

    let found = h.members.repo.find_by_id(&mut uow, id).unwrap().unwrap();
    assert!(found.ptr_eq(&saved));
    assert_eq!(found.borrow().username, "memberA");
    uow.commit().unwrap();
}

#[test]
fn test_find_by_username_and_age_greater_than() {
    let h = harness();
    let mut uow = h.source.begin().unwrap();
    uow.save(Member::new("AAA", 10, None)).unwrap();
    uow.save(Member::new("AAA", 20, None)).unwrap();

    let found = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_username_and_age_greater_than)
        .arg("AAA")
        .arg(15)
        .list()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].borrow().age, 20);
}

#[test]
fn test_query_string_method() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    let found = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_user)
        .arg("member2")
        .arg(20)
        .list()
        .unwrap();
    assert_eq!(usernames(&found), ["member2"]);
}

#[test]
fn test_find_by_names_binds_collection() {
    let h = harness();
    seed_members(&h, 4);
    let mut uow = h.source.begin().unwrap();
    let found = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_names)
        .arg_list(vec!["member1", "member3", "nobody"])
        .list()
        .unwrap();
    let mut names = usernames(&found);
    names.sort();
    assert_eq!(names, ["member1", "member3"]);
}

#[test]
fn test_top3_ordered_by_age_desc() {
    let h = harness();
    seed_members(&h, 5);
    let mut uow = h.source.begin().unwrap();
    let found = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_top3_by_age_greater_than_equal)
        .arg(20)
        .list()
        .unwrap();
    assert_eq!(usernames(&found), ["member5", "member4", "member3"]);
}

#[test]
fn test_count_and_exists_methods() {
    let h = harness();
    seed_same_age(&h);
    let mut uow = h.source.begin().unwrap();
    let repo = &h.members.repo;
    assert_eq!(
        repo.invoke(&mut uow, h.members.count_by_age).arg(10).count().unwrap(),
        7
    );
    assert_eq!(repo.count(&mut uow).unwrap(), 8);
    assert!(
        repo.invoke(&mut uow, h.members.exists_by_username)
            .arg("other")
            .exists()
            .unwrap()
    );
    assert!(
        !repo
            .invoke(&mut uow, h.members.exists_by_username)
            .arg("nobody")
            .exists()
            .unwrap()
    );

    // A count method has no rows to test for.
    let err = repo
        .invoke(&mut uow, h.members.count_by_age)
        .arg(99)
        .exists()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInvocation { .. }));
}

#[test]
fn test_starting_with_matches_wildcards_literally() {
    let h = harness();
    let mut uow = h.source.begin().unwrap();
    for name in ["ab", "a_b", "a%c"] {
        uow.save(Member::new(name, 10, None)).unwrap();
    }
    let repo = &h.members.repo;
    let mut starting_with = |prefix: &str| {
        let mut found = usernames(
            &repo
                .invoke(&mut uow, h.members.find_by_username_starting_with)
                .arg(prefix)
                .list()
                .unwrap(),
        );
        found.sort();
        found
    };
    assert_eq!(starting_with("a_"), ["a_b"]);
    assert_eq!(starting_with("a%"), ["a%c"]);
    assert_eq!(starting_with("a"), ["a%c", "a_b", "ab"]);
}

// ============================================================================
// Return types
// ============================================================================

#[test]
fn test_return_type_terminals() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    let repo = &h.members.repo;

    let list = repo
        .invoke(&mut uow, h.members.find_list_by_username)
        .arg("member1")
        .list()
        .unwrap();
    assert_eq!(list.len(), 1);
    let one = repo
        .invoke(&mut uow, h.members.find_one_by_username)
        .arg("member1")
        .one()
        .unwrap()
        .unwrap();
    assert!(one.ptr_eq(&list[0]));
    let optional = repo
        .invoke(&mut uow, h.members.find_optional_by_username)
        .arg("member1")
        .first()
        .unwrap();
    assert!(optional.is_some_and(|m| m.ptr_eq(&one)));

    let missing = repo
        .invoke(&mut uow, h.members.find_list_by_username)
        .arg("nobody")
        .list()
        .unwrap();
    assert!(missing.is_empty());
    let missing = repo
        .invoke(&mut uow, h.members.find_one_by_username)
        .arg("nobody")
        .one()
        .unwrap();
    assert!(missing.is_none());
}

#[test]
fn test_single_result_over_two_rows_is_non_unique() {
    let h = harness();
    let mut uow = h.source.begin().unwrap();
    uow.save(Member::new("AAA", 10, None)).unwrap();
    uow.save(Member::new("AAA", 20, None)).unwrap();

    let err = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_one_by_username)
        .arg("AAA")
        .one()
        .unwrap_err();
    assert!(matches!(err, Error::NonUniqueResult { found: 2 }));

    for err in [
        h.members
            .repo
            .invoke(&mut uow, h.members.find_one_by_username)
            .arg("AAA")
            .list()
            .unwrap_err(),
        h.members
            .repo
            .invoke(&mut uow, h.members.find_one_by_username)
            .arg("AAA")
            .first()
            .unwrap_err(),
    ] {
        assert!(matches!(err, Error::NonUniqueResult { found: 2 }), "{err}");
    }
}

// ============================================================================
// Paging
// ============================================================================

#[test]
fn test_paging_with_sort() {
    let h = harness();
    seed_same_age(&h);
    let mut uow = h.source.begin().unwrap();
    let repo = &h.members.repo;
    let request = |page| PageRequest::of_sorted(page, 3, Sort::desc("username")).unwrap();

    h.store.reset_stats();
    let page = repo
        .invoke(&mut uow, h.members.find_by_age)
        .arg(10)
        .page_request(request(0))
        .page()
        .unwrap();
    assert_eq!(usernames(page.content()), ["member7", "member6", "member5"]);
    assert_eq!(page.number_of_elements(), 3);
    assert_eq!(page.total_elements(), 7);
    assert_eq!(page.total_pages(), 3);
    assert!(page.is_first());
    assert!(page.has_next());
    assert_eq!(h.store.stats().count_queries, 1);

    h.store.reset_stats();
    let last = repo
        .invoke(&mut uow, h.members.find_by_age)
        .arg(10)
        .page_request(request(2))
        .page()
        .unwrap();
    assert_eq!(usernames(last.content()), ["member1"]);
    assert_eq!(last.total_elements(), 7);
    assert!(!last.has_next());
    assert!(last.is_last());
    // a short, non-empty last page proves the total
    assert_eq!(h.store.stats().count_queries, 0);
}

#[test]
fn test_slice_never_counts() {
    let h = harness();
    seed_same_age(&h);
    let mut uow = h.source.begin().unwrap();
    h.store.reset_stats();

    let mut has_next = Vec::new();
    let mut sizes = Vec::new();
    for page in 0..3 {
        let slice = h
            .members
            .repo
            .invoke(&mut uow, h.members.find_slice_by_age)
            .arg(10)
            .page_request(PageRequest::of_sorted(page, 3, Sort::asc("username")).unwrap())
            .slice()
            .unwrap();
        has_next.push(slice.has_next());
        sizes.push(slice.number_of_elements());
    }
    assert_eq!(has_next, [true, true, false]);
    assert_eq!(sizes, [3, 3, 1]);
    assert_eq!(h.store.stats().count_queries, 0);
    assert_eq!(h.store.stats().selects, 3);
}

#[test]
fn test_page_maps_to_dto() {
    let h = harness();
    seed_members(&h, 5);
    let mut uow = h.source.begin().unwrap();
    let request = PageRequest::of_sorted(0, 2, Sort::asc("age")).unwrap();
    let page = h.members.repo.find_all_paged(&mut uow, &request).unwrap();

    let dtos = page.map(|m| MemberDto::from(&*m.borrow())).into_page();
    assert_eq!(dtos.total_elements(), 5);
    assert_eq!(dtos.total_pages(), 3);
    let names: Vec<_> = dtos.content().iter().map(|d| d.username.as_str()).collect();
    assert_eq!(names, ["member1", "member2"]);
    assert!(dtos.content().iter().all(|d| d.id > 0));
}

#[test]
fn test_find_all_sorted() {
    let h = harness();
    seed_members(&h, 3);
    let mut uow = h.source.begin().unwrap();
    let found = h
        .members
        .repo
        .find_all_sorted(&mut uow, &Sort::desc("age"))
        .unwrap();
    assert_eq!(usernames(&found), ["member3", "member2", "member1"]);
}

// ============================================================================
// Projections
// ============================================================================

#[test]
fn test_scalar_projection() {
    let h = harness();
    seed_members(&h, 3);
    let mut uow = h.source.begin().unwrap();
    let mut names: Vec<String> = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_usernames)
        .scalars()
        .unwrap();
    names.sort();
    assert_eq!(names, ["member1", "member2", "member3"]);
}

#[test]
fn test_constructor_projection_joins_team() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    uow.save(Member::new("loner", 99, None)).unwrap();

    let mut dtos: Vec<MemberDto> = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_member_dto)
        .dtos()
        .unwrap();
    dtos.sort_by(|a, b| a.username.cmp(&b.username));
    // the inner join drops members without a team
    assert_eq!(dtos.len(), 2);
    assert_eq!(dtos[0].username, "member1");
    assert_eq!(dtos[0].team_name.as_deref(), Some("teamA"));
    assert_eq!(dtos[1].team_name.as_deref(), Some("teamB"));
}

#[test]
fn test_class_based_projection() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    let dtos: Vec<UsernameOnlyDto> = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_projections_by_username)
        .arg("member2")
        .dtos()
        .unwrap();
    assert_eq!(
        dtos,
        [UsernameOnlyDto {
            username: "member2".to_string()
        }]
    );
}

#[test]
fn test_nested_closed_projection() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    uow.save(Member::new("loner", 5, None)).unwrap();

    let mut nested = |username: &str| -> Vec<NestedClosedProjections> {
        h.members
            .repo
            .invoke(&mut uow, h.members.find_nested_projections_by_username)
            .arg(username)
            .dtos()
            .unwrap()
    };
    assert_eq!(
        nested("member1"),
        [NestedClosedProjections {
            username: "member1".to_string(),
            team: Some(TeamInfo {
                name: "teamA".to_string()
            }),
        }]
    );
    assert_eq!(
        nested("loner"),
        [NestedClosedProjections {
            username: "loner".to_string(),
            team: None,
        }]
    );
}

#[test]
fn test_open_projection_reads_whole_entity() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    let views: Vec<UserNameOnly> = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_username)
        .arg("member2")
        .open_projection()
        .unwrap();
    assert_eq!(
        views,
        [UserNameOnly {
            username: "member2 20".to_string()
        }]
    );
    // loaded without a snapshot, so nothing is dirty
    assert!(!uow.has_pending_changes().unwrap());
}

// ============================================================================
// Custom methods
// ============================================================================

#[test]
fn test_custom_method_runs_beside_declared_ones() {
    let h = harness();
    seed_members(&h, 3);
    let mut uow = h.source.begin().unwrap();
    let mut found = usernames(&h.members.find_member_custom(&mut uow).unwrap());
    found.sort();
    assert_eq!(found, ["member1", "member2", "member3"]);

    let declared = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_username)
        .arg("member1")
        .list()
        .unwrap();
    let custom = h.members.find_member_custom(&mut uow).unwrap();
    assert!(custom.iter().any(|m| m.ptr_eq(&declared[0])));
}

// ============================================================================
// Relationships
// ============================================================================

#[test]
fn test_lazy_team_resolves_on_demand() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    let member = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_username)
        .arg("member1")
        .list()
        .unwrap()
        .remove(0);
    assert!(!member.borrow().team.is_loaded());

    let team = uow.resolve::<Member, Team>(&member, "team").unwrap().unwrap();
    assert_eq!(team.borrow().name, "teamA");
    assert!(member.borrow().team.is_loaded());
    let again = uow.resolve::<Member, Team>(&member, "team").unwrap().unwrap();
    assert!(again.ptr_eq(&team));
}

/// Every member arrives with its team slot filled.
fn assert_teams_fetched(found: &[Managed<Member>]) {
    assert!(!found.is_empty());
    for member in found {
        let member = member.borrow();
        let team = member.team.get().unwrap().unwrap();
        let expected = if member.age % 20 == 0 { "teamB" } else { "teamA" };
        assert_eq!(team.borrow().name, expected);
    }
}

#[test]
fn test_fetch_join_and_entity_graphs_load_team() {
    let h = harness();
    seed_members(&h, 2);
    let repo = &h.members.repo;

    let mut uow = h.source.begin().unwrap();
    let found = repo
        .invoke(&mut uow, h.members.find_member_fetch_join)
        .list()
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_teams_fetched(&found);

    let mut uow = h.source.begin().unwrap();
    let found = repo
        .invoke(&mut uow, h.members.find_member_entity_graph)
        .list()
        .unwrap();
    assert_teams_fetched(&found);

    let mut uow = h.source.begin().unwrap();
    let found = repo
        .invoke(&mut uow, h.members.find_entity_graph_by_username)
        .arg("member1")
        .list()
        .unwrap();
    assert_eq!(usernames(&found), ["member1"]);
    assert_teams_fetched(&found);

    let mut uow = h.source.begin().unwrap();
    let found = repo.find_all(&mut uow).unwrap();
    assert_teams_fetched(&found);
    assert_eq!(uow.n1_stats().total_loads, 0);
}

#[test]
fn test_team_members_back_reference() {
    let h = harness();
    seed_members(&h, 4);
    let teams = example::team_repository(h.source.catalog().clone()).unwrap();
    let mut uow = h.source.begin().unwrap();
    let team_b = teams
        .find_all_sorted(&mut uow, &Sort::asc("name"))
        .unwrap()
        .remove(1);
    assert_eq!(team_b.borrow().name, "teamB");

    let members: Vec<Managed<Member>> = teams.back_reference(&mut uow, &team_b, "members").unwrap();
    let mut names = usernames(&members);
    names.sort();
    assert_eq!(names, ["member2", "member4"]);
}

// ============================================================================
// Specifications
// ============================================================================

#[test]
fn test_specification_with_team_join() {
    let h = harness();
    seed_members(&h, 4);
    let mut uow = h.source.begin().unwrap();
    let repo = &h.members.repo;

    let spec = example::username("member3").and(example::team_name("teamA"));
    let found = repo.find_all_matching(&mut uow, &spec).unwrap();
    assert_eq!(usernames(&found), ["member3"]);

    let wrong_team = example::username("member3").and(example::team_name("teamB"));
    assert!(repo.find_all_matching(&mut uow, &wrong_team).unwrap().is_empty());

    assert_eq!(
        repo.count_matching(&mut uow, &example::team_name("teamB"))
            .unwrap(),
        2
    );
}

#[test]
fn test_empty_specification_matches_everything() {
    let h = harness();
    seed_members(&h, 3);
    let mut uow = h.source.begin().unwrap();
    let spec = example::team_name("");
    assert!(spec.is_empty());
    assert_eq!(h.members.repo.find_all_matching(&mut uow, &spec).unwrap().len(), 3);

    let page = h
        .members
        .repo
        .find_all_matching_paged(&mut uow, &spec, &PageRequest::of(0, 2).unwrap())
        .unwrap();
    assert_eq!(page.total_elements(), 3);
    assert!(page.has_next());
}

// ============================================================================
// Bulk statements
// ============================================================================

#[test]
fn test_bulk_update_leaves_residents_stale_until_clear() {
    let h = harness();
    let mut builder = Repository::<Member>::builder(h.source.catalog().clone()).unwrap();
    let bulk = builder
        .declare(
            MethodDecl::query(
                "bulkAgePlus",
                "update Member m set m.age = m.age + 1 where m.age >= :age",
            )
            .param(ParamDecl::scalar("age"))
            .modifying(false),
        )
        .unwrap();
    let repo = builder.build().unwrap();

    let mut uow = h.source.begin().unwrap();
    for (name, age) in [("member1", 10), ("member2", 19), ("member3", 20), ("member4", 21), ("member5", 40)] {
        uow.save(Member::new(name, age, None)).unwrap();
    }
    let member5 = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_username)
        .arg("member5")
        .one()
        .unwrap()
        .unwrap();
    let affected = repo.invoke(&mut uow, bulk).arg(20).execute().unwrap();
    assert_eq!(affected, 3);
    assert_eq!(member5.borrow().age, 40);

    let id = member5.borrow().id.unwrap();
    let resident = h.members.repo.find_by_id(&mut uow, id).unwrap().unwrap();
    assert!(resident.ptr_eq(&member5));
    assert_eq!(resident.borrow().age, 40);

    uow.clear().unwrap();
    let fresh = h.members.repo.find_by_id(&mut uow, id).unwrap().unwrap();
    assert!(!fresh.ptr_eq(&member5));
    assert_eq!(fresh.borrow().age, 41);
}

#[test]
fn test_bulk_update_with_automatic_clear() {
    let h = harness();
    seed_members(&h, 4);
    let mut uow = h.source.begin().unwrap();
    let member4 = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_username)
        .arg("member4")
        .one()
        .unwrap()
        .unwrap();

    let affected = h
        .members
        .repo
        .invoke(&mut uow, h.members.bulk_age_plus)
        .arg(20)
        .execute()
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(uow.tracked_count(), 0);

    let id = member4.borrow().id.unwrap();
    let fresh = h.members.repo.find_by_id(&mut uow, id).unwrap().unwrap();
    assert_eq!(fresh.borrow().age, 41);
    assert_eq!(member4.borrow().age, 40);
}

// ============================================================================
// Change tracking
// ============================================================================

#[test]
fn test_read_only_results_are_never_flushed() {
    let h = harness();
    seed_members(&h, 1);

    let mut uow = h.source.begin().unwrap();
    let member = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_read_only_by_username)
        .arg("member1")
        .list()
        .unwrap()
        .remove(0);
    member.borrow_mut().username = "member2".to_string();
    h.store.reset_stats();
    uow.flush().unwrap();
    assert_eq!(h.store.stats().updates, 0);
    uow.commit().unwrap();

    let mut uow = h.source.begin().unwrap();
    let member = h
        .members
        .repo
        .invoke(&mut uow, h.members.find_by_username)
        .arg("member1")
        .list()
        .unwrap()
        .remove(0);
    member.borrow_mut().username = "member2".to_string();
    h.store.reset_stats();
    uow.flush().unwrap();
    assert_eq!(h.store.stats().updates, 1);
    uow.commit().unwrap();
}

#[test]
fn test_audit_timestamps() {
    let h = harness();
    let mut uow = h.source.begin().unwrap();
    let member = uow.save(Member::new("member1", 10, None)).unwrap();
    let (created, modified) = {
        let m = member.borrow();
        (m.created_date.unwrap(), m.last_modified_date.unwrap())
    };
    assert_eq!(created, modified);
    uow.flush().unwrap();

    member.borrow_mut().username = "member2".to_string();
    uow.flush().unwrap();
    let modified_again = member.borrow().last_modified_date.unwrap();
    assert!(modified_again >= modified);
    let id = member.borrow().id.unwrap();
    uow.commit().unwrap();

    let mut uow = h.source.begin().unwrap();
    let stored = h.members.repo.find_by_id(&mut uow, id).unwrap().unwrap();
    assert_eq!(stored.borrow().username, "member2");
    assert_eq!(stored.borrow().created_date, Some(created));
    assert_eq!(stored.borrow().last_modified_date, Some(modified_again));
}

#[test]
fn test_delete_by_id_and_exists() {
    let h = harness();
    seed_members(&h, 2);
    let mut uow = h.source.begin().unwrap();
    let repo = &h.members.repo;
    let member1 = repo
        .invoke(&mut uow, h.members.find_by_username)
        .arg("member1")
        .one()
        .unwrap()
        .unwrap();
    let id = member1.borrow().id.unwrap();

    assert!(repo.exists_by_id(&mut uow, id).unwrap());
    assert!(repo.delete_by_id(&mut uow, id).unwrap());
    assert!(!repo.exists_by_id(&mut uow, id).unwrap());
    assert_eq!(repo.count(&mut uow).unwrap(), 1);
    uow.commit().unwrap();
    assert_eq!(h.store.row_count("member").unwrap(), 1);
}
