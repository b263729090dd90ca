#![allow(dead_code)]

use std::time::Duration;

use datarepo::example::{self, Member, MemberRepository, Team};
use datarepo::memory::MemoryConnection;
use datarepo::prelude::*;

pub struct Harness {
    pub store: MemoryStore,
    pub source: DataSource<MemoryConnection>,
    pub members: MemberRepository,
}

pub fn harness() -> Harness {
    harness_with(Settings::default())
}

pub fn harness_with(settings: Settings) -> Harness {
    let catalog = Arc::new(example::catalog().unwrap());
    let store = MemoryStore::new(settings.store.clone());
    let source = DataSource::memory(&store, catalog.clone(), &settings).unwrap();
    let members = MemberRepository::build(catalog).unwrap();
    Harness {
        store,
        source,
        members,
    }
}

/// Settings with short pool and lock timeouts.
pub fn quick_timeouts(max_connections: usize) -> Settings {
    let mut settings = Settings::default();
    settings.pool =
        PoolConfig::new(max_connections).with_acquire_timeout(Duration::from_millis(100));
    settings.store = MemoryStoreConfig::default().with_lock_timeout(Duration::from_millis(100));
    settings
}

/// Commit `member1`..`member<n>` with ages 10, 20, ... in teamA/teamB
/// alternately.
pub fn seed_members(h: &Harness, n: i32) {
    let mut uow = h.source.begin().unwrap();
    let team_a = uow.save(Team::new("teamA")).unwrap();
    let team_b = uow.save(Team::new("teamB")).unwrap();
    for i in 1..=n {
        let team = if i % 2 == 1 { &team_a } else { &team_b };
        uow.save(Member::new(&format!("member{i}"), i * 10, Some(team)))
            .unwrap();
    }
    uow.commit().unwrap();
}

pub fn usernames(members: &[Managed<Member>]) -> Vec<String> {
    members.iter().map(|m| m.borrow().username.clone()).collect()
}
