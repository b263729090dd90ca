//! Entities with application-assigned keys: persist versus merge.

mod common;

use common::harness;
use datarepo::example::{self, Item};
use datarepo::prelude::*;

#[test]
fn test_new_item_is_persisted_with_audit_stamp() {
    let h = harness();
    let items = example::item_repository(h.source.catalog().clone()).unwrap();
    let mut uow = h.source.begin().unwrap();

    let item = items.save(&mut uow, Item::new("A")).unwrap();
    assert!(item.borrow().created_at.is_some());
    uow.commit().unwrap();
    assert_eq!(h.store.row_count("item").unwrap(), 1);

    let mut uow = h.source.begin().unwrap();
    let stored = items.find_by_id(&mut uow, "A").unwrap().unwrap();
    assert_eq!(stored.borrow().created_at, item.borrow().created_at);
}

#[test]
fn test_stamped_item_merges_into_existing_row() {
    let h = harness();
    let items = example::item_repository(h.source.catalog().clone()).unwrap();
    let mut uow = h.source.begin().unwrap();
    let first = items.save(&mut uow, Item::new("A")).unwrap();
    let stamp = first.borrow().created_at;
    uow.commit().unwrap();

    let mut uow = h.source.begin().unwrap();
    let detached = Item {
        id: "A".to_string(),
        created_at: stamp,
    };
    h.store.reset_stats();
    let merged = items.save(&mut uow, detached).unwrap();
    // merge loads the row instead of inserting
    assert_eq!(h.store.stats().selects, 1);
    assert_eq!(merged.borrow().created_at, stamp);
    uow.commit().unwrap();
    assert_eq!(h.store.stats().inserts, 0);
    assert_eq!(h.store.row_count("item").unwrap(), 1);
}

#[test]
fn test_unsaved_item_with_taken_key_fails_at_flush() {
    let h = harness();
    let items = example::item_repository(h.source.catalog().clone()).unwrap();
    let mut uow = h.source.begin().unwrap();
    items.save(&mut uow, Item::new("A")).unwrap();
    uow.commit().unwrap();

    let mut uow = h.source.begin().unwrap();
    items.save(&mut uow, Item::new("A")).unwrap();
    let err = uow.flush().unwrap_err();
    assert!(matches!(
        err,
        Error::StoreExecution {
            source: StoreError::DuplicateKey { .. },
            ..
        }
    ));
}
