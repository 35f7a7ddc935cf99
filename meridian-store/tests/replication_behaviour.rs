//! Replication idempotence, version monotonicity and gap handling.

use std::collections::BTreeSet;

use meridian_core::test_support::{node, tagged_node};
use meridian_core::{ChangeAction, Changeset, Element, ElementKind};
use meridian_store::{
    ReplicationState, SpatialStore, StoreConfig, StoreError, apply_changeset, extract_diff,
    replication_cursor,
};
use rstest::{fixture, rstest};

fn versioned_node(id: i64, version: u32, timestamp: i64) -> Element {
    let mut fixture = node(id, 10.0, 20.0);
    fixture.meta.version = version;
    fixture.meta.timestamp = timestamp;
    Element::Node(fixture)
}

fn tombstoned_node(id: i64, version: u32, timestamp: i64) -> Element {
    let mut fixture = node(id, 10.0, 20.0);
    fixture.meta.version = version;
    fixture.meta.timestamp = timestamp;
    fixture.meta.visible = false;
    Element::Node(fixture)
}

#[fixture]
fn store() -> SpatialStore {
    let store = SpatialStore::open(StoreConfig::in_memory()).expect("open store");
    store.initialise().expect("create schema");
    store
}

#[rstest]
fn applies_ordered_batch_and_advances_cursor(mut store: SpatialStore) {
    let mut changeset = Changeset::new(100);
    changeset.push(1, ChangeAction::Create, versioned_node(1, 1, 1_000));
    changeset.push(2, ChangeAction::Modify, versioned_node(1, 2, 1_010));
    changeset.push(3, ChangeAction::Create, versioned_node(2, 1, 1_020));

    let report = apply_changeset(&mut store, &changeset).unwrap();
    assert_eq!(report.state, ReplicationState::Committed);
    assert_eq!(report.applied, 3);
    assert_eq!(report.stale, 0);
    assert_eq!(replication_cursor(&mut store).unwrap(), Some(100));

    let tx = store.transaction().unwrap();
    assert_eq!(tx.stored_version(ElementKind::Node, 1).unwrap(), Some(2));
    assert_eq!(tx.stored_version(ElementKind::Node, 2).unwrap(), Some(1));
}

#[rstest]
fn reapplying_a_batch_is_idempotent(mut store: SpatialStore) {
    let mut changeset = Changeset::new(100);
    changeset.push(1, ChangeAction::Create, versioned_node(1, 1, 1_000));
    changeset.push(2, ChangeAction::Modify, versioned_node(1, 2, 1_010));

    apply_changeset(&mut store, &changeset).unwrap();
    let second = apply_changeset(&mut store, &changeset).unwrap();

    // Every entry is stale the second time round; the store is unchanged.
    assert_eq!(second.applied, 0);
    assert_eq!(second.stale, 2);
    let tx = store.transaction().unwrap();
    assert_eq!(tx.stored_version(ElementKind::Node, 1).unwrap(), Some(2));
}

#[rstest]
fn version_gap_aborts_the_whole_batch(mut store: SpatialStore) {
    let mut changeset = Changeset::new(200);
    changeset.push(1, ChangeAction::Create, versioned_node(5, 1, 2_000));
    changeset.push(2, ChangeAction::Modify, versioned_node(5, 2, 2_010));
    // Version 3 never arrives: entry 3 jumps straight to 4.
    changeset.push(3, ChangeAction::Modify, versioned_node(5, 4, 2_020));

    let err = apply_changeset(&mut store, &changeset).unwrap_err();
    assert!(matches!(
        err,
        StoreError::ReplicationGap {
            sequence: 3,
            id: 5,
            stored: 2,
            incoming: 4,
            ..
        }
    ));

    // Atomicity: versions 1 and 2 rolled back with the rest.
    let tx = store.transaction().unwrap();
    assert_eq!(tx.stored_version(ElementKind::Node, 5).unwrap(), None);
    drop(tx);
    assert_eq!(replication_cursor(&mut store).unwrap(), None);
}

#[rstest]
fn modify_without_create_is_a_gap(mut store: SpatialStore) {
    let mut changeset = Changeset::new(300);
    changeset.push(1, ChangeAction::Modify, versioned_node(9, 2, 3_000));

    let err = apply_changeset(&mut store, &changeset).unwrap_err();
    assert!(matches!(
        err,
        StoreError::ReplicationGap {
            sequence: 1,
            id: 9,
            stored: 0,
            incoming: 2,
            ..
        }
    ));
}

#[rstest]
fn delete_entries_tombstone_and_stay_monotonic(mut store: SpatialStore) {
    let mut changeset = Changeset::new(400);
    changeset.push(1, ChangeAction::Create, versioned_node(3, 1, 4_000));
    changeset.push(2, ChangeAction::Delete, tombstoned_node(3, 2, 4_010));
    apply_changeset(&mut store, &changeset).unwrap();

    let tx = store.transaction().unwrap();
    assert_eq!(tx.stored_version(ElementKind::Node, 3).unwrap(), Some(2));
    assert!(tx.nodes_by_id(&BTreeSet::from([3])).unwrap().is_empty());
}

#[rstest]
fn out_of_order_batch_is_rejected(mut store: SpatialStore) {
    let mut changeset = Changeset::new(500);
    changeset.push(2, ChangeAction::Create, versioned_node(1, 1, 5_000));
    changeset.push(1, ChangeAction::Create, versioned_node(2, 1, 5_010));

    let err = apply_changeset(&mut store, &changeset).unwrap_err();
    assert!(matches!(err, StoreError::Changeset(_)));
}

#[rstest]
fn extracted_diff_replays_onto_a_replica(mut store: SpatialStore) {
    let mut upstream_batch = Changeset::new(600);
    upstream_batch.push(1, ChangeAction::Create, versioned_node(1, 1, 6_000));
    let mut bench = tagged_node(2, 10.1, 20.1, &[("amenity", "bench")]);
    bench.meta.timestamp = 6_010;
    upstream_batch.push(2, ChangeAction::Create, Element::Node(bench));
    upstream_batch.push(3, ChangeAction::Modify, versioned_node(1, 2, 6_020));
    upstream_batch.push(4, ChangeAction::Delete, tombstoned_node(1, 3, 6_030));
    apply_changeset(&mut store, &upstream_batch).unwrap();

    let diff = extract_diff(&mut store, 0, 10_000, 601).unwrap();
    // The diff reflects the current rows: node 1 as a tombstone delete,
    // node 2 as a create.
    assert_eq!(diff.entries.len(), 2);
    assert_eq!(diff.validate_order(), Ok(()));

    let mut replica = SpatialStore::open(StoreConfig::in_memory()).expect("open replica");
    replica.initialise().expect("create schema");
    let report = apply_changeset(&mut replica, &diff);
    // Node 1 arrives as a delete at version 3 with no predecessors: the
    // replica rejects the gap rather than fake history.
    assert!(matches!(report, Err(StoreError::ReplicationGap { .. })));

    // A replica that had seen versions 1 and 2 accepts the same diff.
    let mut synced = SpatialStore::open(StoreConfig::in_memory()).expect("open replica");
    synced.initialise().expect("create schema");
    let mut history = Changeset::new(599);
    history.push(1, ChangeAction::Create, versioned_node(1, 1, 5_900));
    history.push(2, ChangeAction::Modify, versioned_node(1, 2, 5_910));
    apply_changeset(&mut synced, &history).unwrap();
    let report = apply_changeset(&mut synced, &diff).unwrap();
    assert_eq!(report.applied, 2);
    let tx = synced.transaction().unwrap();
    assert_eq!(tx.stored_version(ElementKind::Node, 1).unwrap(), Some(3));
}

#[rstest]
fn stale_and_gap_mix_commits_only_cleanly(mut store: SpatialStore) {
    let mut first = Changeset::new(700);
    first.push(1, ChangeAction::Create, versioned_node(1, 1, 7_000));
    first.push(2, ChangeAction::Modify, versioned_node(1, 2, 7_010));
    apply_changeset(&mut store, &first).unwrap();

    // Overlapping follow-up: one stale entry, one applicable.
    let mut second = Changeset::new(701);
    second.push(1, ChangeAction::Modify, versioned_node(1, 2, 7_010));
    second.push(2, ChangeAction::Modify, versioned_node(1, 3, 7_020));
    let report = apply_changeset(&mut store, &second).unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(report.applied, 1);

    let tx = store.transaction().unwrap();
    assert_eq!(tx.stored_version(ElementKind::Node, 1).unwrap(), Some(3));
}
