//! Bounding-box closure and id-query behaviour.

use std::collections::BTreeSet;

use meridian_core::test_support::{tagged_node, way};
use meridian_core::{
    BoundingBox, ChangeAction, Element, ElementKind, Member, Metadata, Relation, Tags,
};
use meridian_store::{
    QueryOptions, SpatialStore, StoreConfig, StoreError, map_query, objects_by_id,
};
use rstest::{fixture, rstest};

fn seed(store: &mut SpatialStore, elements: Vec<Element>) {
    let tx = store.transaction().expect("begin transaction");
    for element in &elements {
        let outcome = tx
            .apply_write(ChangeAction::Create, element, 0)
            .expect("write fixture element");
        assert_eq!(outcome, meridian_store::WriteOutcome::Applied);
    }
    tx.commit().expect("commit fixtures");
}

/// A way crossing the reference box: node 1 inside, node 2 outside.
#[fixture]
fn crossing_way_store() -> SpatialStore {
    let mut store = SpatialStore::open(StoreConfig::in_memory()).expect("open store");
    store.initialise().expect("create schema");
    seed(
        &mut store,
        vec![
            Element::Node(tagged_node(1, 50.8, -1.05, &[("name", "inside")])),
            Element::Node(tagged_node(2, 51.5, -0.5, &[("name", "outside")])),
            Element::Way(way(10, &[1, 2], &[("highway", "track")])),
        ],
    );
    store
}

#[rstest]
fn crossing_way_returns_whole_with_both_nodes(mut crossing_way_store: SpatialStore) {
    let bbox = BoundingBox::new(-1.1473846, 50.7360206, -0.9901428, 50.8649113).unwrap();
    let tx = crossing_way_store.transaction().unwrap();
    let map = map_query(&tx, &bbox, QueryOptions::default()).unwrap();

    assert_eq!(map.ways().len(), 1);
    assert_eq!(map.way(10).unwrap().refs, vec![1, 2]);
    assert!(map.node(1).is_some());
    assert!(map.node(2).is_some(), "out-of-box node must be pulled in");
    assert_eq!(map.verify_closure(), Ok(()));
    assert_eq!(map.bounds(), Some(&bbox));
}

#[rstest]
fn empty_box_returns_empty_subgraph(mut crossing_way_store: SpatialStore) {
    let bbox = BoundingBox::new(10.0, 10.0, 11.0, 11.0).unwrap();
    let tx = crossing_way_store.transaction().unwrap();
    let map = map_query(&tx, &bbox, QueryOptions::default()).unwrap();
    assert!(map.is_empty());
}

#[rstest]
fn node_limit_aborts_before_way_resolution(mut crossing_way_store: SpatialStore) {
    let bbox = BoundingBox::new(-1.1473846, 50.7360206, -0.9901428, 50.8649113).unwrap();
    let tx = crossing_way_store.transaction().unwrap();
    let err = map_query(
        &tx,
        &bbox,
        QueryOptions {
            max_nodes: Some(0),
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        StoreError::TooManyNodes { found: 1, limit: 0 }
    ));
}

#[rstest]
fn relations_for_selected_objects_are_included() {
    let mut store = SpatialStore::open(StoreConfig::in_memory()).expect("open store");
    store.initialise().expect("create schema");
    seed(
        &mut store,
        vec![
            Element::Node(tagged_node(1, 50.8, -1.05, &[])),
            Element::Node(tagged_node(2, 51.5, -0.5, &[])),
            Element::Node(tagged_node(3, 40.0, 3.0, &[("name", "member far away")])),
            Element::Way(way(10, &[1, 2], &[])),
            Element::Relation(Relation::new(
                20,
                vec![
                    Member::new(ElementKind::Way, 10, "outer"),
                    Member::new(ElementKind::Node, 3, "label"),
                    Member::new(ElementKind::Relation, 999, "subarea"),
                ],
                Tags::new(),
                Metadata::default(),
            )),
        ],
    );

    let bbox = BoundingBox::new(-1.1473846, 50.7360206, -0.9901428, 50.8649113).unwrap();
    let tx = store.transaction().unwrap();
    let map = map_query(&tx, &bbox, QueryOptions::default()).unwrap();

    let relation = map.relation(20).expect("relation referencing way 10");
    assert_eq!(relation.members.len(), 3);
    // One-level member completion: the far-away member node is fetched,
    // the member relation stays by id.
    assert!(map.node(3).is_some());
    assert!(map.relation(999).is_none());
    assert_eq!(map.verify_closure(), Ok(()));
}

#[rstest]
fn objects_by_id_closes_over_way_nodes(mut crossing_way_store: SpatialStore) {
    let tx = crossing_way_store.transaction().unwrap();
    let map = objects_by_id(&tx, ElementKind::Way, &BTreeSet::from([10])).unwrap();
    assert!(map.way(10).is_some());
    assert!(map.node(1).is_some());
    assert!(map.node(2).is_some());
    assert_eq!(map.verify_closure(), Ok(()));
}

#[rstest]
fn objects_by_id_skips_unknown_ids(mut crossing_way_store: SpatialStore) {
    let tx = crossing_way_store.transaction().unwrap();
    let map = objects_by_id(&tx, ElementKind::Node, &BTreeSet::from([1, 404])).unwrap();
    assert!(map.node(1).is_some());
    assert_eq!(map.nodes().len(), 1);
}

#[rstest]
fn tombstoned_elements_never_surface(mut crossing_way_store: SpatialStore) {
    {
        let tx = crossing_way_store.transaction().unwrap();
        let mut tombstone = tagged_node(1, 50.8, -1.05, &[]);
        tombstone.meta.version = 2;
        tombstone.meta.visible = false;
        tx.apply_write(ChangeAction::Delete, &Element::Node(tombstone), 1)
            .unwrap();
        let mut dead_way = way(10, &[1, 2], &[]);
        dead_way.meta.version = 3;
        dead_way.meta.visible = false;
        tx.apply_write(ChangeAction::Delete, &Element::Way(dead_way), 2)
            .unwrap();
        tx.commit().unwrap();
    }

    let bbox = BoundingBox::new(-1.1473846, 50.7360206, -0.9901428, 50.8649113).unwrap();
    let tx = crossing_way_store.transaction().unwrap();
    let map = map_query(&tx, &bbox, QueryOptions::default()).unwrap();
    assert!(map.node(1).is_none());
    assert!(map.way(10).is_none());
}
