//! Shared fixtures for tests across the workspace.
//!
//! Enabled through the `test-support` feature so downstream crates can build
//! realistic subgraphs without repeating construction boilerplate.

use crate::{
    BoundingBox, Element, ElementKind, MapData, Member, Metadata, NanoDegrees, Node, Relation,
    Tags, Way,
};

/// Metadata with distinguishable provenance for round-trip assertions.
#[must_use]
pub fn meta(version: u32, changeset: i64, timestamp: i64) -> Metadata {
    Metadata {
        version,
        changeset,
        timestamp,
        uid: 17,
        user: "surveyor".to_owned(),
        visible: true,
    }
}

/// A node at the given degree coordinates.
///
/// # Panics
/// Panics when the coordinates are out of range; fixtures use valid input.
#[must_use]
pub fn node(id: i64, lat: f64, lon: f64) -> Node {
    Node::from_degrees(id, lat, lon, Tags::new(), meta(1, 100, 1_500_000_000))
        .expect("fixture coordinates are valid")
}

/// A node carrying the given tags.
///
/// # Panics
/// Panics when the coordinates are out of range; fixtures use valid input.
#[must_use]
pub fn tagged_node(id: i64, lat: f64, lon: f64, tags: &[(&str, &str)]) -> Node {
    let tags: Tags = tags.iter().copied().collect();
    Node::from_degrees(id, lat, lon, tags, meta(1, 100, 1_500_000_000))
        .expect("fixture coordinates are valid")
}

/// A way over the given node references.
///
/// # Panics
/// Panics on an empty reference list; fixtures pass at least one.
#[must_use]
pub fn way(id: i64, refs: &[i64], tags: &[(&str, &str)]) -> Way {
    let tags: Tags = tags.iter().copied().collect();
    Way::new(id, refs.to_vec(), tags, meta(2, 101, 1_500_000_100)).expect("fixture refs non-empty")
}

/// A relation over the given members.
#[must_use]
pub fn relation(id: i64, members: Vec<Member>, tags: &[(&str, &str)]) -> Relation {
    let tags: Tags = tags.iter().copied().collect();
    Relation::new(id, members, tags, meta(3, 102, 1_500_000_200))
}

/// A closed subgraph exercising every element kind, tag ordering, negative
/// deltas and a relation → relation reference.
///
/// # Panics
/// Panics only if the fixture itself is inconsistent.
#[must_use]
pub fn sample_map() -> MapData {
    let mut map = MapData::new();
    map.set_bounds(
        BoundingBox::new(-1.1473846, 50.7360206, -0.9901428, 50.8649113)
            .expect("fixture bbox is valid"),
    );

    map.insert_node(tagged_node(
        1001,
        50.7900000,
        -1.0910000,
        &[("amenity", "pub"), ("name", "The Anchor")],
    ))
    .expect("fresh id");
    map.insert_node(node(1002, 50.7910001, -1.0920002)).expect("fresh id");
    // Deliberately out-of-box: closure must still carry it.
    map.insert_node(node(1003, 50.9000000, -0.9000000)).expect("fresh id");

    map.insert_way(way(
        2001,
        &[1001, 1002, 1003],
        &[("highway", "residential"), ("name", "Quay Lane")],
    ))
    .expect("fresh id");

    map.insert_relation(relation(
        3001,
        vec![
            Member::new(ElementKind::Way, 2001, "outer"),
            Member::new(ElementKind::Node, 1001, "entrance"),
            Member::new(ElementKind::Relation, 3999, "subarea"),
        ],
        &[("type", "multipolygon")],
    ))
    .expect("fresh id");

    map
}

/// The sample map flattened into create entries for replication tests.
#[must_use]
pub fn sample_elements() -> Vec<Element> {
    let map = sample_map();
    let mut elements: Vec<Element> = Vec::new();
    elements.extend(map.nodes().iter().cloned().map(Element::Node));
    elements.extend(map.ways().iter().cloned().map(Element::Way));
    elements.extend(map.relations().iter().cloned().map(Element::Relation));
    elements
}
