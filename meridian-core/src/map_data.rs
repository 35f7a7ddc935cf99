//! The in-memory map graph assembled per query or per decode.

use std::collections::HashMap;

use thiserror::Error;

use crate::coord::BoundingBox;
use crate::element::{Element, ElementKind, Node, Relation, Way};

/// A dangling reference in a subgraph that was expected to be closed.
///
/// Relation members that reference other relations are exempt: the query
/// engine includes those by id without expanding them further, so a closed
/// subgraph may legitimately name a relation it does not contain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    /// A way references a node absent from the model.
    #[error("way {way} references node {node} which is not in the model")]
    DanglingWayNode {
        /// Referencing way id.
        way: i64,
        /// Missing node id.
        node: i64,
    },
    /// A relation references a node or way absent from the model.
    #[error("relation {relation} references {kind} {member} which is not in the model")]
    DanglingMember {
        /// Referencing relation id.
        relation: i64,
        /// Kind of the missing member.
        kind: ElementKind,
        /// Missing member id.
        member: i64,
    },
}

/// Errors raised when populating a [`MapData`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapDataError {
    /// An element with the same `(kind, id)` is already present.
    #[error("duplicate {kind} {id} in map data")]
    Duplicate {
        /// Kind of the duplicated element.
        kind: ElementKind,
        /// Duplicated identifier.
        id: i64,
    },
}

/// An in-memory subgraph of the map.
///
/// Instances are created per query or per decode, populated once in document
/// order (nodes, then ways, then relations for the interchange formats),
/// then serialised or fed to the replication engine and discarded. Elements
/// are addressed by `(kind, id)`; identifiers are unique within each kind.
///
/// # Examples
///
/// ```
/// use meridian_core::{MapData, Metadata, Node, Tags};
///
/// let mut map = MapData::new();
/// let node = Node::from_degrees(1, 50.73, -1.05, Tags::new(), Metadata::default())?;
/// map.insert_node(node)?;
/// assert!(map.node(1).is_some());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapData {
    bounds: Option<BoundingBox>,
    nodes: Vec<Node>,
    ways: Vec<Way>,
    relations: Vec<Relation>,
    node_index: HashMap<i64, usize>,
    way_index: HashMap<i64, usize>,
    relation_index: HashMap<i64, usize>,
}

impl MapData {
    /// An empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The bounding box marker, if any.
    #[must_use]
    pub const fn bounds(&self) -> Option<&BoundingBox> {
        self.bounds.as_ref()
    }

    /// Attach a bounding box marker.
    pub fn set_bounds(&mut self, bounds: BoundingBox) {
        self.bounds = Some(bounds);
    }

    /// Nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Ways in insertion order.
    #[must_use]
    pub fn ways(&self) -> &[Way] {
        &self.ways
    }

    /// Relations in insertion order.
    #[must_use]
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Total element count across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }

    /// Whether the model holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: i64) -> Option<&Node> {
        self.node_index.get(&id).map(|&i| &self.nodes[i])
    }

    /// Look up a way by id.
    #[must_use]
    pub fn way(&self, id: i64) -> Option<&Way> {
        self.way_index.get(&id).map(|&i| &self.ways[i])
    }

    /// Look up a relation by id.
    #[must_use]
    pub fn relation(&self, id: i64) -> Option<&Relation> {
        self.relation_index.get(&id).map(|&i| &self.relations[i])
    }

    /// Whether an element with the given address is present.
    #[must_use]
    pub fn contains(&self, kind: ElementKind, id: i64) -> bool {
        match kind {
            ElementKind::Node => self.node_index.contains_key(&id),
            ElementKind::Way => self.way_index.contains_key(&id),
            ElementKind::Relation => self.relation_index.contains_key(&id),
        }
    }

    /// Insert a node, rejecting duplicates.
    pub fn insert_node(&mut self, node: Node) -> Result<(), MapDataError> {
        if self.node_index.contains_key(&node.id) {
            return Err(MapDataError::Duplicate {
                kind: ElementKind::Node,
                id: node.id,
            });
        }
        self.push_node(node);
        Ok(())
    }

    /// Insert a way, rejecting duplicates.
    pub fn insert_way(&mut self, way: Way) -> Result<(), MapDataError> {
        if self.way_index.contains_key(&way.id) {
            return Err(MapDataError::Duplicate {
                kind: ElementKind::Way,
                id: way.id,
            });
        }
        self.push_way(way);
        Ok(())
    }

    /// Insert a relation, rejecting duplicates.
    pub fn insert_relation(&mut self, relation: Relation) -> Result<(), MapDataError> {
        if self.relation_index.contains_key(&relation.id) {
            return Err(MapDataError::Duplicate {
                kind: ElementKind::Relation,
                id: relation.id,
            });
        }
        self.push_relation(relation);
        Ok(())
    }

    /// Insert any element, rejecting duplicates.
    pub fn insert(&mut self, element: Element) -> Result<(), MapDataError> {
        match element {
            Element::Node(n) => self.insert_node(n),
            Element::Way(w) => self.insert_way(w),
            Element::Relation(r) => self.insert_relation(r),
        }
    }

    pub(crate) fn push_node(&mut self, node: Node) {
        self.node_index.insert(node.id, self.nodes.len());
        self.nodes.push(node);
    }

    pub(crate) fn push_way(&mut self, way: Way) {
        self.way_index.insert(way.id, self.ways.len());
        self.ways.push(way);
    }

    pub(crate) fn push_relation(&mut self, relation: Relation) {
        self.relation_index.insert(relation.id, self.relations.len());
        self.relations.push(relation);
    }

    /// Merge another model into this one, skipping elements already present.
    ///
    /// Used by the query engine to combine per-stage result sets without
    /// emitting duplicates. The first occurrence of each `(kind, id)` wins.
    pub fn merge(&mut self, other: Self) {
        for node in other.nodes {
            if !self.node_index.contains_key(&node.id) {
                self.push_node(node);
            }
        }
        for way in other.ways {
            if !self.way_index.contains_key(&way.id) {
                self.push_way(way);
            }
        }
        for relation in other.relations {
            if !self.relation_index.contains_key(&relation.id) {
                self.push_relation(relation);
            }
        }
        if self.bounds.is_none() {
            self.bounds = other.bounds;
        }
    }

    /// Verify referential closure.
    ///
    /// Every way node reference and every relation node/way member must
    /// resolve within this model; the first dangling reference is returned.
    /// Relation → relation members are exempt (one-level closure).
    pub fn verify_closure(&self) -> Result<(), ReferenceError> {
        for way in &self.ways {
            for &node_id in &way.refs {
                if !self.node_index.contains_key(&node_id) {
                    return Err(ReferenceError::DanglingWayNode {
                        way: way.id,
                        node: node_id,
                    });
                }
            }
        }
        for relation in &self.relations {
            for member in &relation.members {
                let present = match member.kind {
                    ElementKind::Node => self.node_index.contains_key(&member.id),
                    ElementKind::Way => self.way_index.contains_key(&member.id),
                    ElementKind::Relation => continue,
                };
                if !present {
                    return Err(ReferenceError::DanglingMember {
                        relation: relation.id,
                        kind: member.kind,
                        member: member.id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop tombstoned elements, keeping only live data.
    pub fn retain_visible(&mut self) {
        self.nodes.retain(|n| n.meta.visible);
        self.ways.retain(|w| w.meta.visible);
        self.relations.retain(|r| r.meta.visible);
        self.rebuild_indexes();
    }

    fn rebuild_indexes(&mut self) {
        self.node_index = self.nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        self.way_index = self.ways.iter().enumerate().map(|(i, w)| (w.id, i)).collect();
        self.relation_index = self
            .relations
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Member, Metadata};
    use crate::tags::Tags;
    use rstest::{fixture, rstest};

    fn node(id: i64) -> Node {
        Node::from_degrees(id, 1.0, 2.0, Tags::new(), Metadata::default()).unwrap()
    }

    fn way(id: i64, refs: &[i64]) -> Way {
        Way::new(id, refs.to_vec(), Tags::new(), Metadata::default()).unwrap()
    }

    #[fixture]
    fn closed_map() -> MapData {
        let mut map = MapData::new();
        map.insert_node(node(1)).unwrap();
        map.insert_node(node(2)).unwrap();
        map.insert_way(way(10, &[1, 2])).unwrap();
        map
    }

    #[rstest]
    fn rejects_duplicate_ids(mut closed_map: MapData) {
        let result = closed_map.insert_node(node(1));
        assert_eq!(
            result,
            Err(MapDataError::Duplicate {
                kind: ElementKind::Node,
                id: 1
            })
        );
    }

    #[rstest]
    fn same_id_different_kind_is_allowed(mut closed_map: MapData) {
        // Node 1 exists; way 1 is a different address.
        closed_map.insert_way(way(1, &[1])).unwrap();
        assert!(closed_map.contains(ElementKind::Way, 1));
    }

    #[rstest]
    fn closure_detects_dangling_way_node(mut closed_map: MapData) {
        closed_map.insert_way(way(11, &[1, 99])).unwrap();
        assert_eq!(
            closed_map.verify_closure(),
            Err(ReferenceError::DanglingWayNode { way: 11, node: 99 })
        );
    }

    #[rstest]
    fn closure_exempts_relation_members_of_relation_kind(mut closed_map: MapData) {
        let members = vec![
            Member::new(ElementKind::Way, 10, "outer"),
            Member::new(ElementKind::Relation, 555, "subarea"),
        ];
        closed_map
            .insert_relation(Relation::new(20, members, Tags::new(), Metadata::default()))
            .unwrap();
        assert_eq!(closed_map.verify_closure(), Ok(()));
    }

    #[rstest]
    fn closure_detects_dangling_relation_member(mut closed_map: MapData) {
        let members = vec![Member::new(ElementKind::Node, 42, "stop")];
        closed_map
            .insert_relation(Relation::new(21, members, Tags::new(), Metadata::default()))
            .unwrap();
        assert_eq!(
            closed_map.verify_closure(),
            Err(ReferenceError::DanglingMember {
                relation: 21,
                kind: ElementKind::Node,
                member: 42
            })
        );
    }

    #[rstest]
    fn merge_skips_duplicates(closed_map: MapData) {
        let mut other = MapData::new();
        other.insert_node(node(2)).unwrap();
        other.insert_node(node(3)).unwrap();

        let mut target = closed_map;
        target.merge(other);
        assert_eq!(target.nodes().len(), 3);
    }

    #[rstest]
    fn retain_visible_drops_tombstones(mut closed_map: MapData) {
        let mut tombstone = node(5);
        tombstone.meta.visible = false;
        closed_map.insert_node(tombstone).unwrap();

        closed_map.retain_visible();
        assert!(closed_map.node(5).is_none());
        assert!(closed_map.node(1).is_some());
    }
}
