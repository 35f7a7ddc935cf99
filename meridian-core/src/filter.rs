//! Tag and kind predicates over map subgraphs.
//!
//! Filtering reduces a [`MapData`] before serialisation or storage while
//! keeping the referential invariants intact: a way is never emitted without
//! its nodes. The `preserve_closure` option chooses between pulling filtered
//! references back in and dropping the referencing element instead.

use std::collections::HashSet;

use crate::element::ElementKind;
use crate::map_data::MapData;
use crate::tags::Tags;

/// Which element kinds a filter selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMask {
    /// Select nodes.
    pub nodes: bool,
    /// Select ways.
    pub ways: bool,
    /// Select relations.
    pub relations: bool,
}

impl KindMask {
    /// Select every kind.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            nodes: true,
            ways: true,
            relations: true,
        }
    }

    /// Select only the given kind.
    #[must_use]
    pub const fn only(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Node => Self {
                nodes: true,
                ways: false,
                relations: false,
            },
            ElementKind::Way => Self {
                nodes: false,
                ways: true,
                relations: false,
            },
            ElementKind::Relation => Self {
                nodes: false,
                ways: false,
                relations: true,
            },
        }
    }

    const fn allows(self, kind: ElementKind) -> bool {
        match kind {
            ElementKind::Node => self.nodes,
            ElementKind::Way => self.ways,
            ElementKind::Relation => self.relations,
        }
    }
}

impl Default for KindMask {
    fn default() -> Self {
        Self::all()
    }
}

/// A single tag predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagRule {
    /// The key must be present with any value.
    HasKey(String),
    /// The key must be present with exactly this value.
    KeyEquals {
        /// Tag key.
        key: String,
        /// Required value.
        value: String,
    },
    /// The key must be present with one of these values.
    KeyAnyOf {
        /// Tag key.
        key: String,
        /// Accepted values.
        values: Vec<String>,
    },
}

impl TagRule {
    fn matches(&self, tags: &Tags) -> bool {
        match self {
            Self::HasKey(key) => tags.contains_key(key),
            Self::KeyEquals { key, value } => tags.get(key) == Some(value.as_str()),
            Self::KeyAnyOf { key, values } => tags
                .get(key)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
        }
    }
}

/// Options controlling how a filter treats references to excluded elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOptions {
    /// When true, elements referenced by a selected way or relation are
    /// retained even if they fail the predicate. When false, the
    /// referencing way or relation is dropped instead.
    pub preserve_closure: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            preserve_closure: true,
        }
    }
}

/// A stateless predicate evaluator over tags and element kinds.
///
/// All rules must match (conjunction). An empty rule list selects every
/// element of the allowed kinds.
///
/// # Examples
///
/// ```
/// use meridian_core::{Filter, FilterOptions, TagRule};
///
/// let filter = Filter::new().with_rule(TagRule::HasKey("highway".into()));
/// # let map = meridian_core::MapData::new();
/// let reduced = filter.apply(&map, FilterOptions::default());
/// assert!(reduced.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    kinds: KindMask,
    rules: Vec<TagRule>,
}

impl Filter {
    /// A filter selecting everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the selected kinds.
    #[must_use]
    pub const fn with_kinds(mut self, kinds: KindMask) -> Self {
        self.kinds = kinds;
        self
    }

    /// Add a tag rule; all rules must match.
    #[must_use]
    pub fn with_rule(mut self, rule: TagRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn matches(&self, kind: ElementKind, tags: &Tags) -> bool {
        self.kinds.allows(kind) && self.rules.iter().all(|rule| rule.matches(tags))
    }

    /// Apply the filter, producing a reduced subgraph.
    ///
    /// The output always satisfies the closure invariant: with
    /// `preserve_closure` the nodes and ways a selected way or relation
    /// references are carried over from the source even when they fail the
    /// predicate; without it, referencing elements whose targets were
    /// excluded are dropped too. Relation → relation references follow the
    /// one-level closure rule and are never pulled in.
    #[must_use]
    pub fn apply(&self, source: &MapData, options: FilterOptions) -> MapData {
        let mut node_ids: HashSet<i64> = source
            .nodes()
            .iter()
            .filter(|n| self.matches(ElementKind::Node, &n.tags))
            .map(|n| n.id)
            .collect();
        let mut way_ids: HashSet<i64> = source
            .ways()
            .iter()
            .filter(|w| self.matches(ElementKind::Way, &w.tags))
            .map(|w| w.id)
            .collect();
        let mut relation_ids: HashSet<i64> = source
            .relations()
            .iter()
            .filter(|r| self.matches(ElementKind::Relation, &r.tags))
            .map(|r| r.id)
            .collect();

        if options.preserve_closure {
            for relation in source.relations() {
                if !relation_ids.contains(&relation.id) {
                    continue;
                }
                for member in &relation.members {
                    match member.kind {
                        ElementKind::Node => {
                            if source.node(member.id).is_some() {
                                node_ids.insert(member.id);
                            }
                        }
                        ElementKind::Way => {
                            if source.way(member.id).is_some() {
                                way_ids.insert(member.id);
                            }
                        }
                        ElementKind::Relation => {}
                    }
                }
            }
            for way in source.ways() {
                if !way_ids.contains(&way.id) {
                    continue;
                }
                for node_id in &way.refs {
                    if source.node(*node_id).is_some() {
                        node_ids.insert(*node_id);
                    }
                }
            }
        } else {
            way_ids.retain(|id| {
                source
                    .way(*id)
                    .is_some_and(|way| way.refs.iter().all(|r| node_ids.contains(r)))
            });
            relation_ids.retain(|id| {
                source.relation(*id).is_some_and(|relation| {
                    relation.members.iter().all(|member| match member.kind {
                        ElementKind::Node => node_ids.contains(&member.id),
                        ElementKind::Way => way_ids.contains(&member.id),
                        ElementKind::Relation => true,
                    })
                })
            });
        }

        let mut out = MapData::new();
        if let Some(bounds) = source.bounds() {
            out.set_bounds(*bounds);
        }
        for node in source.nodes() {
            if node_ids.contains(&node.id) {
                out.push_node(node.clone());
            }
        }
        for way in source.ways() {
            if way_ids.contains(&way.id) {
                out.push_way(way.clone());
            }
        }
        for relation in source.relations() {
            if relation_ids.contains(&relation.id) {
                out.push_relation(relation.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Member, Metadata, Node, Relation, Way};
    use rstest::{fixture, rstest};

    fn tagged_node(id: i64, tags: &[(&str, &str)]) -> Node {
        let tags: Tags = tags.iter().copied().collect();
        Node::from_degrees(id, 1.0, 2.0, tags, Metadata::default()).unwrap()
    }

    #[fixture]
    fn sample_map() -> MapData {
        let mut map = MapData::new();
        map.insert_node(tagged_node(1, &[("amenity", "pub")])).unwrap();
        map.insert_node(tagged_node(2, &[])).unwrap();
        map.insert_node(tagged_node(3, &[])).unwrap();
        map.insert_way(
            Way::new(
                10,
                vec![2, 3],
                [("highway", "primary")].into_iter().collect(),
                Metadata::default(),
            )
            .unwrap(),
        )
        .unwrap();
        map.insert_relation(Relation::new(
            20,
            vec![Member::new(ElementKind::Way, 10, "outer")],
            [("type", "multipolygon")].into_iter().collect(),
            Metadata::default(),
        ))
        .unwrap();
        map
    }

    #[rstest]
    fn preserve_closure_pulls_way_nodes_back_in(sample_map: MapData) {
        let filter = Filter::new().with_rule(TagRule::HasKey("highway".into()));
        let reduced = filter.apply(&sample_map, FilterOptions::default());

        // Nodes 2 and 3 fail the predicate but are needed by way 10.
        assert!(reduced.way(10).is_some());
        assert!(reduced.node(2).is_some());
        assert!(reduced.node(3).is_some());
        assert!(reduced.node(1).is_none());
        assert_eq!(reduced.verify_closure(), Ok(()));
    }

    #[rstest]
    fn strict_mode_drops_ways_with_filtered_nodes(sample_map: MapData) {
        let filter = Filter::new().with_rule(TagRule::HasKey("highway".into()));
        let reduced = filter.apply(
            &sample_map,
            FilterOptions {
                preserve_closure: false,
            },
        );

        assert!(reduced.is_empty());
    }

    #[rstest]
    fn strict_mode_drops_relations_with_dropped_members(sample_map: MapData) {
        // Selects relations and nodes, but no ways: relation 20 loses way 10.
        let filter = Filter::new().with_kinds(KindMask {
            nodes: true,
            ways: false,
            relations: true,
        });
        let reduced = filter.apply(
            &sample_map,
            FilterOptions {
                preserve_closure: false,
            },
        );

        assert!(reduced.relation(20).is_none());
        assert!(reduced.node(1).is_some());
    }

    #[rstest]
    #[case(TagRule::KeyEquals { key: "amenity".into(), value: "pub".into() }, true)]
    #[case(TagRule::KeyEquals { key: "amenity".into(), value: "bar".into() }, false)]
    #[case(TagRule::KeyAnyOf { key: "amenity".into(), values: vec!["bar".into(), "pub".into()] }, true)]
    fn tag_rules_match_values(#[case] rule: TagRule, #[case] expected: bool) {
        let filter = Filter::new()
            .with_kinds(KindMask::only(ElementKind::Node))
            .with_rule(rule);
        let mut map = MapData::new();
        map.insert_node(tagged_node(1, &[("amenity", "pub")])).unwrap();
        let reduced = filter.apply(&map, FilterOptions::default());
        assert_eq!(reduced.node(1).is_some(), expected);
    }

    #[rstest]
    fn filter_keeps_bounds(sample_map: MapData) {
        let mut map = sample_map;
        let bounds = crate::BoundingBox::new(-1.0, -1.0, 1.0, 1.0).unwrap();
        map.set_bounds(bounds);
        let reduced = Filter::new().apply(&map, FilterOptions::default());
        assert_eq!(reduced.bounds(), Some(&bounds));
    }
}
