//! Bounding-box and identifier query resolution.
//!
//! A bounding-box query returns every way and relation touching the box
//! together with the full closure of what they reference: a way with one
//! node inside the box and one outside appears whole, with both nodes
//! present. Relation members are resolved one level deep — member nodes and
//! ways are fetched (ways complete with their nodes), member relations are
//! carried by id only, bounding query cost.

use std::collections::BTreeSet;

use log::debug;
use meridian_core::{BoundingBox, ElementKind, MapData, ReferenceError};

use crate::error::StoreError;
use crate::store::StoreTransaction;

/// Knobs for bounding-box queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Abort with [`StoreError::TooManyNodes`] when the box would select
    /// more nodes than this.
    pub max_nodes: Option<u64>,
}

/// Resolve a bounding box into a referentially closed subgraph.
pub fn map_query(
    tx: &StoreTransaction<'_>,
    bbox: &BoundingBox,
    options: QueryOptions,
) -> Result<MapData, StoreError> {
    let mut map = MapData::new();
    map.set_bounds(*bbox);

    // Stage 1: nodes inside the box.
    let nodes = tx.nodes_in_bbox(&bbox.to_rect())?;
    let node_ids: BTreeSet<i64> = nodes.iter().map(|n| n.id).collect();
    enforce_node_limit(options, node_ids.len() as u64)?;
    debug!("bbox query selected {} nodes", node_ids.len());
    for node in nodes {
        map.insert_node(node)?;
    }

    // Stage 2: ways referencing those nodes, whole.
    let ways = tx.ways_containing_nodes(&node_ids)?;
    let way_ids: BTreeSet<i64> = ways.iter().map(|w| w.id).collect();
    let referenced: BTreeSet<i64> = ways.iter().flat_map(|w| w.refs.iter().copied()).collect();
    let extra_nodes: BTreeSet<i64> = referenced.difference(&node_ids).copied().collect();
    enforce_node_limit(options, (node_ids.len() + extra_nodes.len()) as u64)?;
    debug!(
        "{} ways depend on {} out-of-box nodes",
        way_ids.len(),
        extra_nodes.len()
    );

    // Stage 3: complete the ways with their out-of-box nodes.
    for node in tx.nodes_by_id(&extra_nodes)? {
        map.insert_node(node)?;
    }
    for way in ways {
        for &node_id in &way.refs {
            if map.node(node_id).is_none() {
                return Err(ReferenceError::DanglingWayNode {
                    way: way.id,
                    node: node_id,
                }
                .into());
            }
        }
        map.insert_way(way)?;
    }

    // Stage 4: relations referencing any selected node or way.
    let mut seen_relations: BTreeSet<i64> = BTreeSet::new();
    let mut all_nodes = node_ids;
    all_nodes.extend(extra_nodes);
    let mut relations = tx.relations_referencing(ElementKind::Node, &all_nodes, &seen_relations)?;
    seen_relations.extend(relations.iter().map(|r| r.id));
    let for_ways = tx.relations_referencing(ElementKind::Way, &way_ids, &seen_relations)?;
    seen_relations.extend(for_ways.iter().map(|r| r.id));
    relations.extend(for_ways);
    debug!("bbox query selected {} relations", relations.len());

    for relation in relations {
        map.insert_relation(relation)?;
    }
    complete_relation_members(tx, &mut map)?;

    map.verify_closure()?;
    Ok(map)
}

/// Resolve an id set of one kind plus its direct reference closure.
pub fn objects_by_id(
    tx: &StoreTransaction<'_>,
    kind: ElementKind,
    ids: &BTreeSet<i64>,
) -> Result<MapData, StoreError> {
    let mut map = MapData::new();
    match kind {
        ElementKind::Node => {
            for node in tx.nodes_by_id(ids)? {
                map.insert_node(node)?;
            }
        }
        ElementKind::Way => {
            let ways = tx.ways_by_id(ids)?;
            let referenced: BTreeSet<i64> =
                ways.iter().flat_map(|w| w.refs.iter().copied()).collect();
            for node in tx.nodes_by_id(&referenced)? {
                map.insert_node(node)?;
            }
            for way in ways {
                for &node_id in &way.refs {
                    if map.node(node_id).is_none() {
                        return Err(ReferenceError::DanglingWayNode {
                            way: way.id,
                            node: node_id,
                        }
                        .into());
                    }
                }
                map.insert_way(way)?;
            }
        }
        ElementKind::Relation => {
            for relation in tx.relations_by_id(ids)? {
                map.insert_relation(relation)?;
            }
            complete_relation_members(tx, &mut map)?;
        }
    }
    map.verify_closure()?;
    Ok(map)
}

/// Stream the whole store in document order.
pub fn dump(tx: &StoreTransaction<'_>, only_visible: bool) -> Result<MapData, StoreError> {
    let mut map = MapData::new();
    for kind in [ElementKind::Node, ElementKind::Way, ElementKind::Relation] {
        for element in tx.all_of_kind(kind, only_visible)? {
            map.insert(element)?;
        }
    }
    Ok(map)
}

/// Fetch the node and way members the selected relations reference but the
/// model does not yet hold. Member relations stay by-id; member ways are
/// completed with their nodes so the model closes.
fn complete_relation_members(
    tx: &StoreTransaction<'_>,
    map: &mut MapData,
) -> Result<(), StoreError> {
    let mut missing_nodes: BTreeSet<i64> = BTreeSet::new();
    let mut missing_ways: BTreeSet<i64> = BTreeSet::new();
    for relation in map.relations() {
        for member in &relation.members {
            match member.kind {
                ElementKind::Node if map.node(member.id).is_none() => {
                    missing_nodes.insert(member.id);
                }
                ElementKind::Way if map.way(member.id).is_none() => {
                    missing_ways.insert(member.id);
                }
                _ => {}
            }
        }
    }

    let member_ways = tx.ways_by_id(&missing_ways)?;
    for way in &member_ways {
        for &node_id in &way.refs {
            if map.node(node_id).is_none() {
                missing_nodes.insert(node_id);
            }
        }
    }
    for node in tx.nodes_by_id(&missing_nodes)? {
        map.insert_node(node)?;
    }
    for way in member_ways {
        map.insert_way(way)?;
    }
    Ok(())
}

fn enforce_node_limit(options: QueryOptions, found: u64) -> Result<(), StoreError> {
    match options.max_nodes {
        Some(limit) if found > limit => Err(StoreError::TooManyNodes { found, limit }),
        _ => Ok(()),
    }
}
