//! SQLite-backed spatial store, query resolver and replication engine.
//!
//! The store owns the long-lived state: relational tables of nodes, ways
//! and relations with ordered membership indexes and metadata columns.
//! Queries resolve bounding boxes or id sets into referentially closed
//! [`meridian_core::MapData`] subgraphs; the replication engine applies
//! ordered changeset batches atomically with stale/gap conflict handling.
//! All access runs inside caller-scoped transactions with an optional
//! statement deadline.

#![forbid(unsafe_code)]

mod error;
mod query;
mod replicate;
mod schema;
mod store;

pub use error::StoreError;
pub use query::{QueryOptions, dump, map_query, objects_by_id};
pub use replicate::{
    ReplicationReport, ReplicationState, apply_changeset, extract_diff, replication_cursor,
};
pub use store::{SpatialStore, StoreConfig, StorePath, StoreTransaction, WriteOutcome};
