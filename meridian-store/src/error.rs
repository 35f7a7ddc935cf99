//! Error types for the spatial store.

use std::path::PathBuf;

use meridian_core::{ChangesetError, ElementError, ElementKind, MapDataError, ReferenceError};
use thiserror::Error;

/// Errors raised by the store, the query resolver and the replication
/// engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening the SQLite database failed.
    #[error("failed to open store database at {path}: {source}")]
    OpenDatabase {
        /// Location of the database on disk.
        path: PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Generic SQLite failure; the enclosing transaction is rolled back.
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    /// The caller-supplied statement deadline expired. The transaction is
    /// rolled back, never leaving a partial result.
    #[error("statement deadline exceeded during {operation}")]
    Timeout {
        /// Operation that ran out of time.
        operation: &'static str,
    },
    /// The bounding box matched more nodes than the caller allowed.
    #[error("query selects {found} nodes, exceeding the configured limit of {limit}")]
    TooManyNodes {
        /// Nodes the box would return.
        found: u64,
        /// Caller-supplied ceiling.
        limit: u64,
    },
    /// A stored tag payload was not valid JSON.
    #[error("failed to parse stored tags for {kind} {id}: {source}")]
    InvalidTags {
        /// Kind of the damaged element.
        kind: ElementKind,
        /// Identifier of the damaged element.
        id: i64,
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A stored member or reference payload was not valid JSON.
    #[error("failed to parse stored references for {kind} {id}: {source}")]
    InvalidRefs {
        /// Kind of the damaged element.
        kind: ElementKind,
        /// Identifier of the damaged element.
        id: i64,
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A stored row failed model validation on the way out.
    #[error("stored {kind} {id} failed validation: {source}")]
    InvalidStored {
        /// Kind of the damaged element.
        kind: ElementKind,
        /// Identifier of the damaged element.
        id: i64,
        /// Validation failure.
        #[source]
        source: ElementError,
    },
    /// A supposedly closed result set had a dangling reference.
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    /// A query stage produced a duplicate element.
    #[error(transparent)]
    MapData(#[from] MapDataError),
    /// The changeset itself was malformed.
    #[error(transparent)]
    Changeset(#[from] ChangesetError),
    /// A changeset entry skipped over a missing predecessor version.
    ///
    /// Fatal for the batch: the transaction is rolled back and the first
    /// offending sequence number is surfaced.
    #[error(
        "changeset entry {sequence} for {kind} {id}: version {incoming} leaves a gap after stored version {stored}"
    )]
    ReplicationGap {
        /// Sequence number of the offending entry.
        sequence: u64,
        /// Kind of the target element.
        kind: ElementKind,
        /// Identifier of the target element.
        id: i64,
        /// Version currently stored (0 when absent).
        stored: u32,
        /// Version the entry carries.
        incoming: u32,
    },
}
