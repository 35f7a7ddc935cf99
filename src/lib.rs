//! Facade crate for the meridian map-data engine.
//!
//! This crate re-exports the core map-data model and codec surface and
//! exposes the SQLite-backed spatial store behind a feature flag.

#![forbid(unsafe_code)]

pub use meridian_core::{
    BoundingBox, ChangeAction, ChangeEntry, Changeset, Element, ElementKind, Filter,
    FilterOptions, MapData, Member, Metadata, NanoDegrees, Node, ReferenceError, Relation, Tags,
    Way,
};

pub use meridian_codec::{CodecError, Format, FormatError};

#[cfg(feature = "store-sqlite")]
pub use meridian_store::{
    QueryOptions, ReplicationReport, SpatialStore, StoreConfig, StoreError, StorePath,
    WriteOutcome,
};
