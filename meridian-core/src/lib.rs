//! Core domain types for the meridian map-data engine.
//!
//! This crate holds the in-memory map graph — nodes, ways, relations, their
//! ordered tags and metadata — together with the changeset model and the
//! tag/kind filter engine. Constructors validate their input and return
//! `Result` to surface bad data early; the store and codec crates build on
//! these invariants.

#![forbid(unsafe_code)]

mod changeset;
mod coord;
mod element;
mod filter;
mod map_data;
mod tags;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use changeset::{ChangeAction, ChangeEntry, Changeset, ChangesetError};
pub use coord::{BoundingBox, BoundingBoxError, NANOS_PER_DEGREE, NanoDegrees};
pub use element::{Element, ElementError, ElementKind, Member, Metadata, Node, Relation, Way};
pub use filter::{Filter, FilterOptions, KindMask, TagRule};
pub use map_data::{MapData, MapDataError, ReferenceError};
pub use tags::Tags;
