//! Wire formats for meridian map data.
//!
//! Three independent, individually reversible formats share one contract:
//! encode a [`MapData`] subgraph onto a byte stream and decode it back,
//! one record in memory at a time.
//!
//! - [`Format::Compact`] — a typed record stream with zig-zag varint delta
//!   encoding and a rolling string-pair dictionary ([`compact`]).
//! - [`Format::Blocks`] — length-prefixed protobuf-framed blobs with dense
//!   node groups and optional zlib payload compression ([`blocks`]).
//! - [`Format::Xml`] — an element-per-entity text document ([`xml`]).
//!
//! Any of the three can additionally be wrapped in streaming gzip at the
//! transport boundary ([`gzip`]). Formats are a closed set of variants:
//! adding one means adding a variant, not a trait hierarchy.

#![forbid(unsafe_code)]

use std::io::{BufRead, Write};

use meridian_core::MapData;

pub mod blocks;
pub mod compact;
mod error;
pub mod gzip;
mod pbf;
mod varint;
pub mod xml;

pub use blocks::BlockOptions;
pub use error::{CodecError, FormatError};
pub use gzip::MaybeGzip;

/// The supported wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Typed varint/delta record stream.
    Compact,
    /// Protobuf-framed block stream.
    Blocks,
    /// Element-per-entity XML document.
    Xml,
}

impl Format {
    /// Serialise a subgraph, returning the number of bytes written.
    pub fn encode<W: Write>(self, map: &MapData, out: &mut W) -> Result<u64, CodecError> {
        match self {
            Self::Compact => compact::encode(map, out),
            Self::Blocks => blocks::encode(map, out),
            Self::Xml => xml::encode(map, out),
        }
    }

    /// Parse a subgraph back out of a byte stream.
    ///
    /// The decoded graph is checked for referential closure; a dangling way
    /// node or relation member reference aborts the decode.
    pub fn decode<R: BufRead>(self, input: &mut R) -> Result<MapData, CodecError> {
        match self {
            Self::Compact => compact::decode(input),
            Self::Blocks => blocks::decode(input),
            Self::Xml => xml::decode(input),
        }
    }

    /// Conventional file extension for the format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Compact => "mdc",
            Self::Blocks => "pbf",
            Self::Xml => "xml",
        }
    }
}
