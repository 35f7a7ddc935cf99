//! Error taxonomy for the wire formats.
//!
//! A [`FormatError`] is always local to one decode call and never corrupts
//! the in-memory model; reference and model violations get their own kinds
//! so callers can distinguish a damaged stream from an inconsistent graph.

use std::io;

use meridian_core::{ElementError, MapDataError, ReferenceError};
use thiserror::Error;

/// A malformed, truncated or internally inconsistent wire payload.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The stream did not begin with the expected magic bytes.
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// Magic the decoder was looking for.
        expected: &'static str,
        /// Bytes actually read.
        found: Vec<u8>,
    },
    /// The stream declares a format version this build cannot read.
    #[error("unsupported format version {found}; supported version is {supported}")]
    UnsupportedVersion {
        /// Version present in the stream.
        found: u8,
        /// Latest version supported by this decoder.
        supported: u8,
    },
    /// An unknown record type byte.
    #[error("unknown record type {record:#04x}")]
    UnknownRecord {
        /// The unrecognised type byte.
        record: u8,
    },
    /// End of stream in the middle of a record.
    #[error("truncated stream while reading {context}")]
    Truncated {
        /// What was being read when the stream ended.
        context: &'static str,
    },
    /// A declared length did not match the bytes actually present.
    #[error("length mismatch in {context}: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Structure whose length was being checked.
        context: &'static str,
        /// Length declared by the stream.
        declared: u64,
        /// Length observed.
        actual: u64,
    },
    /// A varint ran past its maximum width.
    #[error("varint exceeds 10 bytes while reading {context}")]
    OverlongVarint {
        /// What was being read.
        context: &'static str,
    },
    /// A string-table back-reference pointed beyond the live table.
    #[error("string table reference {distance} exceeds {available} cached entries")]
    InvalidBackReference {
        /// Requested back-distance.
        distance: u64,
        /// Entries currently cached.
        available: usize,
    },
    /// A wire string was not valid UTF-8.
    #[error("invalid utf-8 in {context}")]
    InvalidUtf8 {
        /// Field holding the string.
        context: &'static str,
    },
    /// A field held a value outside its documented domain.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Explanation.
        message: String,
    },
    /// The same element appeared twice in one stream.
    #[error("duplicate element in stream: {0}")]
    DuplicateElement(MapDataError),
    /// A blob or block declared a type this decoder does not know.
    #[error("unknown block type {found:?}")]
    UnknownBlockType {
        /// Declared type string.
        found: String,
    },
    /// The stream requires a feature this decoder does not implement.
    #[error("unsupported required feature {feature:?}")]
    UnsupportedFeature {
        /// Feature named by the stream header.
        feature: String,
    },
    /// A compressed blob was damaged or lied about its inflated size.
    #[error("bad blob payload: {reason}")]
    InvalidBlob {
        /// Explanation.
        reason: &'static str,
    },
    /// An XML attribute required by the format was missing.
    #[error("<{element}> is missing the {attribute} attribute")]
    MissingAttribute {
        /// Element name.
        element: &'static str,
        /// Missing attribute name.
        attribute: &'static str,
    },
    /// An element appeared where the format does not allow it.
    #[error("unexpected element <{element}>")]
    UnexpectedElement {
        /// Element name as read.
        element: String,
    },
    /// The underlying XML parser rejected the document.
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    /// An XML attribute could not be decoded.
    #[error("malformed xml attribute: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),
}

/// Any failure while encoding or decoding a stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying transport failed.
    #[error("stream i/o failure: {0}")]
    Io(#[from] io::Error),
    /// The payload violated the wire format.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// The decoded graph had a dangling reference.
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    /// A decoded field failed model validation (for example an out-of-range
    /// coordinate).
    #[error("decoded element failed validation: {0}")]
    Model(#[from] ElementError),
}

impl From<MapDataError> for CodecError {
    fn from(err: MapDataError) -> Self {
        Self::Format(FormatError::DuplicateElement(err))
    }
}

impl From<quick_xml::Error> for CodecError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Format(FormatError::Xml(err))
    }
}

impl From<quick_xml::events::attributes::AttrError> for CodecError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Self::Format(FormatError::XmlAttr(err))
    }
}
