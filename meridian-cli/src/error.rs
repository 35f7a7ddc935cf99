//! Error types emitted by the meridian CLI.

use std::path::PathBuf;

use meridian_codec::CodecError;
use meridian_core::BoundingBoxError;
use meridian_store::StoreError;
use thiserror::Error;

/// Errors emitted by the meridian CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// A `--bbox` value was not four comma-separated degrees.
    #[error("invalid bounding box {value:?}: {reason}")]
    InvalidBbox {
        /// The raw argument.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// An `--ids` value was not a comma-separated integer list.
    #[error("invalid id list {value:?}")]
    InvalidIds {
        /// The raw argument.
        value: String,
    },
    /// The bounding box failed validation.
    #[error(transparent)]
    BoundingBox(#[from] BoundingBoxError),
    /// The store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Encoding or decoding a stream failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Reading or writing a file failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
