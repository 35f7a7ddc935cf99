//! Streaming gzip wrapping, orthogonal to the chosen wire format.
//!
//! The adapter sits at the byte-stream boundary: any format can be piped
//! through it without knowing whether the transport is compressed. The
//! writer streams with no length known up front; the reader can sniff the
//! two-byte gzip magic so callers accept wrapped and plain streams alike.
//! Per-blob compression inside the block format is zlib and does not go
//! through this adapter.

use std::io::{self, BufRead, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Wrap a writer in indefinite-length streaming gzip compression.
pub fn compress<W: Write>(out: W) -> GzEncoder<W> {
    GzEncoder::new(out, Compression::default())
}

/// Wrap a reader in streaming gzip decompression.
pub fn decompress<R: Read>(input: R) -> GzDecoder<R> {
    GzDecoder::new(input)
}

/// A reader that transparently decompresses when the stream is gzipped.
///
/// Sniffs the magic bytes without consuming them, so plain streams pass
/// through untouched.
pub enum MaybeGzip<R: BufRead> {
    /// The stream carried the gzip magic.
    Gzip(GzDecoder<R>),
    /// The stream is passed through as-is.
    Plain(R),
}

impl<R: BufRead> MaybeGzip<R> {
    /// Sniff the stream head and pick the matching reader.
    pub fn new(mut input: R) -> io::Result<Self> {
        let head = input.fill_buf()?;
        if head.len() >= 2 && head[..2] == GZIP_MAGIC {
            Ok(Self::Gzip(GzDecoder::new(input)))
        } else {
            Ok(Self::Plain(input))
        }
    }
}

impl<R: BufRead> Read for MaybeGzip<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(inner) => inner.read(buf),
            Self::Plain(inner) => inner.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn round_trips_through_gzip() {
        let payload = b"typed records would go here".repeat(50);
        let mut encoder = compress(Vec::new());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();
        assert!(compressed.len() < payload.len());

        let mut decoded = Vec::new();
        decompress(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[rstest]
    fn sniffing_accepts_both_transports() {
        let payload = b"plain bytes".to_vec();
        let mut via_plain = Vec::new();
        MaybeGzip::new(payload.as_slice())
            .unwrap()
            .read_to_end(&mut via_plain)
            .unwrap();
        assert_eq!(via_plain, payload);

        let mut encoder = compress(Vec::new());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();
        let mut via_gzip = Vec::new();
        MaybeGzip::new(compressed.as_slice())
            .unwrap()
            .read_to_end(&mut via_gzip)
            .unwrap();
        assert_eq!(via_gzip, payload);
    }
}
