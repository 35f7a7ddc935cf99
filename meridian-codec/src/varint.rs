//! LEB128 varints and zig-zag signed encoding.
//!
//! Shared by the compact record stream and the block format's wire layer.
//! Reads fail loudly on end-of-stream: a varint cut short is a truncated
//! record, never a silent stop.

use std::io::{Read, Write};

use crate::error::{CodecError, FormatError};

const MAX_VARINT_BYTES: u32 = 10;

/// Map a signed value onto the unsigned zig-zag domain.
#[must_use]
pub const fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag`].
#[must_use]
pub const fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Number of bytes [`write_uvarint`] will emit for `value`.
#[must_use]
pub const fn uvarint_len(mut value: u64) -> u64 {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Write an unsigned LEB128 varint, returning the bytes written.
pub fn write_uvarint<W: Write>(out: &mut W, mut value: u64) -> Result<u64, CodecError> {
    let mut written = 0u64;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.write_all(&[byte])?;
        written += 1;
        if value == 0 {
            return Ok(written);
        }
    }
}

/// Write a zig-zag signed varint, returning the bytes written.
pub fn write_svarint<W: Write>(out: &mut W, value: i64) -> Result<u64, CodecError> {
    write_uvarint(out, zigzag(value))
}

/// Read an unsigned LEB128 varint.
///
/// `context` names the field being read so truncation errors carry their
/// position in the record.
pub fn read_uvarint<R: Read>(input: &mut R, context: &'static str) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for _ in 0..MAX_VARINT_BYTES {
        let byte = read_byte(input, context)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(FormatError::OverlongVarint { context }.into())
}

/// Read a zig-zag signed varint.
pub fn read_svarint<R: Read>(input: &mut R, context: &'static str) -> Result<i64, CodecError> {
    read_uvarint(input, context).map(unzigzag)
}

/// Read exactly one byte, reporting end-of-stream as truncation.
pub fn read_byte<R: Read>(input: &mut R, context: &'static str) -> Result<u8, CodecError> {
    let mut buf = [0u8; 1];
    match input.read_exact(&mut buf) {
        Ok(()) => Ok(buf[0]),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FormatError::Truncated { context }.into())
        }
        Err(err) => Err(err.into()),
    }
}

/// Read exactly `len` bytes, reporting end-of-stream as truncation.
pub fn read_exact<R: Read>(
    input: &mut R,
    len: usize,
    context: &'static str,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; len];
    match input.read_exact(&mut buf) {
        Ok(()) => Ok(buf),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FormatError::Truncated { context }.into())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(127)]
    #[case(128)]
    #[case(300)]
    #[case(u64::MAX)]
    fn uvarint_round_trips(#[case] value: u64) {
        let mut buf = Vec::new();
        let written = write_uvarint(&mut buf, value).unwrap();
        assert_eq!(written, uvarint_len(value));
        assert_eq!(written as usize, buf.len());
        let mut cursor = buf.as_slice();
        assert_eq!(read_uvarint(&mut cursor, "test").unwrap(), value);
        assert!(cursor.is_empty());
    }

    #[rstest]
    #[case(0)]
    #[case(-1)]
    #[case(1)]
    #[case(i64::MIN)]
    #[case(i64::MAX)]
    #[case(-50_736_020_600)]
    fn svarint_round_trips(#[case] value: i64) {
        let mut buf = Vec::new();
        write_svarint(&mut buf, value).unwrap();
        let mut cursor = buf.as_slice();
        assert_eq!(read_svarint(&mut cursor, "test").unwrap(), value);
    }

    #[rstest]
    fn zigzag_orders_small_magnitudes_first() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(-2), 3);
        assert_eq!(unzigzag(zigzag(i64::MIN)), i64::MIN);
    }

    #[rstest]
    fn truncated_varint_is_an_error() {
        // High bit set promises a continuation byte that never arrives.
        let mut cursor: &[u8] = &[0x80];
        let err = read_uvarint(&mut cursor, "node id").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::Truncated { context: "node id" })
        ));
    }

    #[rstest]
    fn overlong_varint_is_an_error() {
        let mut cursor: &[u8] = &[0xff; 11];
        let err = read_uvarint(&mut cursor, "len").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::OverlongVarint { .. })
        ));
    }
}
