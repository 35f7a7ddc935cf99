//! Minimal protobuf wire layer for the block format.
//!
//! The block format needs exactly four wire shapes: varint fields, zig-zag
//! varint fields, length-delimited fields and packed repeated varints, so a
//! schema compiler would be dead weight. Writers append to a `Vec<u8>`;
//! [`PbReader`] walks a byte slice field by field and skips what it does
//! not know, which is how forward compatibility works on this wire.

use crate::error::{CodecError, FormatError};
use crate::varint::{unzigzag, zigzag};

/// Protobuf wire types used by the block format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    /// Base-128 varint.
    Varint,
    /// 8-byte little-endian scalar.
    Fixed64,
    /// Length-delimited bytes.
    Len,
    /// 4-byte little-endian scalar.
    Fixed32,
}

impl WireType {
    fn from_bits(bits: u64) -> Result<Self, FormatError> {
        match bits {
            0 => Ok(Self::Varint),
            1 => Ok(Self::Fixed64),
            2 => Ok(Self::Len),
            5 => Ok(Self::Fixed32),
            other => Err(FormatError::InvalidValue {
                field: "wire type",
                message: format!("unsupported wire type {other}"),
            }),
        }
    }

    const fn bits(self) -> u64 {
        match self {
            Self::Varint => 0,
            Self::Fixed64 => 1,
            Self::Len => 2,
            Self::Fixed32 => 5,
        }
    }
}

fn put_raw_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            return;
        }
    }
}

fn put_key(buf: &mut Vec<u8>, field: u32, wire: WireType) {
    put_raw_uvarint(buf, (u64::from(field) << 3) | wire.bits());
}

/// Append a varint field.
pub fn put_varint(buf: &mut Vec<u8>, field: u32, value: u64) {
    put_key(buf, field, WireType::Varint);
    put_raw_uvarint(buf, value);
}

/// Append a zig-zag signed varint field.
pub fn put_sint(buf: &mut Vec<u8>, field: u32, value: i64) {
    put_varint(buf, field, zigzag(value));
}

/// Append a length-delimited bytes field.
pub fn put_bytes(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_key(buf, field, WireType::Len);
    put_raw_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Append a string field.
pub fn put_string(buf: &mut Vec<u8>, field: u32, value: &str) {
    put_bytes(buf, field, value.as_bytes());
}

/// Append a packed repeated varint field; empty input emits nothing.
pub fn put_packed_varints<I: IntoIterator<Item = u64>>(buf: &mut Vec<u8>, field: u32, values: I) {
    let mut packed = Vec::new();
    for value in values {
        put_raw_uvarint(&mut packed, value);
    }
    if !packed.is_empty() {
        put_bytes(buf, field, &packed);
    }
}

/// Append a packed repeated zig-zag signed varint field.
pub fn put_packed_sints<I: IntoIterator<Item = i64>>(buf: &mut Vec<u8>, field: u32, values: I) {
    put_packed_varints(buf, field, values.into_iter().map(zigzag));
}

/// A field-by-field reader over one encoded message.
#[derive(Debug)]
pub struct PbReader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> PbReader<'a> {
    /// Wrap a message body; `context` labels errors.
    #[must_use]
    pub const fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            context,
        }
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Read the next field key, or `None` at end of message.
    pub fn next_field(&mut self) -> Result<Option<(u32, WireType)>, CodecError> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = self.raw_uvarint()?;
        let wire = WireType::from_bits(key & 0x7)?;
        let field = u32::try_from(key >> 3).map_err(|_| FormatError::InvalidValue {
            field: "field number",
            message: format!("{} exceeds u32", key >> 3),
        })?;
        Ok(Some((field, wire)))
    }

    /// Read a varint value.
    pub fn varint(&mut self) -> Result<u64, CodecError> {
        self.raw_uvarint()
    }

    /// Read a zig-zag signed varint value.
    pub fn sint(&mut self) -> Result<i64, CodecError> {
        self.raw_uvarint().map(unzigzag)
    }

    /// Read a length-delimited byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.raw_uvarint()?;
        let len = usize::try_from(len).map_err(|_| FormatError::InvalidValue {
            field: "length",
            message: format!("{len} does not fit in memory"),
        })?;
        if self.buf.len() - self.pos < len {
            return Err(FormatError::Truncated {
                context: self.context,
            }
            .into());
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a length-delimited UTF-8 string.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let context = self.context;
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FormatError::InvalidUtf8 { context }.into())
    }

    /// Skip a field of the given wire type.
    pub fn skip(&mut self, wire: WireType) -> Result<(), CodecError> {
        match wire {
            WireType::Varint => {
                self.raw_uvarint()?;
            }
            WireType::Fixed64 => self.advance(8)?,
            WireType::Len => {
                self.bytes()?;
            }
            WireType::Fixed32 => self.advance(4)?,
        }
        Ok(())
    }

    /// Iterate the values of a packed varint field.
    pub fn packed_varints(&mut self) -> Result<Vec<u64>, CodecError> {
        let context = self.context;
        let bytes = self.bytes()?;
        let mut inner = Self::new(bytes, context);
        let mut values = Vec::new();
        while !inner.is_empty() {
            values.push(inner.raw_uvarint()?);
        }
        Ok(values)
    }

    /// Iterate the values of a packed zig-zag signed varint field.
    pub fn packed_sints(&mut self) -> Result<Vec<i64>, CodecError> {
        Ok(self.packed_varints()?.into_iter().map(unzigzag).collect())
    }

    fn advance(&mut self, len: usize) -> Result<(), CodecError> {
        if self.buf.len() - self.pos < len {
            return Err(FormatError::Truncated {
                context: self.context,
            }
            .into());
        }
        self.pos += len;
        Ok(())
    }

    fn raw_uvarint(&mut self) -> Result<u64, CodecError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        for _ in 0..10 {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(FormatError::Truncated {
                    context: self.context,
                }
                .into());
            };
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
        Err(FormatError::OverlongVarint {
            context: self.context,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn fields_round_trip() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 1, 42);
        put_sint(&mut buf, 2, -7);
        put_string(&mut buf, 3, "meridian");
        put_packed_sints(&mut buf, 4, [100, -100, 0]);

        let mut reader = PbReader::new(&buf, "test message");
        assert_eq!(reader.next_field().unwrap(), Some((1, WireType::Varint)));
        assert_eq!(reader.varint().unwrap(), 42);
        assert_eq!(reader.next_field().unwrap(), Some((2, WireType::Varint)));
        assert_eq!(reader.sint().unwrap(), -7);
        assert_eq!(reader.next_field().unwrap(), Some((3, WireType::Len)));
        assert_eq!(reader.string().unwrap(), "meridian");
        assert_eq!(reader.next_field().unwrap(), Some((4, WireType::Len)));
        assert_eq!(reader.packed_sints().unwrap(), vec![100, -100, 0]);
        assert_eq!(reader.next_field().unwrap(), None);
    }

    #[rstest]
    fn unknown_fields_can_be_skipped() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 9, 1);
        put_bytes(&mut buf, 10, b"ignore me");
        put_varint(&mut buf, 1, 5);

        let mut reader = PbReader::new(&buf, "test message");
        let mut seen = None;
        while let Some((field, wire)) = reader.next_field().unwrap() {
            if field == 1 {
                seen = Some(reader.varint().unwrap());
            } else {
                reader.skip(wire).unwrap();
            }
        }
        assert_eq!(seen, Some(5));
    }

    #[rstest]
    fn truncated_bytes_field_is_an_error() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, 1, b"payload");
        buf.truncate(buf.len() - 3);

        let mut reader = PbReader::new(&buf, "test message");
        reader.next_field().unwrap();
        let err = reader.bytes().unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::Truncated { .. })
        ));
    }
}
