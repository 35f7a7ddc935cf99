//! The compact binary format: a typed, delta-encoded record stream.
//!
//! Layout (all integers are LEB128 varints; `svarint` means zig-zag signed):
//!
//! ```text
//! stream   := header record* end
//! header   := 0xe0 len "MDC" version(0x01)
//! record   := reset | bbox | node | way | relation
//! reset    := 0xff                                  (clears delta + strings)
//! end      := 0xfe
//! bbox     := 0xdb len svarint{min_lon min_lat max_lon max_lat}   (nanodeg)
//! node     := 0x10 len Δid meta Δlon Δlat pair*
//! way      := 0x11 len Δid meta count Δref{count} pair*
//! relation := 0x12 len Δid meta count member{count} pair*
//! member   := kind(0|1|2) Δmember_id pair(role,"")
//! meta     := version flags(bit0=visible) Δtimestamp Δchangeset uid
//!             pair(user,"")
//! pair     := dist | 0x00 key 0x00 value 0x00
//! ```
//!
//! Deltas are taken against the previous record of the same kind: node,
//! way and relation ids, timestamps and changesets each keep per-kind
//! bases; way node references share one running base across ways; relation
//! member ids keep one base per member kind. A reset record zeroes every
//! base and empties the string table, and is emitted between the node, way
//! and relation sections.
//!
//! String pairs (tag key/value, user, role) are deduplicated through a
//! rolling table of the most recent 15 000 inline pairs; `dist` counts back
//! from the newest entry. Pairs longer than 250 bytes are transmitted but
//! never cached. All per-stream state lives in the encoder/decoder session,
//! never in globals.

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read, Write};

use meridian_core::{
    BoundingBox, ElementKind, MapData, Member, Metadata, NanoDegrees, Node, Relation, Tags, Way,
};

use crate::error::{CodecError, FormatError};
use crate::varint::{
    read_byte, read_exact, read_svarint, read_uvarint, uvarint_len, write_svarint, write_uvarint,
};

const MAGIC: &[u8; 3] = b"MDC";
const FORMAT_VERSION: u8 = 1;

const REC_HEADER: u8 = 0xe0;
const REC_NODE: u8 = 0x10;
const REC_WAY: u8 = 0x11;
const REC_RELATION: u8 = 0x12;
const REC_BBOX: u8 = 0xdb;
const REC_RESET: u8 = 0xff;
const REC_END: u8 = 0xfe;

const TABLE_CAPACITY: usize = 15_000;
const MAX_CACHED_BYTES: usize = 250;

const fn kind_index(kind: ElementKind) -> usize {
    match kind {
        ElementKind::Node => 0,
        ElementKind::Way => 1,
        ElementKind::Relation => 2,
    }
}

const fn kind_code(kind: ElementKind) -> u64 {
    kind_index(kind) as u64
}

fn kind_from_code(code: u64) -> Result<ElementKind, CodecError> {
    match code {
        0 => Ok(ElementKind::Node),
        1 => Ok(ElementKind::Way),
        2 => Ok(ElementKind::Relation),
        other => Err(FormatError::InvalidValue {
            field: "member kind",
            message: format!("unknown kind code {other}"),
        }
        .into()),
    }
}

/// Per-stream delta bases, reset by the reset record.
#[derive(Debug, Default)]
struct DeltaState {
    element_id: [i64; 3],
    lat: i64,
    lon: i64,
    timestamp: [i64; 3],
    changeset: [i64; 3],
    way_ref: i64,
    member_id: [i64; 3],
}

impl DeltaState {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn advance(base: &mut i64, value: i64) -> i64 {
        let delta = value.wrapping_sub(*base);
        *base = value;
        delta
    }

    fn apply(base: &mut i64, delta: i64) -> i64 {
        *base = base.wrapping_add(delta);
        *base
    }
}

/// Rolling dictionary of recently transmitted string pairs.
///
/// Encoder and decoder run the identical caching discipline so that a
/// back-distance always lands on the same entry on both sides.
#[derive(Debug, Default)]
struct StringPairTable {
    entries: VecDeque<(String, String)>,
    index: HashMap<(String, String), u64>,
    inserted: u64,
}

impl StringPairTable {
    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.inserted = 0;
    }

    fn cacheable(key: &str, value: &str) -> bool {
        key.len() + value.len() <= MAX_CACHED_BYTES
    }

    fn cache(&mut self, pair: (String, String)) {
        if self.entries.len() == TABLE_CAPACITY {
            if let Some(evicted) = self.entries.pop_back() {
                let oldest = self.inserted - TABLE_CAPACITY as u64;
                if self.index.get(&evicted) == Some(&oldest) {
                    self.index.remove(&evicted);
                }
            }
        }
        self.index.insert(pair.clone(), self.inserted);
        self.entries.push_front(pair);
        self.inserted += 1;
    }

    fn backref(&self, pair: &(String, String)) -> Option<u64> {
        let at = *self.index.get(pair)?;
        let distance = self.inserted - at;
        (distance <= self.entries.len() as u64).then_some(distance)
    }

    fn write_pair(
        &mut self,
        out: &mut Vec<u8>,
        key: &str,
        value: &str,
    ) -> Result<(), CodecError> {
        if key.as_bytes().contains(&0) || value.as_bytes().contains(&0) {
            return Err(FormatError::InvalidValue {
                field: "string pair",
                message: "embedded NUL byte".to_owned(),
            }
            .into());
        }
        let pair = (key.to_owned(), value.to_owned());
        if let Some(distance) = self.backref(&pair) {
            write_uvarint(out, distance)?;
            return Ok(());
        }
        write_uvarint(out, 0)?;
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
        if Self::cacheable(key, value) {
            self.cache(pair);
        }
        Ok(())
    }

    fn read_pair<R: Read>(&mut self, input: &mut R) -> Result<(String, String), CodecError> {
        let distance = read_uvarint(input, "string pair reference")?;
        if distance == 0 {
            let key = read_nul_terminated(input, "string pair key")?;
            let value = read_nul_terminated(input, "string pair value")?;
            if Self::cacheable(&key, &value) {
                self.cache((key.clone(), value.clone()));
            }
            return Ok((key, value));
        }
        let slot = usize::try_from(distance - 1).ok();
        slot.and_then(|i| self.entries.get(i).cloned()).ok_or_else(|| {
            FormatError::InvalidBackReference {
                distance,
                available: self.entries.len(),
            }
            .into()
        })
    }
}

fn read_nul_terminated<R: Read>(
    input: &mut R,
    context: &'static str,
) -> Result<String, CodecError> {
    let mut bytes = Vec::new();
    loop {
        let byte = read_byte(input, context)?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|_| FormatError::InvalidUtf8 { context }.into())
}

struct Session {
    delta: DeltaState,
    strings: StringPairTable,
}

impl Session {
    fn new() -> Self {
        Self {
            delta: DeltaState::default(),
            strings: StringPairTable::default(),
        }
    }

    fn reset(&mut self) {
        self.delta.reset();
        self.strings.clear();
    }
}

/// Encode a subgraph as a compact record stream, returning the bytes
/// written.
pub fn encode<W: Write>(map: &MapData, out: &mut W) -> Result<u64, CodecError> {
    let mut written = 0u64;
    let mut session = Session::new();
    let mut payload: Vec<u8> = Vec::new();

    payload.extend_from_slice(MAGIC);
    payload.push(FORMAT_VERSION);
    written += emit_record(out, REC_HEADER, &payload)?;

    if let Some(bounds) = map.bounds() {
        payload.clear();
        for value in [
            bounds.min_lon,
            bounds.min_lat,
            bounds.max_lon,
            bounds.max_lat,
        ] {
            write_svarint(&mut payload, NanoDegrees::from_degrees(value).nanos())?;
        }
        written += emit_record(out, REC_BBOX, &payload)?;
    }

    for node in map.nodes() {
        payload.clear();
        encode_node(&mut payload, &mut session, node)?;
        written += emit_record(out, REC_NODE, &payload)?;
    }

    written += emit_marker(out, REC_RESET)?;
    session.reset();
    for way in map.ways() {
        payload.clear();
        encode_way(&mut payload, &mut session, way)?;
        written += emit_record(out, REC_WAY, &payload)?;
    }

    written += emit_marker(out, REC_RESET)?;
    session.reset();
    for relation in map.relations() {
        payload.clear();
        encode_relation(&mut payload, &mut session, relation)?;
        written += emit_record(out, REC_RELATION, &payload)?;
    }

    written += emit_marker(out, REC_END)?;
    Ok(written)
}

fn emit_record<W: Write>(out: &mut W, record: u8, payload: &[u8]) -> Result<u64, CodecError> {
    out.write_all(&[record])?;
    write_uvarint(out, payload.len() as u64)?;
    out.write_all(payload)?;
    Ok(1 + uvarint_len(payload.len() as u64) + payload.len() as u64)
}

fn emit_marker<W: Write>(out: &mut W, record: u8) -> Result<u64, CodecError> {
    out.write_all(&[record])?;
    Ok(1)
}

fn encode_meta(
    out: &mut Vec<u8>,
    session: &mut Session,
    kind: ElementKind,
    meta: &Metadata,
) -> Result<(), CodecError> {
    let idx = kind_index(kind);
    write_uvarint(out, u64::from(meta.version))?;
    write_uvarint(out, u64::from(meta.visible))?;
    write_svarint(
        out,
        DeltaState::advance(&mut session.delta.timestamp[idx], meta.timestamp),
    )?;
    write_svarint(
        out,
        DeltaState::advance(&mut session.delta.changeset[idx], meta.changeset),
    )?;
    write_svarint(out, meta.uid)?;
    session.strings.write_pair(out, &meta.user, "")
}

fn encode_tags(out: &mut Vec<u8>, session: &mut Session, tags: &Tags) -> Result<(), CodecError> {
    for (key, value) in tags {
        session.strings.write_pair(out, key, value)?;
    }
    Ok(())
}

fn encode_node(out: &mut Vec<u8>, session: &mut Session, node: &Node) -> Result<(), CodecError> {
    let idx = kind_index(ElementKind::Node);
    write_svarint(
        out,
        DeltaState::advance(&mut session.delta.element_id[idx], node.id),
    )?;
    encode_meta(out, session, ElementKind::Node, &node.meta)?;
    write_svarint(
        out,
        DeltaState::advance(&mut session.delta.lon, node.lon.nanos()),
    )?;
    write_svarint(
        out,
        DeltaState::advance(&mut session.delta.lat, node.lat.nanos()),
    )?;
    encode_tags(out, session, &node.tags)
}

fn encode_way(out: &mut Vec<u8>, session: &mut Session, way: &Way) -> Result<(), CodecError> {
    let idx = kind_index(ElementKind::Way);
    write_svarint(
        out,
        DeltaState::advance(&mut session.delta.element_id[idx], way.id),
    )?;
    encode_meta(out, session, ElementKind::Way, &way.meta)?;
    write_uvarint(out, way.refs.len() as u64)?;
    for &node_id in &way.refs {
        write_svarint(out, DeltaState::advance(&mut session.delta.way_ref, node_id))?;
    }
    encode_tags(out, session, &way.tags)
}

fn encode_relation(
    out: &mut Vec<u8>,
    session: &mut Session,
    relation: &Relation,
) -> Result<(), CodecError> {
    let idx = kind_index(ElementKind::Relation);
    write_svarint(
        out,
        DeltaState::advance(&mut session.delta.element_id[idx], relation.id),
    )?;
    encode_meta(out, session, ElementKind::Relation, &relation.meta)?;
    write_uvarint(out, relation.members.len() as u64)?;
    for member in &relation.members {
        write_uvarint(out, kind_code(member.kind))?;
        let base = &mut session.delta.member_id[kind_index(member.kind)];
        write_svarint(out, DeltaState::advance(base, member.id))?;
        session.strings.write_pair(out, &member.role, "")?;
    }
    encode_tags(out, session, &relation.tags)
}

/// Decode a compact record stream back into a subgraph.
///
/// Delta decoding is the exact inverse of encoding; end-of-stream inside a
/// record is a [`FormatError::Truncated`] error, and the decoded graph must
/// be referentially closed.
pub fn decode<R: Read>(input: &mut R) -> Result<MapData, CodecError> {
    let mut session = Session::new();
    let mut map = MapData::new();

    let first = read_byte(input, "record type")?;
    if first != REC_HEADER {
        return Err(FormatError::BadMagic {
            expected: "MDC",
            found: vec![first],
        }
        .into());
    }
    let header = read_record_payload(input, "header")?;
    if header.len() != 4 || &header[..3] != MAGIC {
        return Err(FormatError::BadMagic {
            expected: "MDC",
            found: header,
        }
        .into());
    }
    if header[3] != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: header[3],
            supported: FORMAT_VERSION,
        }
        .into());
    }

    loop {
        let record = read_byte(input, "record type")?;
        match record {
            REC_END => break,
            REC_RESET => session.reset(),
            REC_BBOX => {
                let payload = read_record_payload(input, "bbox record")?;
                map.set_bounds(decode_bbox(&payload)?);
            }
            REC_NODE => {
                let payload = read_record_payload(input, "node record")?;
                map.insert_node(decode_node(&payload, &mut session)?)?;
            }
            REC_WAY => {
                let payload = read_record_payload(input, "way record")?;
                map.insert_way(decode_way(&payload, &mut session)?)?;
            }
            REC_RELATION => {
                let payload = read_record_payload(input, "relation record")?;
                map.insert_relation(decode_relation(&payload, &mut session)?)?;
            }
            other => return Err(FormatError::UnknownRecord { record: other }.into()),
        }
    }

    map.verify_closure()?;
    Ok(map)
}

fn read_record_payload<R: Read>(
    input: &mut R,
    context: &'static str,
) -> Result<Vec<u8>, CodecError> {
    let len = read_uvarint(input, context)?;
    let len = usize::try_from(len).map_err(|_| FormatError::InvalidValue {
        field: "record length",
        message: format!("{len} does not fit in memory"),
    })?;
    read_exact(input, len, context)
}

fn decode_bbox(payload: &[u8]) -> Result<BoundingBox, CodecError> {
    let mut cursor = Cursor::new(payload);
    let min_lon = read_svarint(&mut cursor, "bbox min_lon")?;
    let min_lat = read_svarint(&mut cursor, "bbox min_lat")?;
    let max_lon = read_svarint(&mut cursor, "bbox max_lon")?;
    let max_lat = read_svarint(&mut cursor, "bbox max_lat")?;
    ensure_consumed(&cursor, "bbox record")?;
    BoundingBox::new(
        NanoDegrees::from_nanos(min_lon).degrees(),
        NanoDegrees::from_nanos(min_lat).degrees(),
        NanoDegrees::from_nanos(max_lon).degrees(),
        NanoDegrees::from_nanos(max_lat).degrees(),
    )
    .map_err(|err| {
        FormatError::InvalidValue {
            field: "bbox",
            message: err.to_string(),
        }
        .into()
    })
}

fn ensure_consumed(cursor: &Cursor<&[u8]>, context: &'static str) -> Result<(), CodecError> {
    let declared = cursor.get_ref().len() as u64;
    if cursor.position() == declared {
        Ok(())
    } else {
        Err(FormatError::LengthMismatch {
            context,
            declared,
            actual: cursor.position(),
        }
        .into())
    }
}

fn decode_meta(
    cursor: &mut Cursor<&[u8]>,
    session: &mut Session,
    kind: ElementKind,
) -> Result<Metadata, CodecError> {
    let idx = kind_index(kind);
    let version = read_uvarint(cursor, "meta version")?;
    let version = u32::try_from(version).map_err(|_| FormatError::InvalidValue {
        field: "meta version",
        message: format!("{version} exceeds u32"),
    })?;
    let flags = read_uvarint(cursor, "meta flags")?;
    let timestamp = DeltaState::apply(
        &mut session.delta.timestamp[idx],
        read_svarint(cursor, "meta timestamp")?,
    );
    let changeset = DeltaState::apply(
        &mut session.delta.changeset[idx],
        read_svarint(cursor, "meta changeset")?,
    );
    let uid = read_svarint(cursor, "meta uid")?;
    let (user, _) = session.strings.read_pair(cursor)?;
    Ok(Metadata {
        version,
        changeset,
        timestamp,
        uid,
        user,
        visible: flags & 1 == 1,
    })
}

fn decode_tags(cursor: &mut Cursor<&[u8]>, session: &mut Session) -> Result<Tags, CodecError> {
    let mut tags = Tags::new();
    while cursor.position() < cursor.get_ref().len() as u64 {
        let (key, value) = session.strings.read_pair(cursor)?;
        tags.insert(key, value);
    }
    Ok(tags)
}

fn decode_node(payload: &[u8], session: &mut Session) -> Result<Node, CodecError> {
    let mut cursor = Cursor::new(payload);
    let idx = kind_index(ElementKind::Node);
    let id = DeltaState::apply(
        &mut session.delta.element_id[idx],
        read_svarint(&mut cursor, "node id")?,
    );
    let meta = decode_meta(&mut cursor, session, ElementKind::Node)?;
    let lon = DeltaState::apply(&mut session.delta.lon, read_svarint(&mut cursor, "node lon")?);
    let lat = DeltaState::apply(&mut session.delta.lat, read_svarint(&mut cursor, "node lat")?);
    let tags = decode_tags(&mut cursor, session)?;
    let node = Node::new(
        id,
        NanoDegrees::from_nanos(lat),
        NanoDegrees::from_nanos(lon),
        tags,
        meta,
    )?;
    Ok(node)
}

fn decode_way(payload: &[u8], session: &mut Session) -> Result<Way, CodecError> {
    let mut cursor = Cursor::new(payload);
    let idx = kind_index(ElementKind::Way);
    let id = DeltaState::apply(
        &mut session.delta.element_id[idx],
        read_svarint(&mut cursor, "way id")?,
    );
    let meta = decode_meta(&mut cursor, session, ElementKind::Way)?;
    let count = read_uvarint(&mut cursor, "way ref count")?;
    let mut refs = Vec::with_capacity(usize::try_from(count).unwrap_or_default());
    for _ in 0..count {
        refs.push(DeltaState::apply(
            &mut session.delta.way_ref,
            read_svarint(&mut cursor, "way ref")?,
        ));
    }
    let tags = decode_tags(&mut cursor, session)?;
    Ok(Way::new(id, refs, tags, meta)?)
}

fn decode_relation(payload: &[u8], session: &mut Session) -> Result<Relation, CodecError> {
    let mut cursor = Cursor::new(payload);
    let idx = kind_index(ElementKind::Relation);
    let id = DeltaState::apply(
        &mut session.delta.element_id[idx],
        read_svarint(&mut cursor, "relation id")?,
    );
    let meta = decode_meta(&mut cursor, session, ElementKind::Relation)?;
    let count = read_uvarint(&mut cursor, "relation member count")?;
    let mut members = Vec::with_capacity(usize::try_from(count).unwrap_or_default());
    for _ in 0..count {
        let kind = kind_from_code(read_uvarint(&mut cursor, "member kind")?)?;
        let base = &mut session.delta.member_id[kind_index(kind)];
        let member_id = DeltaState::apply(base, read_svarint(&mut cursor, "member id")?);
        let (role, _) = session.strings.read_pair(&mut cursor)?;
        members.push(Member::new(kind, member_id, role));
    }
    let tags = decode_tags(&mut cursor, session)?;
    Ok(Relation::new(id, members, tags, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::test_support::sample_map;
    use rstest::rstest;

    #[rstest]
    fn round_trips_sample_map() {
        let map = sample_map();
        let mut buf = Vec::new();
        let written = encode(&map, &mut buf).unwrap();
        assert_eq!(written, buf.len() as u64);

        let decoded = decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, map);
    }

    #[rstest]
    fn rejects_bad_magic() {
        let err = decode(&mut &b"not a stream"[..]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::BadMagic { .. })
        ));
    }

    #[rstest]
    fn rejects_unsupported_version() {
        let mut buf = Vec::new();
        encode(&MapData::new(), &mut buf).unwrap();
        buf[5] = 9; // version byte inside the header payload
        let err = decode(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[rstest]
    fn truncated_stream_is_an_error() {
        let map = sample_map();
        let mut buf = Vec::new();
        encode(&map, &mut buf).unwrap();
        buf.truncate(buf.len() / 2);

        let err = decode(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CodecError::Format(FormatError::Truncated { .. })));
    }

    #[rstest]
    fn missing_end_record_is_truncation() {
        let map = sample_map();
        let mut buf = Vec::new();
        encode(&map, &mut buf).unwrap();
        buf.pop(); // drop the end marker

        let err = decode(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::Truncated {
                context: "record type"
            })
        ));
    }

    #[rstest]
    fn string_table_round_trips_repeated_pairs() {
        let mut encoder = StringPairTable::default();
        let mut buf = Vec::new();
        encoder.write_pair(&mut buf, "highway", "primary").unwrap();
        encoder.write_pair(&mut buf, "highway", "primary").unwrap();

        let mut decoder = StringPairTable::default();
        let mut cursor = Cursor::new(buf.as_slice());
        let first = decoder.read_pair(&mut cursor).unwrap();
        let second = decoder.read_pair(&mut cursor).unwrap();
        assert_eq!(first, ("highway".to_owned(), "primary".to_owned()));
        assert_eq!(first, second);
        // The second occurrence is a 1-byte back-reference.
        assert!(buf.len() < 2 * "highwayprimary".len());
    }

    #[rstest]
    fn oversized_pairs_are_never_cached() {
        let big = "x".repeat(MAX_CACHED_BYTES);
        let mut table = StringPairTable::default();
        let mut buf = Vec::new();
        table.write_pair(&mut buf, &big, "v").unwrap();
        assert!(table.entries.is_empty());
    }

    #[rstest]
    fn invalid_backreference_is_an_error() {
        let mut table = StringPairTable::default();
        let mut buf = Vec::new();
        write_uvarint(&mut buf, 3).unwrap(); // distance 3 into an empty table
        let err = table.read_pair(&mut Cursor::new(buf.as_slice())).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::InvalidBackReference {
                distance: 3,
                available: 0
            })
        ));
    }

    #[rstest]
    fn dangling_way_reference_fails_closure() {
        let mut map = MapData::new();
        map.insert_way(
            Way::new(
                1,
                vec![42],
                Tags::new(),
                Metadata::default(),
            )
            .unwrap(),
        )
        .unwrap();
        let mut buf = Vec::new();
        encode(&map, &mut buf).unwrap();

        let err = decode(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CodecError::Reference(_)));
    }
}
