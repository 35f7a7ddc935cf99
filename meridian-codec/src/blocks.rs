//! The block format: length-prefixed blobs of protobuf-framed map data.
//!
//! Framing follows the OSMPBF layout so independent encoders and decoders
//! interoperate byte for byte:
//!
//! ```text
//! stream     := (u32_be header_len, BlobHeader, Blob)*
//! BlobHeader := { 1: type string, 3: datasize int32 }
//! Blob       := { 1: raw bytes } | { 2: raw_size int32, 3: zlib_data bytes }
//! ```
//!
//! The first blob must be an `OSMHeader` (bbox in nanodegrees, required
//! features); every further blob is `OSMData` holding one `PrimitiveBlock`:
//! a block-local string table (index 0 reserved empty), primitive groups,
//! and the granularity/offset parameters. Nodes are emitted dense — packed
//! struct-of-arrays with delta-encoded id/lat/lon, a `keys_vals` index
//! stream terminated by 0 per node, and parallel dense metadata arrays —
//! while ways and relations are individual messages with delta-encoded
//! member ids and parallel role/type arrays. Zlib-compressed payloads must
//! inflate to exactly the declared `raw_size`.
//!
//! This encoder writes `granularity = 1` (full nanodegree precision) and
//! `date_granularity = 1000` (whole seconds); the decoder honours whatever
//! parameters the stream declares.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use meridian_core::{
    BoundingBox, ElementKind, MapData, Member, Metadata, NanoDegrees, Node, Relation, Tags, Way,
};

use crate::error::{CodecError, FormatError};
use crate::pbf::{
    PbReader, WireType, put_bytes, put_packed_sints, put_packed_varints, put_sint, put_string,
    put_varint,
};
use crate::varint::read_exact;

const BLOCK_TYPE_HEADER: &str = "OSMHeader";
const BLOCK_TYPE_DATA: &str = "OSMData";
const FEATURE_SCHEMA: &str = "OsmSchema-V0.6";
const FEATURE_DENSE: &str = "DenseNodes";
const WRITING_PROGRAM: &str = "meridian";

const MAX_HEADER_BYTES: u64 = 64 * 1024;
const MAX_BLOB_BYTES: u64 = 32 * 1024 * 1024;
const ELEMENTS_PER_BLOCK: usize = 8_000;

const GRANULARITY: i64 = 1;
const DATE_GRANULARITY: i64 = 1000;

/// Options for the block encoder.
#[derive(Debug, Clone, Copy)]
pub struct BlockOptions {
    /// Deflate each blob payload (zlib). Raw payloads decode either way.
    pub compress: bool,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self { compress: true }
    }
}

/// Encode a subgraph as a blob stream with default options.
pub fn encode<W: Write>(map: &MapData, out: &mut W) -> Result<u64, CodecError> {
    encode_with(map, out, BlockOptions::default())
}

/// Encode a subgraph as a blob stream, returning the bytes written.
pub fn encode_with<W: Write>(
    map: &MapData,
    out: &mut W,
    options: BlockOptions,
) -> Result<u64, CodecError> {
    let mut written = 0u64;
    written += write_blob(
        out,
        BLOCK_TYPE_HEADER,
        &encode_header_block(map.bounds()),
        options.compress,
    )?;
    for chunk in map.nodes().chunks(ELEMENTS_PER_BLOCK) {
        written += write_blob(out, BLOCK_TYPE_DATA, &encode_node_block(chunk), options.compress)?;
    }
    for chunk in map.ways().chunks(ELEMENTS_PER_BLOCK) {
        written += write_blob(out, BLOCK_TYPE_DATA, &encode_way_block(chunk), options.compress)?;
    }
    for chunk in map.relations().chunks(ELEMENTS_PER_BLOCK) {
        written += write_blob(
            out,
            BLOCK_TYPE_DATA,
            &encode_relation_block(chunk),
            options.compress,
        )?;
    }
    Ok(written)
}

fn write_blob<W: Write>(
    out: &mut W,
    block_type: &str,
    body: &[u8],
    compress: bool,
) -> Result<u64, CodecError> {
    let mut blob = Vec::new();
    if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body)?;
        let compressed = encoder.finish()?;
        put_varint(&mut blob, 2, body.len() as u64);
        put_bytes(&mut blob, 3, &compressed);
    } else {
        put_bytes(&mut blob, 1, body);
    }

    let mut header = Vec::new();
    put_string(&mut header, 1, block_type);
    put_varint(&mut header, 3, blob.len() as u64);

    let header_len = u32::try_from(header.len()).map_err(|_| FormatError::InvalidValue {
        field: "blob header length",
        message: "header exceeds u32".to_owned(),
    })?;
    out.write_all(&header_len.to_be_bytes())?;
    out.write_all(&header)?;
    out.write_all(&blob)?;
    Ok(4 + header.len() as u64 + blob.len() as u64)
}

/// Block-local string table; index 0 is reserved for the empty string.
struct StringTableBuilder {
    entries: Vec<String>,
    index: HashMap<String, u64>,
}

impl StringTableBuilder {
    fn new() -> Self {
        Self {
            entries: vec![String::new()],
            index: HashMap::from([(String::new(), 0)]),
        }
    }

    fn intern(&mut self, value: &str) -> u64 {
        if let Some(&id) = self.index.get(value) {
            return id;
        }
        let id = self.entries.len() as u64;
        self.entries.push(value.to_owned());
        self.index.insert(value.to_owned(), id);
        id
    }

    fn into_message(self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            put_bytes(&mut buf, 1, entry.as_bytes());
        }
        buf
    }
}

fn encode_header_block(bounds: Option<&BoundingBox>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(bounds) = bounds {
        let mut bbox = Vec::new();
        put_sint(&mut bbox, 1, NanoDegrees::from_degrees(bounds.min_lon).nanos());
        put_sint(&mut bbox, 2, NanoDegrees::from_degrees(bounds.max_lon).nanos());
        put_sint(&mut bbox, 3, NanoDegrees::from_degrees(bounds.max_lat).nanos());
        put_sint(&mut bbox, 4, NanoDegrees::from_degrees(bounds.min_lat).nanos());
        put_bytes(&mut buf, 1, &bbox);
    }
    put_string(&mut buf, 4, FEATURE_SCHEMA);
    put_string(&mut buf, 4, FEATURE_DENSE);
    put_string(&mut buf, 16, WRITING_PROGRAM);
    buf
}

fn timestamp_to_wire(seconds: i64) -> i64 {
    seconds.wrapping_mul(1000) / DATE_GRANULARITY
}

fn encode_info(strings: &mut StringTableBuilder, meta: &Metadata) -> Vec<u8> {
    let mut buf = Vec::new();
    put_varint(&mut buf, 1, u64::from(meta.version));
    put_varint(&mut buf, 2, timestamp_to_wire(meta.timestamp) as u64);
    put_varint(&mut buf, 3, meta.changeset as u64);
    put_varint(&mut buf, 4, meta.uid as u64);
    put_varint(&mut buf, 5, strings.intern(&meta.user));
    put_varint(&mut buf, 6, u64::from(meta.visible));
    buf
}

fn encode_tag_indexes(strings: &mut StringTableBuilder, tags: &Tags) -> (Vec<u64>, Vec<u64>) {
    let mut keys = Vec::with_capacity(tags.len());
    let mut vals = Vec::with_capacity(tags.len());
    for (key, value) in tags {
        keys.push(strings.intern(key));
        vals.push(strings.intern(value));
    }
    (keys, vals)
}

fn wrap_primitive_block(strings: StringTableBuilder, group: Vec<u8>) -> Vec<u8> {
    let mut block = Vec::new();
    put_bytes(&mut block, 1, &strings.into_message());
    put_bytes(&mut block, 2, &group);
    put_varint(&mut block, 17, GRANULARITY as u64);
    put_varint(&mut block, 18, DATE_GRANULARITY as u64);
    block
}

fn encode_node_block(nodes: &[Node]) -> Vec<u8> {
    let mut strings = StringTableBuilder::new();

    let mut ids = Vec::with_capacity(nodes.len());
    let mut lats = Vec::with_capacity(nodes.len());
    let mut lons = Vec::with_capacity(nodes.len());
    let mut keys_vals = Vec::new();
    let mut versions = Vec::with_capacity(nodes.len());
    let mut timestamps = Vec::with_capacity(nodes.len());
    let mut changesets = Vec::with_capacity(nodes.len());
    let mut uids = Vec::with_capacity(nodes.len());
    let mut user_sids = Vec::with_capacity(nodes.len());
    let mut visibles = Vec::with_capacity(nodes.len());

    let mut prev_id = 0i64;
    let mut prev_lat = 0i64;
    let mut prev_lon = 0i64;
    let mut prev_timestamp = 0i64;
    let mut prev_changeset = 0i64;
    let mut prev_uid = 0i64;
    let mut prev_sid = 0i64;
    let mut any_tags = false;

    for node in nodes {
        ids.push(node.id.wrapping_sub(prev_id));
        prev_id = node.id;
        lats.push(node.lat.nanos().wrapping_sub(prev_lat));
        prev_lat = node.lat.nanos();
        lons.push(node.lon.nanos().wrapping_sub(prev_lon));
        prev_lon = node.lon.nanos();

        if !node.tags.is_empty() {
            any_tags = true;
        }
        for (key, value) in &node.tags {
            keys_vals.push(strings.intern(key));
            keys_vals.push(strings.intern(value));
        }
        keys_vals.push(0);

        versions.push(u64::from(node.meta.version));
        let wire_ts = timestamp_to_wire(node.meta.timestamp);
        timestamps.push(wire_ts.wrapping_sub(prev_timestamp));
        prev_timestamp = wire_ts;
        changesets.push(node.meta.changeset.wrapping_sub(prev_changeset));
        prev_changeset = node.meta.changeset;
        uids.push(node.meta.uid.wrapping_sub(prev_uid));
        prev_uid = node.meta.uid;
        let sid = strings.intern(&node.meta.user) as i64;
        user_sids.push(sid.wrapping_sub(prev_sid));
        prev_sid = sid;
        visibles.push(u64::from(node.meta.visible));
    }

    let mut dense_info = Vec::new();
    put_packed_varints(&mut dense_info, 1, versions);
    put_packed_sints(&mut dense_info, 2, timestamps);
    put_packed_sints(&mut dense_info, 3, changesets);
    put_packed_sints(&mut dense_info, 4, uids);
    put_packed_sints(&mut dense_info, 5, user_sids);
    put_packed_varints(&mut dense_info, 6, visibles);

    let mut dense = Vec::new();
    put_packed_sints(&mut dense, 1, ids);
    put_bytes(&mut dense, 5, &dense_info);
    put_packed_sints(&mut dense, 8, lats);
    put_packed_sints(&mut dense, 9, lons);
    if any_tags {
        put_packed_varints(&mut dense, 10, keys_vals);
    }

    let mut group = Vec::new();
    put_bytes(&mut group, 2, &dense);
    wrap_primitive_block(strings, group)
}

fn encode_way_block(ways: &[Way]) -> Vec<u8> {
    let mut strings = StringTableBuilder::new();
    let mut group = Vec::new();
    for way in ways {
        let mut msg = Vec::new();
        put_varint(&mut msg, 1, way.id as u64);
        let (keys, vals) = encode_tag_indexes(&mut strings, &way.tags);
        put_packed_varints(&mut msg, 2, keys);
        put_packed_varints(&mut msg, 3, vals);
        put_bytes(&mut msg, 4, &encode_info(&mut strings, &way.meta));
        let mut prev = 0i64;
        put_packed_sints(
            &mut msg,
            8,
            way.refs.iter().map(|&r| {
                let delta = r.wrapping_sub(prev);
                prev = r;
                delta
            }),
        );
        put_bytes(&mut group, 3, &msg);
    }
    wrap_primitive_block(strings, group)
}

fn encode_relation_block(relations: &[Relation]) -> Vec<u8> {
    let mut strings = StringTableBuilder::new();
    let mut group = Vec::new();
    for relation in relations {
        let mut msg = Vec::new();
        put_varint(&mut msg, 1, relation.id as u64);
        let (keys, vals) = encode_tag_indexes(&mut strings, &relation.tags);
        put_packed_varints(&mut msg, 2, keys);
        put_packed_varints(&mut msg, 3, vals);
        put_bytes(&mut msg, 4, &encode_info(&mut strings, &relation.meta));
        let roles: Vec<u64> = relation
            .members
            .iter()
            .map(|m| strings.intern(&m.role))
            .collect();
        put_packed_varints(&mut msg, 8, roles);
        let mut prev = 0i64;
        put_packed_sints(
            &mut msg,
            9,
            relation.members.iter().map(|m| {
                let delta = m.id.wrapping_sub(prev);
                prev = m.id;
                delta
            }),
        );
        put_packed_varints(
            &mut msg,
            10,
            relation.members.iter().map(|m| match m.kind {
                ElementKind::Node => 0,
                ElementKind::Way => 1,
                ElementKind::Relation => 2,
            }),
        );
        put_bytes(&mut group, 4, &msg);
    }
    wrap_primitive_block(strings, group)
}

/// Decode a blob stream back into a subgraph.
pub fn decode<R: Read>(input: &mut R) -> Result<MapData, CodecError> {
    let mut map = MapData::new();
    let mut saw_header = false;

    loop {
        let Some(header_len) = read_frame_len(input)? else {
            break;
        };
        if u64::from(header_len) > MAX_HEADER_BYTES {
            return Err(FormatError::InvalidBlob {
                reason: "blob header exceeds size limit",
            }
            .into());
        }
        let header_bytes = read_exact(input, header_len as usize, "blob header")?;
        let (block_type, datasize) = decode_blob_header(&header_bytes)?;
        if datasize > MAX_BLOB_BYTES {
            return Err(FormatError::InvalidBlob {
                reason: "blob exceeds size limit",
            }
            .into());
        }
        let blob_bytes = read_exact(input, datasize as usize, "blob body")?;
        let body = decode_blob(&blob_bytes)?;

        match block_type.as_str() {
            BLOCK_TYPE_HEADER => {
                decode_header_block(&body, &mut map)?;
                saw_header = true;
            }
            BLOCK_TYPE_DATA => {
                if !saw_header {
                    return Err(FormatError::InvalidBlob {
                        reason: "data blob before OSMHeader",
                    }
                    .into());
                }
                decode_primitive_block(&body, &mut map)?;
            }
            other => {
                return Err(FormatError::UnknownBlockType {
                    found: other.to_owned(),
                }
                .into());
            }
        }
    }

    if !saw_header {
        return Err(FormatError::Truncated {
            context: "OSMHeader blob",
        }
        .into());
    }
    map.verify_closure()?;
    Ok(map)
}

/// Read the 4-byte frame length, distinguishing clean end-of-stream from a
/// frame cut short.
fn read_frame_len<R: Read>(input: &mut R) -> Result<Option<u32>, CodecError> {
    let mut buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FormatError::Truncated {
                context: "blob frame length",
            }
            .into());
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

fn decode_blob_header(bytes: &[u8]) -> Result<(String, u64), CodecError> {
    let mut reader = PbReader::new(bytes, "blob header");
    let mut block_type = None;
    let mut datasize = None;
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => block_type = Some(reader.string()?),
            3 => datasize = Some(reader.varint()?),
            _ => reader.skip(wire)?,
        }
    }
    let block_type = block_type.ok_or(FormatError::InvalidBlob {
        reason: "blob header missing type",
    })?;
    let datasize = datasize.ok_or(FormatError::InvalidBlob {
        reason: "blob header missing datasize",
    })?;
    Ok((block_type, datasize))
}

fn decode_blob(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut reader = PbReader::new(bytes, "blob");
    let mut raw: Option<Vec<u8>> = None;
    let mut raw_size: Option<u64> = None;
    let mut zlib: Option<Vec<u8>> = None;
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => raw = Some(reader.bytes()?.to_vec()),
            2 => raw_size = Some(reader.varint()?),
            3 => zlib = Some(reader.bytes()?.to_vec()),
            _ => reader.skip(wire)?,
        }
    }

    if let Some(raw) = raw {
        if let Some(declared) = raw_size {
            if declared != raw.len() as u64 {
                return Err(FormatError::LengthMismatch {
                    context: "raw blob",
                    declared,
                    actual: raw.len() as u64,
                }
                .into());
            }
        }
        return Ok(raw);
    }
    if let Some(zlib) = zlib {
        let declared = raw_size.ok_or(FormatError::InvalidBlob {
            reason: "compressed blob missing raw_size",
        })?;
        let mut inflated = Vec::new();
        ZlibDecoder::new(zlib.as_slice())
            .take(declared + 1)
            .read_to_end(&mut inflated)
            .map_err(|_| FormatError::InvalidBlob {
                reason: "zlib payload is corrupt",
            })?;
        if inflated.len() as u64 != declared {
            return Err(FormatError::LengthMismatch {
                context: "inflated blob",
                declared,
                actual: inflated.len() as u64,
            }
            .into());
        }
        return Ok(inflated);
    }
    Err(FormatError::InvalidBlob {
        reason: "blob carries neither raw nor zlib payload",
    }
    .into())
}

fn decode_header_block(body: &[u8], map: &mut MapData) -> Result<(), CodecError> {
    let mut reader = PbReader::new(body, "header block");
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => {
                let bbox_bytes = reader.bytes()?;
                let mut bbox = PbReader::new(bbox_bytes, "header bbox");
                let (mut left, mut right, mut top, mut bottom) = (0i64, 0i64, 0i64, 0i64);
                while let Some((f, w)) = bbox.next_field()? {
                    match f {
                        1 => left = bbox.sint()?,
                        2 => right = bbox.sint()?,
                        3 => top = bbox.sint()?,
                        4 => bottom = bbox.sint()?,
                        _ => bbox.skip(w)?,
                    }
                }
                let bounds = BoundingBox::new(
                    NanoDegrees::from_nanos(left).degrees(),
                    NanoDegrees::from_nanos(bottom).degrees(),
                    NanoDegrees::from_nanos(right).degrees(),
                    NanoDegrees::from_nanos(top).degrees(),
                )
                .map_err(|err| FormatError::InvalidValue {
                    field: "header bbox",
                    message: err.to_string(),
                })?;
                map.set_bounds(bounds);
            }
            4 => {
                let feature = reader.string()?;
                if feature != FEATURE_SCHEMA && feature != FEATURE_DENSE {
                    return Err(FormatError::UnsupportedFeature { feature }.into());
                }
            }
            _ => reader.skip(wire)?,
        }
    }
    Ok(())
}

struct BlockParams {
    granularity: i64,
    lat_offset: i64,
    lon_offset: i64,
    date_granularity: i64,
}

impl BlockParams {
    fn coordinate(&self, offset: i64, stored: i64) -> i64 {
        offset.wrapping_add(self.granularity.wrapping_mul(stored))
    }

    fn timestamp(&self, stored: i64) -> i64 {
        stored.wrapping_mul(self.date_granularity) / 1000
    }
}

fn decode_primitive_block(body: &[u8], map: &mut MapData) -> Result<(), CodecError> {
    let mut reader = PbReader::new(body, "primitive block");
    let mut strings: Vec<String> = Vec::new();
    let mut groups: Vec<&[u8]> = Vec::new();
    let mut params = BlockParams {
        granularity: 100,
        lat_offset: 0,
        lon_offset: 0,
        date_granularity: 1000,
    };

    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => {
                let table_bytes = reader.bytes()?;
                let mut table = PbReader::new(table_bytes, "string table");
                while let Some((f, w)) = table.next_field()? {
                    if f == 1 {
                        let bytes = table.bytes()?;
                        let value = String::from_utf8(bytes.to_vec()).map_err(|_| {
                            FormatError::InvalidUtf8 {
                                context: "string table",
                            }
                        })?;
                        strings.push(value);
                    } else {
                        table.skip(w)?;
                    }
                }
            }
            2 => groups.push(reader.bytes()?),
            17 => params.granularity = reader.varint()? as i64,
            18 => params.date_granularity = reader.varint()? as i64,
            19 => params.lat_offset = reader.varint()? as i64,
            20 => params.lon_offset = reader.varint()? as i64,
            _ => reader.skip(wire)?,
        }
    }

    for group in groups {
        decode_primitive_group(group, &strings, &params, map)?;
    }
    Ok(())
}

fn decode_primitive_group(
    group: &[u8],
    strings: &[String],
    params: &BlockParams,
    map: &mut MapData,
) -> Result<(), CodecError> {
    let mut reader = PbReader::new(group, "primitive group");
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => {
                let msg = reader.bytes()?;
                map.insert_node(decode_single_node(msg, strings, params)?)?;
            }
            2 => {
                let msg = reader.bytes()?;
                decode_dense_nodes(msg, strings, params, map)?;
            }
            3 => {
                let msg = reader.bytes()?;
                map.insert_way(decode_way_message(msg, strings, params)?)?;
            }
            4 => {
                let msg = reader.bytes()?;
                map.insert_relation(decode_relation_message(msg, strings, params)?)?;
            }
            _ => reader.skip(wire)?,
        }
    }
    Ok(())
}

fn lookup_string(strings: &[String], index: u64) -> Result<&str, CodecError> {
    strings
        .get(usize::try_from(index).unwrap_or(usize::MAX))
        .map(String::as_str)
        .ok_or_else(|| {
            FormatError::InvalidValue {
                field: "string index",
                message: format!("{index} exceeds table of {}", strings.len()),
            }
            .into()
        })
}

fn tags_from_indexes(
    strings: &[String],
    keys: &[u64],
    vals: &[u64],
) -> Result<Tags, CodecError> {
    if keys.len() != vals.len() {
        return Err(FormatError::InvalidValue {
            field: "tag arrays",
            message: format!("{} keys against {} values", keys.len(), vals.len()),
        }
        .into());
    }
    let mut tags = Tags::new();
    for (&k, &v) in keys.iter().zip(vals) {
        tags.insert(lookup_string(strings, k)?, lookup_string(strings, v)?);
    }
    Ok(tags)
}

fn decode_info(
    bytes: &[u8],
    strings: &[String],
    params: &BlockParams,
) -> Result<Metadata, CodecError> {
    let mut reader = PbReader::new(bytes, "element info");
    let mut meta = Metadata::default();
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => {
                let version = reader.varint()?;
                meta.version = u32::try_from(version).map_err(|_| FormatError::InvalidValue {
                    field: "info version",
                    message: format!("{version} exceeds u32"),
                })?;
            }
            2 => meta.timestamp = params.timestamp(reader.varint()? as i64),
            3 => meta.changeset = reader.varint()? as i64,
            4 => meta.uid = reader.varint()? as i64,
            5 => meta.user = lookup_string(strings, reader.varint()?)?.to_owned(),
            6 => meta.visible = reader.varint()? != 0,
            _ => reader.skip(wire)?,
        }
    }
    Ok(meta)
}

fn decode_single_node(
    msg: &[u8],
    strings: &[String],
    params: &BlockParams,
) -> Result<Node, CodecError> {
    let mut reader = PbReader::new(msg, "node message");
    let mut id = 0i64;
    let mut keys = Vec::new();
    let mut vals = Vec::new();
    let mut meta = Metadata::default();
    let mut lat = 0i64;
    let mut lon = 0i64;
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => id = reader.sint()?,
            2 => keys = reader.packed_varints()?,
            3 => vals = reader.packed_varints()?,
            4 => {
                let info = reader.bytes()?;
                meta = decode_info(info, strings, params)?;
            }
            8 => lat = reader.sint()?,
            9 => lon = reader.sint()?,
            _ => reader.skip(wire)?,
        }
    }
    let tags = tags_from_indexes(strings, &keys, &vals)?;
    Ok(Node::new(
        id,
        NanoDegrees::from_nanos(params.coordinate(params.lat_offset, lat)),
        NanoDegrees::from_nanos(params.coordinate(params.lon_offset, lon)),
        tags,
        meta,
    )?)
}

struct DenseInfoArrays {
    versions: Vec<u64>,
    timestamps: Vec<i64>,
    changesets: Vec<i64>,
    uids: Vec<i64>,
    user_sids: Vec<i64>,
    visibles: Vec<u64>,
}

fn decode_dense_info(bytes: &[u8]) -> Result<DenseInfoArrays, CodecError> {
    let mut reader = PbReader::new(bytes, "dense info");
    let mut arrays = DenseInfoArrays {
        versions: Vec::new(),
        timestamps: Vec::new(),
        changesets: Vec::new(),
        uids: Vec::new(),
        user_sids: Vec::new(),
        visibles: Vec::new(),
    };
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => arrays.versions = reader.packed_varints()?,
            2 => arrays.timestamps = reader.packed_sints()?,
            3 => arrays.changesets = reader.packed_sints()?,
            4 => arrays.uids = reader.packed_sints()?,
            5 => arrays.user_sids = reader.packed_sints()?,
            6 => arrays.visibles = reader.packed_varints()?,
            _ => reader.skip(wire)?,
        }
    }
    Ok(arrays)
}

fn decode_dense_nodes(
    msg: &[u8],
    strings: &[String],
    params: &BlockParams,
    map: &mut MapData,
) -> Result<(), CodecError> {
    let mut reader = PbReader::new(msg, "dense nodes");
    let mut ids = Vec::new();
    let mut lats = Vec::new();
    let mut lons = Vec::new();
    let mut keys_vals = Vec::new();
    let mut info: Option<DenseInfoArrays> = None;
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => ids = reader.packed_sints()?,
            5 => {
                let bytes = reader.bytes()?;
                info = Some(decode_dense_info(bytes)?);
            }
            8 => lats = reader.packed_sints()?,
            9 => lons = reader.packed_sints()?,
            10 => keys_vals = reader.packed_varints()?,
            _ => reader.skip(wire)?,
        }
    }

    if ids.len() != lats.len() || ids.len() != lons.len() {
        return Err(FormatError::InvalidValue {
            field: "dense node arrays",
            message: format!(
                "{} ids, {} lats, {} lons",
                ids.len(),
                lats.len(),
                lons.len()
            ),
        }
        .into());
    }
    if let Some(info) = &info {
        let n = ids.len();
        if [
            info.versions.len(),
            info.timestamps.len(),
            info.changesets.len(),
            info.uids.len(),
            info.user_sids.len(),
            info.visibles.len(),
        ]
        .iter()
        .any(|&len| len != n)
        {
            return Err(FormatError::InvalidValue {
                field: "dense info arrays",
                message: "metadata arrays do not match node count".to_owned(),
            }
            .into());
        }
    }

    let mut id = 0i64;
    let mut lat = 0i64;
    let mut lon = 0i64;
    let mut wire_ts = 0i64;
    let mut changeset = 0i64;
    let mut uid = 0i64;
    let mut sid = 0i64;
    let mut kv = keys_vals.iter().copied();

    for i in 0..ids.len() {
        id = id.wrapping_add(ids[i]);
        lat = lat.wrapping_add(lats[i]);
        lon = lon.wrapping_add(lons[i]);

        let mut tags = Tags::new();
        // An absent keys_vals array means the whole block is untagged.
        if !keys_vals.is_empty() {
            loop {
                let Some(key_index) = kv.next() else {
                    return Err(FormatError::InvalidValue {
                        field: "dense keys_vals",
                        message: "array ended before node sentinel".to_owned(),
                    }
                    .into());
                };
                if key_index == 0 {
                    break;
                }
                let Some(val_index) = kv.next() else {
                    return Err(FormatError::InvalidValue {
                        field: "dense keys_vals",
                        message: "key without value".to_owned(),
                    }
                    .into());
                };
                tags.insert(
                    lookup_string(strings, key_index)?,
                    lookup_string(strings, val_index)?,
                );
            }
        }

        let meta = match &info {
            Some(info) => {
                wire_ts = wire_ts.wrapping_add(info.timestamps[i]);
                changeset = changeset.wrapping_add(info.changesets[i]);
                uid = uid.wrapping_add(info.uids[i]);
                sid = sid.wrapping_add(info.user_sids[i]);
                Metadata {
                    version: u32::try_from(info.versions[i]).map_err(|_| {
                        FormatError::InvalidValue {
                            field: "dense version",
                            message: format!("{} exceeds u32", info.versions[i]),
                        }
                    })?,
                    changeset,
                    timestamp: params.timestamp(wire_ts),
                    uid,
                    user: {
                        let index = u64::try_from(sid).map_err(|_| {
                            FormatError::InvalidValue {
                                field: "dense user_sid",
                                message: format!("cumulative string id {sid} is negative"),
                            }
                        })?;
                        lookup_string(strings, index)?.to_owned()
                    },
                    visible: info.visibles[i] != 0,
                }
            }
            None => Metadata::default(),
        };

        map.insert_node(Node::new(
            id,
            NanoDegrees::from_nanos(params.coordinate(params.lat_offset, lat)),
            NanoDegrees::from_nanos(params.coordinate(params.lon_offset, lon)),
            tags,
            meta,
        )?)?;
    }
    Ok(())
}

fn decode_way_message(
    msg: &[u8],
    strings: &[String],
    params: &BlockParams,
) -> Result<Way, CodecError> {
    let mut reader = PbReader::new(msg, "way message");
    let mut id = 0i64;
    let mut keys = Vec::new();
    let mut vals = Vec::new();
    let mut meta = Metadata::default();
    let mut refs = Vec::new();
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => id = reader.varint()? as i64,
            2 => keys = reader.packed_varints()?,
            3 => vals = reader.packed_varints()?,
            4 => {
                let info = reader.bytes()?;
                meta = decode_info(info, strings, params)?;
            }
            8 => {
                let deltas = reader.packed_sints()?;
                let mut prev = 0i64;
                refs = deltas
                    .into_iter()
                    .map(|d| {
                        prev = prev.wrapping_add(d);
                        prev
                    })
                    .collect();
            }
            _ => reader.skip(wire)?,
        }
    }
    let tags = tags_from_indexes(strings, &keys, &vals)?;
    Ok(Way::new(id, refs, tags, meta)?)
}

fn decode_relation_message(
    msg: &[u8],
    strings: &[String],
    params: &BlockParams,
) -> Result<Relation, CodecError> {
    let mut reader = PbReader::new(msg, "relation message");
    let mut id = 0i64;
    let mut keys = Vec::new();
    let mut vals = Vec::new();
    let mut meta = Metadata::default();
    let mut roles = Vec::new();
    let mut memids = Vec::new();
    let mut types = Vec::new();
    while let Some((field, wire)) = reader.next_field()? {
        match field {
            1 => id = reader.varint()? as i64,
            2 => keys = reader.packed_varints()?,
            3 => vals = reader.packed_varints()?,
            4 => {
                let info = reader.bytes()?;
                meta = decode_info(info, strings, params)?;
            }
            8 => roles = reader.packed_varints()?,
            9 => memids = reader.packed_sints()?,
            10 => types = reader.packed_varints()?,
            _ => reader.skip(wire)?,
        }
    }
    if roles.len() != memids.len() || roles.len() != types.len() {
        return Err(FormatError::InvalidValue {
            field: "relation member arrays",
            message: format!(
                "{} roles, {} ids, {} types",
                roles.len(),
                memids.len(),
                types.len()
            ),
        }
        .into());
    }

    let mut members = Vec::with_capacity(roles.len());
    let mut prev = 0i64;
    for ((role_sid, delta), member_type) in roles.iter().zip(&memids).zip(&types) {
        prev = prev.wrapping_add(*delta);
        let kind = match member_type {
            0 => ElementKind::Node,
            1 => ElementKind::Way,
            2 => ElementKind::Relation,
            other => {
                return Err(FormatError::InvalidValue {
                    field: "member type",
                    message: format!("unknown member type {other}"),
                }
                .into());
            }
        };
        members.push(Member::new(kind, prev, lookup_string(strings, *role_sid)?));
    }
    let tags = tags_from_indexes(strings, &keys, &vals)?;
    Ok(Relation::new(id, members, tags, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::test_support::sample_map;
    use rstest::rstest;

    #[rstest]
    #[case(BlockOptions { compress: true })]
    #[case(BlockOptions { compress: false })]
    fn round_trips_sample_map(#[case] options: BlockOptions) {
        let map = sample_map();
        let mut buf = Vec::new();
        let written = encode_with(&map, &mut buf, options).unwrap();
        assert_eq!(written, buf.len() as u64);

        let decoded = decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, map);
    }

    #[rstest]
    fn compression_shrinks_repetitive_payloads() {
        let mut tagged = MapData::new();
        for i in 0..200 {
            tagged
                .insert_node(meridian_core::test_support::tagged_node(
                    i,
                    50.0,
                    -1.0,
                    &[("highway", "crossing"), ("tactile_paving", "yes")],
                ))
                .unwrap();
        }
        let mut raw = Vec::new();
        encode_with(&tagged, &mut raw, BlockOptions { compress: false }).unwrap();
        let mut deflated = Vec::new();
        encode_with(&tagged, &mut deflated, BlockOptions { compress: true }).unwrap();
        assert!(deflated.len() < raw.len());
    }

    #[rstest]
    fn lying_raw_size_is_a_length_mismatch() {
        // A blob declaring a raw_size larger than its actual payload.
        let body = encode_header_block(None);
        let mut blob = Vec::new();
        put_varint(&mut blob, 2, body.len() as u64 + 5);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).unwrap();
        put_bytes(&mut blob, 3, &encoder.finish().unwrap());

        let mut header = Vec::new();
        put_string(&mut header, 1, BLOCK_TYPE_HEADER);
        put_varint(&mut header, 3, blob.len() as u64);

        let mut stream = Vec::new();
        stream.extend_from_slice(&(header.len() as u32).to_be_bytes());
        stream.extend_from_slice(&header);
        stream.extend_from_slice(&blob);

        let err = decode(&mut stream.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::LengthMismatch { .. })
        ));
    }

    #[rstest]
    fn unknown_block_type_is_rejected() {
        let mut stream = Vec::new();
        let mut header = Vec::new();
        put_string(&mut header, 1, "OSMMystery");
        let mut blob = Vec::new();
        put_bytes(&mut blob, 1, b"");
        put_varint(&mut header, 3, blob.len() as u64);
        stream.extend_from_slice(&(header.len() as u32).to_be_bytes());
        stream.extend_from_slice(&header);
        stream.extend_from_slice(&blob);

        let err = decode(&mut stream.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::UnknownBlockType { .. })
        ));
    }

    #[rstest]
    fn truncated_frame_is_an_error() {
        let map = sample_map();
        let mut buf = Vec::new();
        encode(&map, &mut buf).unwrap();
        buf.truncate(buf.len() - 7);

        let err = decode(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::Truncated { .. })
        ));
    }

    #[rstest]
    fn empty_stream_is_missing_its_header() {
        let mut empty: &[u8] = &[];
        let err = decode(&mut empty).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::Truncated { .. })
        ));
    }
}
