//! The text format: one XML element per entity, streamed.
//!
//! The writer emits elements in document order — `<bounds>`, nodes, ways,
//! relations — with id/lat/lon and metadata as attributes and tags, way
//! nodes and relation members as child elements. Timestamps are written as
//! whole seconds since the Unix epoch and coordinates as decimal degrees
//! with up to nine fractional digits, so the fixed-point values survive the
//! round trip exactly.
//!
//! The parser is a streaming event loop: attributes may appear in any
//! order, unknown attributes and elements are skipped with a warning, but
//! child order — way node sequences and relation member lists — is
//! preserved exactly. Change documents (`<osmChange>` with
//! create/modify/delete sections) share the same element grammar.

use std::io::{BufRead, Write};

use log::warn;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use meridian_core::{
    BoundingBox, ChangeAction, Changeset, Element, ElementKind, MapData, Member, Metadata,
    NanoDegrees, Node, Relation, Tags, Way,
};

use crate::error::{CodecError, FormatError};

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    written: u64,
}

impl<'a, W: Write> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Render a fixed-point angle as decimal degrees without precision loss.
fn format_degrees(value: NanoDegrees) -> String {
    let nanos = value.nanos();
    let sign = if nanos < 0 { "-" } else { "" };
    let magnitude = nanos.unsigned_abs();
    let whole = magnitude / 1_000_000_000;
    let frac = magnitude % 1_000_000_000;
    if frac == 0 {
        return format!("{sign}{whole}");
    }
    let digits = format!("{frac:09}");
    format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
}

fn meta_attrs(meta: &Metadata) -> String {
    let mut out = format!(
        " version=\"{}\" changeset=\"{}\" timestamp=\"{}\"",
        meta.version, meta.changeset, meta.timestamp
    );
    if meta.uid != 0 {
        out.push_str(&format!(" uid=\"{}\"", meta.uid));
    }
    if !meta.user.is_empty() {
        out.push_str(&format!(" user=\"{}\"", escape(&meta.user)));
    }
    out.push_str(&format!(" visible=\"{}\"", meta.visible));
    out
}

fn write_tags<W: Write>(out: &mut W, indent: &str, tags: &Tags) -> Result<(), CodecError> {
    for (key, value) in tags {
        writeln!(
            out,
            "{indent}<tag k=\"{}\" v=\"{}\"/>",
            escape(key),
            escape(value)
        )?;
    }
    Ok(())
}

fn write_node<W: Write>(out: &mut W, indent: &str, node: &Node) -> Result<(), CodecError> {
    let open = format!(
        "{indent}<node id=\"{}\" lat=\"{}\" lon=\"{}\"{}",
        node.id,
        format_degrees(node.lat),
        format_degrees(node.lon),
        meta_attrs(&node.meta)
    );
    if node.tags.is_empty() {
        writeln!(out, "{open}/>")?;
        return Ok(());
    }
    writeln!(out, "{open}>")?;
    write_tags(out, &format!("{indent}  "), &node.tags)?;
    writeln!(out, "{indent}</node>")?;
    Ok(())
}

fn write_way<W: Write>(out: &mut W, indent: &str, way: &Way) -> Result<(), CodecError> {
    writeln!(out, "{indent}<way id=\"{}\"{}>", way.id, meta_attrs(&way.meta))?;
    for node_id in &way.refs {
        writeln!(out, "{indent}  <nd ref=\"{node_id}\"/>")?;
    }
    write_tags(out, &format!("{indent}  "), &way.tags)?;
    writeln!(out, "{indent}</way>")?;
    Ok(())
}

fn write_relation<W: Write>(
    out: &mut W,
    indent: &str,
    relation: &Relation,
) -> Result<(), CodecError> {
    writeln!(
        out,
        "{indent}<relation id=\"{}\"{}>",
        relation.id,
        meta_attrs(&relation.meta)
    )?;
    for member in &relation.members {
        writeln!(
            out,
            "{indent}  <member type=\"{}\" ref=\"{}\" role=\"{}\"/>",
            member.kind,
            member.id,
            escape(&member.role)
        )?;
    }
    write_tags(out, &format!("{indent}  "), &relation.tags)?;
    writeln!(out, "{indent}</relation>")?;
    Ok(())
}

fn write_bounds<W: Write>(out: &mut W, bounds: &BoundingBox) -> Result<(), CodecError> {
    writeln!(
        out,
        "  <bounds minlon=\"{}\" minlat=\"{}\" maxlon=\"{}\" maxlat=\"{}\"/>",
        bounds.min_lon, bounds.min_lat, bounds.max_lon, bounds.max_lat
    )?;
    Ok(())
}

/// Encode a subgraph as an XML document, returning the bytes written.
pub fn encode<W: Write>(map: &MapData, out: &mut W) -> Result<u64, CodecError> {
    let mut out = CountingWriter::new(out);
    writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
    writeln!(out, "<osm version=\"0.6\" generator=\"meridian\">")?;
    if let Some(bounds) = map.bounds() {
        write_bounds(&mut out, bounds)?;
    }
    for node in map.nodes() {
        write_node(&mut out, "  ", node)?;
    }
    for way in map.ways() {
        write_way(&mut out, "  ", way)?;
    }
    for relation in map.relations() {
        write_relation(&mut out, "  ", relation)?;
    }
    writeln!(out, "</osm>")?;
    Ok(out.written)
}

/// Encode a changeset as an `<osmChange>` document, returning the bytes
/// written. Consecutive entries with the same action share one section.
pub fn encode_changeset<W: Write>(changeset: &Changeset, out: &mut W) -> Result<u64, CodecError> {
    let mut out = CountingWriter::new(out);
    writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
    writeln!(out, "<osmChange version=\"0.6\" generator=\"meridian\">")?;
    let mut open_section: Option<ChangeAction> = None;
    for entry in &changeset.entries {
        if open_section != Some(entry.action) {
            if let Some(section) = open_section {
                writeln!(out, "  </{}>", section.as_str())?;
            }
            writeln!(out, "  <{}>", entry.action.as_str())?;
            open_section = Some(entry.action);
        }
        match &entry.element {
            Element::Node(node) => write_node(&mut out, "    ", node)?,
            Element::Way(way) => write_way(&mut out, "    ", way)?,
            Element::Relation(relation) => write_relation(&mut out, "    ", relation)?,
        }
    }
    if let Some(section) = open_section {
        writeln!(out, "  </{}>", section.as_str())?;
    }
    writeln!(out, "</osmChange>")?;
    Ok(out.written)
}

/// A partially parsed element awaiting its child elements.
enum Pending {
    Node {
        id: i64,
        lat: NanoDegrees,
        lon: NanoDegrees,
        tags: Tags,
        meta: Metadata,
    },
    Way {
        id: i64,
        refs: Vec<i64>,
        tags: Tags,
        meta: Metadata,
    },
    Relation {
        id: i64,
        members: Vec<Member>,
        tags: Tags,
        meta: Metadata,
    },
}

impl Pending {
    fn finish(self) -> Result<Element, CodecError> {
        match self {
            Self::Node {
                id,
                lat,
                lon,
                tags,
                meta,
            } => Ok(Element::Node(Node::new(id, lat, lon, tags, meta)?)),
            Self::Way {
                id,
                refs,
                tags,
                meta,
            } => Ok(Element::Way(Way::new(id, refs, tags, meta)?)),
            Self::Relation {
                id,
                members,
                tags,
                meta,
            } => Ok(Element::Relation(Relation::new(id, members, tags, meta))),
        }
    }

    fn tags_mut(&mut self) -> &mut Tags {
        match self {
            Self::Node { tags, .. } | Self::Way { tags, .. } | Self::Relation { tags, .. } => tags,
        }
    }
}

fn parse_i64(value: &str, field: &'static str) -> Result<i64, CodecError> {
    value.parse().map_err(|_| {
        FormatError::InvalidValue {
            field,
            message: format!("{value:?} is not an integer"),
        }
        .into()
    })
}

fn parse_degrees(value: &str, field: &'static str) -> Result<NanoDegrees, CodecError> {
    let degrees: f64 = value.parse().map_err(|_| FormatError::InvalidValue {
        field,
        message: format!("{value:?} is not a number"),
    })?;
    Ok(NanoDegrees::from_degrees(degrees))
}

/// Common attribute soup for node/way/relation elements.
struct ElementAttrs {
    id: Option<i64>,
    lat: Option<NanoDegrees>,
    lon: Option<NanoDegrees>,
    meta: Metadata,
}

fn parse_element_attrs(start: &BytesStart<'_>) -> Result<ElementAttrs, CodecError> {
    let mut attrs = ElementAttrs {
        id: None,
        lat: None,
        lon: None,
        meta: Metadata::default(),
    };
    for attr in start.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.as_ref() {
            b"id" => attrs.id = Some(parse_i64(&value, "id")?),
            b"lat" => attrs.lat = Some(parse_degrees(&value, "lat")?),
            b"lon" => attrs.lon = Some(parse_degrees(&value, "lon")?),
            b"version" => {
                let version = parse_i64(&value, "version")?;
                attrs.meta.version =
                    u32::try_from(version).map_err(|_| FormatError::InvalidValue {
                        field: "version",
                        message: format!("{version} exceeds u32"),
                    })?;
            }
            b"changeset" => attrs.meta.changeset = parse_i64(&value, "changeset")?,
            b"timestamp" => attrs.meta.timestamp = parse_i64(&value, "timestamp")?,
            b"uid" => attrs.meta.uid = parse_i64(&value, "uid")?,
            b"user" => attrs.meta.user = value.into_owned(),
            b"visible" => attrs.meta.visible = value.as_ref() != "false",
            _ => {}
        }
    }
    Ok(attrs)
}

fn start_element(start: &BytesStart<'_>) -> Result<Option<Pending>, CodecError> {
    let pending = match start.name().as_ref() {
        b"node" => {
            let attrs = parse_element_attrs(start)?;
            Pending::Node {
                id: require_attr(attrs.id, "node", "id")?,
                lat: require_attr(attrs.lat, "node", "lat")?,
                lon: require_attr(attrs.lon, "node", "lon")?,
                tags: Tags::new(),
                meta: attrs.meta,
            }
        }
        b"way" => {
            let attrs = parse_element_attrs(start)?;
            Pending::Way {
                id: require_attr(attrs.id, "way", "id")?,
                refs: Vec::new(),
                tags: Tags::new(),
                meta: attrs.meta,
            }
        }
        b"relation" => {
            let attrs = parse_element_attrs(start)?;
            Pending::Relation {
                id: require_attr(attrs.id, "relation", "id")?,
                members: Vec::new(),
                tags: Tags::new(),
                meta: attrs.meta,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(pending))
}

fn require_attr<T>(
    value: Option<T>,
    element: &'static str,
    attribute: &'static str,
) -> Result<T, CodecError> {
    value.ok_or_else(|| FormatError::MissingAttribute { element, attribute }.into())
}

fn handle_child(pending: &mut Pending, child: &BytesStart<'_>) -> Result<(), CodecError> {
    match child.name().as_ref() {
        b"tag" => {
            let mut key = None;
            let mut value = None;
            for attr in child.attributes() {
                let attr = attr?;
                let text = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"k" => key = Some(text.into_owned()),
                    b"v" => value = Some(text.into_owned()),
                    _ => {}
                }
            }
            pending.tags_mut().insert(
                require_attr(key, "tag", "k")?,
                require_attr(value, "tag", "v")?,
            );
        }
        b"nd" => {
            let Pending::Way { refs, .. } = pending else {
                return Err(FormatError::UnexpectedElement {
                    element: "nd".to_owned(),
                }
                .into());
            };
            let mut node_ref = None;
            for attr in child.attributes() {
                let attr = attr?;
                if attr.key.as_ref() == b"ref" {
                    node_ref = Some(parse_i64(&attr.unescape_value()?, "nd ref")?);
                }
            }
            refs.push(require_attr(node_ref, "nd", "ref")?);
        }
        b"member" => {
            let Pending::Relation { members, .. } = pending else {
                return Err(FormatError::UnexpectedElement {
                    element: "member".to_owned(),
                }
                .into());
            };
            let mut kind = None;
            let mut member_ref = None;
            let mut role = String::new();
            for attr in child.attributes() {
                let attr = attr?;
                let text = attr.unescape_value()?;
                match attr.key.as_ref() {
                    b"type" => {
                        kind = Some(ElementKind::parse(&text).ok_or_else(|| {
                            FormatError::InvalidValue {
                                field: "member type",
                                message: format!("unknown member type {text:?}"),
                            }
                        })?);
                    }
                    b"ref" => member_ref = Some(parse_i64(&text, "member ref")?),
                    b"role" => role = text.into_owned(),
                    _ => {}
                }
            }
            members.push(Member::new(
                require_attr(kind, "member", "type")?,
                require_attr(member_ref, "member", "ref")?,
                role,
            ));
        }
        other => {
            warn!(
                "skipping unexpected child element <{}>",
                String::from_utf8_lossy(other)
            );
        }
    }
    Ok(())
}

fn parse_bounds(start: &BytesStart<'_>) -> Result<BoundingBox, CodecError> {
    let mut min_lon = None;
    let mut min_lat = None;
    let mut max_lon = None;
    let mut max_lat = None;
    for attr in start.attributes() {
        let attr = attr?;
        let text = attr.unescape_value()?;
        match attr.key.as_ref() {
            b"minlon" => min_lon = Some(parse_degrees(&text, "minlon")?),
            b"minlat" => min_lat = Some(parse_degrees(&text, "minlat")?),
            b"maxlon" => max_lon = Some(parse_degrees(&text, "maxlon")?),
            b"maxlat" => max_lat = Some(parse_degrees(&text, "maxlat")?),
            _ => {}
        }
    }
    BoundingBox::new(
        require_attr(min_lon, "bounds", "minlon")?.degrees(),
        require_attr(min_lat, "bounds", "minlat")?.degrees(),
        require_attr(max_lon, "bounds", "maxlon")?.degrees(),
        require_attr(max_lat, "bounds", "maxlat")?.degrees(),
    )
    .map_err(|err| {
        FormatError::InvalidValue {
            field: "bounds",
            message: err.to_string(),
        }
        .into()
    })
}

/// Decode an `<osm>` document back into a subgraph.
pub fn decode<R: BufRead>(input: &mut R) -> Result<MapData, CodecError> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut map = MapData::new();
    let mut buf = Vec::new();
    let mut in_document = false;
    let mut closed = false;
    let mut pending: Option<Pending> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) => {}
            Event::Start(e) => {
                if !in_document {
                    if e.name().as_ref() == b"osm" {
                        in_document = true;
                    } else {
                        return Err(FormatError::UnexpectedElement {
                            element: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        }
                        .into());
                    }
                } else if let Some(current) = pending.as_mut() {
                    handle_child(current, &e)?;
                } else {
                    pending = start_element(&e)?;
                    if pending.is_none() {
                        warn!(
                            "skipping unexpected element <{}>",
                            String::from_utf8_lossy(e.name().as_ref())
                        );
                    }
                }
            }
            Event::Empty(e) => {
                if !in_document {
                    return Err(FormatError::UnexpectedElement {
                        element: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    }
                    .into());
                }
                if let Some(current) = pending.as_mut() {
                    handle_child(current, &e)?;
                } else if e.name().as_ref() == b"bounds" {
                    map.set_bounds(parse_bounds(&e)?);
                } else if let Some(done) = start_element(&e)? {
                    map.insert(done.finish()?)?;
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"osm" => {
                    closed = true;
                    in_document = false;
                }
                b"node" | b"way" | b"relation" => {
                    if let Some(done) = pending.take() {
                        map.insert(done.finish()?)?;
                    }
                }
                _ => {}
            },
            _ => {}
        }
        buf.clear();
    }

    if !closed {
        return Err(FormatError::Truncated {
            context: "</osm> close tag",
        }
        .into());
    }
    map.verify_closure()?;
    Ok(map)
}

/// Decode an `<osmChange>` document into a changeset with the given id.
///
/// Entries are numbered by document order starting at 1.
pub fn decode_changeset<R: BufRead>(input: &mut R, id: i64) -> Result<Changeset, CodecError> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut changeset = Changeset::new(id);
    let mut buf = Vec::new();
    let mut in_document = false;
    let mut closed = false;
    let mut section: Option<ChangeAction> = None;
    let mut pending: Option<Pending> = None;
    let mut sequence = 0u64;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) => {}
            Event::Start(e) => {
                let name = e.name();
                let name = name.as_ref();
                if !in_document {
                    if name == b"osmChange" {
                        in_document = true;
                    } else {
                        return Err(FormatError::UnexpectedElement {
                            element: String::from_utf8_lossy(name).into_owned(),
                        }
                        .into());
                    }
                } else if let Some(current) = pending.as_mut() {
                    handle_child(current, &e)?;
                } else if section.is_none() {
                    section =
                        Some(
                            ChangeAction::parse(&String::from_utf8_lossy(name)).ok_or_else(
                                || FormatError::UnexpectedElement {
                                    element: String::from_utf8_lossy(name).into_owned(),
                                },
                            )?,
                        );
                } else {
                    pending = start_element(&e)?;
                }
            }
            Event::Empty(e) => {
                if let Some(current) = pending.as_mut() {
                    handle_child(current, &e)?;
                } else if section.is_some() {
                    if let Some(done) = start_element(&e)? {
                        if let Some(action) = section {
                            sequence += 1;
                            changeset.push(sequence, action, done.finish()?);
                        }
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"osmChange" => {
                    closed = true;
                    in_document = false;
                }
                b"create" | b"modify" | b"delete" => section = None,
                b"node" | b"way" | b"relation" => {
                    if let Some(done) = pending.take() {
                        if let Some(action) = section {
                            sequence += 1;
                            changeset.push(sequence, action, done.finish()?);
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
        buf.clear();
    }

    if !closed {
        return Err(FormatError::Truncated {
            context: "</osmChange> close tag",
        }
        .into());
    }
    Ok(changeset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::test_support::{node, sample_map, way};
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
    fn tolerates_attribute_order() {
        let doc = br#"<?xml version="1.0"?>
<osm version="0.6">
  <node lon="-1.05" visible="true" id="7" lat="50.5" version="2" changeset="3" timestamp="1000"/>
</osm>"#;
        let map = decode(&mut &doc[..]).unwrap();
        let node = map.node(7).unwrap();
        assert_eq!(node.lat, NanoDegrees::from_degrees(50.5));
        assert_eq!(node.meta.version, 2);
    }

    #[rstest]
    fn preserves_member_and_nd_order() {
        let doc = br#"<osm version="0.6">
  <node id="1" lat="0" lon="0"/>
  <node id="2" lat="0.1" lon="0.1"/>
  <way id="5"><nd ref="2"/><nd ref="1"/><nd ref="2"/></way>
</osm>"#;
        let map = decode(&mut &doc[..]).unwrap();
        assert_eq!(map.way(5).unwrap().refs, vec![2, 1, 2]);
    }

    #[rstest]
    fn missing_id_is_an_error() {
        let doc = br#"<osm><node lat="1" lon="2"/></osm>"#;
        let err = decode(&mut &doc[..]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::MissingAttribute {
                element: "node",
                attribute: "id"
            })
        ));
    }

    #[rstest]
    fn unterminated_document_is_truncated() {
        let doc = br#"<osm version="0.6"><node id="1" lat="0" lon="0"/>"#;
        let err = decode(&mut &doc[..]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Format(FormatError::Truncated { .. })
        ));
    }

    #[rstest]
    fn escapes_reserved_characters() {
        let mut map = MapData::new();
        let mut fixture = node(1, 10.0, 20.0);
        fixture
            .tags
            .insert("name", "Rose & Crown <\"The Local\">");
        map.insert_node(fixture).unwrap();

        let mut buf = Vec::new();
        encode(&map, &mut buf).unwrap();
        let decoded = decode(&mut buf.as_slice()).unwrap();
        assert_eq!(
            decoded.node(1).unwrap().tags.get("name"),
            Some("Rose & Crown <\"The Local\">")
        );
    }

    #[rstest]
    fn changeset_round_trips_with_sections() {
        let mut changeset = Changeset::new(42);
        changeset.push(1, ChangeAction::Create, Element::Node(node(1, 1.0, 2.0)));
        changeset.push(2, ChangeAction::Create, Element::Node(node(2, 1.1, 2.1)));
        changeset.push(
            3,
            ChangeAction::Modify,
            Element::Way(way(9, &[1, 2], &[("highway", "path")])),
        );
        let mut tombstone = node(3, 5.0, 6.0);
        tombstone.meta.visible = false;
        changeset.push(4, ChangeAction::Delete, Element::Node(tombstone));

        let mut buf = Vec::new();
        encode_changeset(&changeset, &mut buf).unwrap();
        let decoded = decode_changeset(&mut buf.as_slice(), 42).unwrap();
        assert_eq!(decoded, changeset);
        assert_eq!(decoded.validate_order(), Ok(()));
    }

    #[rstest]
    fn dangling_way_reference_fails_closure() {
        let doc = br#"<osm><way id="5"><nd ref="404"/></way></osm>"#;
        let err = decode(&mut &doc[..]).unwrap_err();
        assert!(matches!(err, CodecError::Reference(_)));
    }
}
