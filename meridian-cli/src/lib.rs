//! Command-line interface for the meridian map-data store.
//!
//! Thin adapters over the library crates: schema provisioning, bounding-box
//! and id queries serialised to any wire format (optionally gzip-wrapped),
//! whole-store dumps, stream imports and replication diff plumbing.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use meridian_codec::{Format, gzip};
use meridian_core::{
    BoundingBox, ChangeAction, Element, ElementKind, Filter, FilterOptions, MapData, TagRule,
};
use meridian_store::{
    QueryOptions, SpatialStore, StoreConfig, WriteOutcome, apply_changeset, dump, extract_diff,
    map_query, objects_by_id,
};

mod error;

pub use error::CliError;

/// Run the meridian CLI with the current process arguments.
pub fn run() -> Result<(), CliError> {
    run_from(std::env::args_os())
}

fn run_from<I, T>(argv: I) -> Result<(), CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(argv).map_err(CliError::ArgumentParsing)?;
    match cli.command {
        Command::Init(args) => run_init(&args),
        Command::Query(args) => run_query(&args),
        Command::Get(args) => run_get(&args),
        Command::Dump(args) => run_dump(&args),
        Command::Load(args) => run_load(&args),
        Command::ApplyDiff(args) => run_apply_diff(&args),
        Command::ExtractDiff(args) => run_extract_diff(&args),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "meridian",
    about = "Query, interchange and replication tooling for the meridian map store",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the store schema.
    Init(StoreArgs),
    /// Resolve a bounding box into a closed subgraph and serialise it.
    Query(QueryArgs),
    /// Resolve elements by id and serialise them with their closure.
    Get(GetArgs),
    /// Serialise the whole store.
    Dump(DumpArgs),
    /// Import a map stream into the store.
    Load(LoadArgs),
    /// Apply an ordered osmChange diff.
    ApplyDiff(ApplyDiffArgs),
    /// Extract an osmChange diff for a timestamp window.
    ExtractDiff(ExtractDiffArgs),
}

#[derive(Debug, clap::Args)]
struct StoreArgs {
    /// Path to the SQLite database file.
    #[arg(long)]
    db: PathBuf,
    /// Table name prefix (production vs test schema).
    #[arg(long, default_value = "")]
    prefix: String,
}

impl StoreArgs {
    fn open(&self) -> Result<SpatialStore, CliError> {
        let config = StoreConfig::file(&self.db).with_prefix(self.prefix.clone());
        Ok(SpatialStore::open(config)?)
    }
}

/// Wire format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    /// Typed varint/delta record stream.
    Compact,
    /// Protobuf-framed block stream.
    Blocks,
    /// Element-per-entity XML.
    Xml,
}

impl From<FormatArg> for Format {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Compact => Self::Compact,
            FormatArg::Blocks => Self::Blocks,
            FormatArg::Xml => Self::Xml,
        }
    }
}

impl std::fmt::Display for FormatArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Compact => "compact",
            Self::Blocks => "blocks",
            Self::Xml => "xml",
        })
    }
}

#[derive(Debug, clap::Args)]
struct OutputArgs {
    /// Output format.
    #[arg(long, value_enum, default_value_t = FormatArg::Xml)]
    format: FormatArg,
    /// Wrap the output stream in gzip.
    #[arg(long)]
    gzip: bool,
    /// Output file; stdout when omitted.
    #[arg(long, short)]
    out: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct QueryArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Bounding box as min-lon,min-lat,max-lon,max-lat in degrees.
    #[arg(long, allow_hyphen_values = true)]
    bbox: String,
    /// Abort when the box selects more nodes than this.
    #[arg(long)]
    max_nodes: Option<u64>,
    /// Keep only elements carrying this tag, as `key` or `key=value`.
    /// Repeatable; all rules must match.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Drop ways and relations whose filtered references are gone instead
    /// of pulling the references back in.
    #[arg(long)]
    strict_filter: bool,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, clap::Args)]
struct GetArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Element kind to fetch.
    #[arg(long, value_enum)]
    kind: KindArg,
    /// Comma-separated element ids.
    #[arg(long)]
    ids: String,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    /// Nodes.
    Node,
    /// Ways.
    Way,
    /// Relations.
    Relation,
}

impl From<KindArg> for ElementKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Node => Self::Node,
            KindArg::Way => Self::Way,
            KindArg::Relation => Self::Relation,
        }
    }
}

#[derive(Debug, clap::Args)]
struct DumpArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Include tombstoned elements.
    #[arg(long)]
    include_deleted: bool,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, clap::Args)]
struct LoadArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Input format.
    #[arg(long, value_enum, default_value_t = FormatArg::Xml)]
    format: FormatArg,
    /// Input file; gzip is detected automatically.
    input: PathBuf,
}

#[derive(Debug, clap::Args)]
struct ApplyDiffArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Changeset id recorded with the batch.
    #[arg(long)]
    changeset: i64,
    /// osmChange document; gzip is detected automatically.
    input: PathBuf,
}

#[derive(Debug, clap::Args)]
struct ExtractDiffArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Window start (exclusive), seconds since the epoch.
    #[arg(long)]
    since: i64,
    /// Window end (inclusive), seconds since the epoch.
    #[arg(long)]
    until: i64,
    /// Changeset id stamped onto the diff.
    #[arg(long)]
    changeset: i64,
    /// Output file; stdout when omitted.
    #[arg(long, short)]
    out: Option<PathBuf>,
}

fn run_init(args: &StoreArgs) -> Result<(), CliError> {
    let store = args.open()?;
    store.initialise()?;
    info!("schema ready under prefix {:?}", args.prefix);
    Ok(())
}

fn run_query(args: &QueryArgs) -> Result<(), CliError> {
    let bbox = parse_bbox(&args.bbox)?;
    let mut store = args.store.open()?;
    let tx = store.transaction()?;
    let mut map = map_query(
        &tx,
        &bbox,
        QueryOptions {
            max_nodes: args.max_nodes,
        },
    )?;
    tx.commit()?;

    if !args.tags.is_empty() {
        let mut filter = Filter::new();
        for rule in &args.tags {
            filter = filter.with_rule(parse_tag_rule(rule));
        }
        map = filter.apply(
            &map,
            FilterOptions {
                preserve_closure: !args.strict_filter,
            },
        );
    }
    write_map(&map, &args.output)
}

fn parse_tag_rule(raw: &str) -> TagRule {
    match raw.split_once('=') {
        Some((key, value)) => TagRule::KeyEquals {
            key: key.to_owned(),
            value: value.to_owned(),
        },
        None => TagRule::HasKey(raw.to_owned()),
    }
}

fn run_get(args: &GetArgs) -> Result<(), CliError> {
    let ids = parse_ids(&args.ids)?;
    let mut store = args.store.open()?;
    let tx = store.transaction()?;
    let map = objects_by_id(&tx, args.kind.into(), &ids)?;
    tx.commit()?;
    write_map(&map, &args.output)
}

fn run_dump(args: &DumpArgs) -> Result<(), CliError> {
    let mut store = args.store.open()?;
    let tx = store.transaction()?;
    let map = dump(&tx, !args.include_deleted)?;
    tx.commit()?;
    write_map(&map, &args.output)
}

fn run_load(args: &LoadArgs) -> Result<(), CliError> {
    let reader = open_input(&args.input)?;
    let mut reader = BufReader::new(reader);
    let map = Format::from(args.format).decode(&mut reader)?;

    let mut store = args.store.open()?;
    let tx = store.transaction()?;
    let mut loaded = 0u64;
    let mut skipped = 0u64;
    for element in elements_in_document_order(&map) {
        match tx.apply_write(ChangeAction::Create, &element, 0)? {
            WriteOutcome::Applied => loaded += 1,
            WriteOutcome::VersionConflict { stored } => {
                warn!(
                    "skipping {} {}: already stored at version {stored}",
                    element.kind(),
                    element.id()
                );
                skipped += 1;
            }
            WriteOutcome::NotFound => skipped += 1,
        }
    }
    tx.commit()?;
    info!("loaded {loaded} elements ({skipped} skipped)");
    Ok(())
}

fn run_apply_diff(args: &ApplyDiffArgs) -> Result<(), CliError> {
    let reader = open_input(&args.input)?;
    let mut reader = BufReader::new(reader);
    let changeset = meridian_codec::xml::decode_changeset(&mut reader, args.changeset)?;

    let mut store = args.store.open()?;
    let report = apply_changeset(&mut store, &changeset)?;
    info!(
        "changeset {} committed: {} applied, {} stale",
        report.changeset, report.applied, report.stale
    );
    Ok(())
}

fn run_extract_diff(args: &ExtractDiffArgs) -> Result<(), CliError> {
    let mut store = args.store.open()?;
    let changeset = extract_diff(&mut store, args.since, args.until, args.changeset)?;
    let mut out = open_output(args.out.as_deref())?;
    meridian_codec::xml::encode_changeset(&changeset, &mut out)?;
    out.flush().map_err(|source| CliError::Io {
        path: args.out.clone().unwrap_or_else(|| PathBuf::from("-")),
        source,
    })?;
    Ok(())
}

fn elements_in_document_order(map: &MapData) -> impl Iterator<Item = Element> + '_ {
    map.nodes()
        .iter()
        .cloned()
        .map(Element::Node)
        .chain(map.ways().iter().cloned().map(Element::Way))
        .chain(map.relations().iter().cloned().map(Element::Relation))
}

fn write_map(map: &MapData, output: &OutputArgs) -> Result<(), CliError> {
    let sink = open_output(output.out.as_deref())?;
    let format = Format::from(output.format);
    let written = if output.gzip {
        let mut encoder = gzip::compress(sink);
        let written = format.encode(map, &mut encoder)?;
        encoder.finish().map_err(|source| CliError::Io {
            path: output.out.clone().unwrap_or_else(|| PathBuf::from("-")),
            source,
        })?;
        written
    } else {
        let mut sink = sink;
        let written = format.encode(map, &mut sink)?;
        sink.flush().map_err(|source| CliError::Io {
            path: output.out.clone().unwrap_or_else(|| PathBuf::from("-")),
            source,
        })?;
        written
    };
    info!("wrote {written} bytes of {:?}", output.format);
    Ok(())
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>, CliError> {
    match path {
        Some(path) => {
            let file = File::create(path).map_err(|source| CliError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
}

/// Open an input file, transparently unwrapping gzip.
fn open_input(path: &Path) -> Result<Box<dyn Read>, CliError> {
    let file = File::open(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let sniffed = gzip::MaybeGzip::new(BufReader::new(file)).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Box::new(sniffed))
}

fn parse_bbox(value: &str) -> Result<BoundingBox, CliError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(CliError::InvalidBbox {
            value: value.to_owned(),
            reason: format!("expected 4 comma-separated values, found {}", parts.len()),
        });
    }
    let mut bounds = [0f64; 4];
    for (slot, part) in bounds.iter_mut().zip(&parts) {
        *slot = part.parse().map_err(|_| CliError::InvalidBbox {
            value: value.to_owned(),
            reason: format!("{part:?} is not a number"),
        })?;
    }
    Ok(BoundingBox::new(bounds[0], bounds[1], bounds[2], bounds[3])?)
}

fn parse_ids(value: &str) -> Result<BTreeSet<i64>, CliError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| CliError::InvalidIds {
                value: value.to_owned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parses_the_reference_bbox() {
        let bbox = parse_bbox("-1.1473846,50.7360206,-0.9901428,50.8649113").unwrap();
        assert_eq!(bbox.min_lon, -1.1473846);
        assert_eq!(bbox.max_lat, 50.8649113);
    }

    #[rstest]
    #[case("1,2,3")]
    #[case("a,b,c,d")]
    fn rejects_malformed_bboxes(#[case] value: &str) {
        assert!(matches!(
            parse_bbox(value),
            Err(CliError::InvalidBbox { .. })
        ));
    }

    #[rstest]
    fn parses_id_lists() {
        let ids = parse_ids("3, 1,2").unwrap();
        assert_eq!(ids, BTreeSet::from([1, 2, 3]));
    }

    #[rstest]
    fn rejects_malformed_ids() {
        assert!(matches!(
            parse_ids("1,x"),
            Err(CliError::InvalidIds { .. })
        ));
    }

    #[rstest]
    fn tag_rules_split_on_equals() {
        assert_eq!(
            parse_tag_rule("highway=primary"),
            TagRule::KeyEquals {
                key: "highway".to_owned(),
                value: "primary".to_owned()
            }
        );
        assert_eq!(parse_tag_rule("name"), TagRule::HasKey("name".to_owned()));
    }

    #[rstest]
    fn cli_parses_query_invocation() {
        let cli = Cli::try_parse_from([
            "meridian",
            "query",
            "--db",
            "map.db",
            "--bbox",
            "-1.1,50.7,-0.9,50.9",
            "--format",
            "compact",
            "--gzip",
            "--out",
            "extract.mdc.gz",
        ])
        .unwrap();
        let Command::Query(args) = cli.command else {
            panic!("expected query subcommand");
        };
        assert_eq!(args.output.format, FormatArg::Compact);
        assert!(args.output.gzip);
    }

    #[rstest]
    fn end_to_end_init_load_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("map.db");
        let doc = dir.path().join("in.xml");
        std::fs::write(
            &doc,
            br#"<osm version="0.6">
  <node id="1" lat="50.8" lon="-1.05" version="1" changeset="5" timestamp="100"/>
  <node id="2" lat="51.5" lon="-0.5" version="1" changeset="5" timestamp="100"/>
  <way id="10" version="1" changeset="5" timestamp="100"><nd ref="1"/><nd ref="2"/></way>
</osm>"#,
        )
        .unwrap();

        run_from(["meridian", "init", "--db", db.to_str().unwrap()]).unwrap();
        run_from([
            "meridian",
            "load",
            "--db",
            db.to_str().unwrap(),
            doc.to_str().unwrap(),
        ])
        .unwrap();

        let out = dir.path().join("out.xml");
        run_from([
            "meridian",
            "query",
            "--db",
            db.to_str().unwrap(),
            "--bbox",
            "-1.1473846,50.7360206,-0.9901428,50.8649113",
            "--out",
            out.to_str().unwrap(),
        ])
        .unwrap();

        let produced = std::fs::read(&out).unwrap();
        let map = Format::Xml.decode(&mut produced.as_slice()).unwrap();
        assert!(map.node(1).is_some());
        assert!(map.node(2).is_some());
        assert!(map.way(10).is_some());
    }
}
