//! Relational schema for map elements.
//!
//! Every table name is built from the configured prefix so production and
//! test schemas can share one database file. Element tables carry the full
//! row (metadata columns, tags and ordered references as JSON text);
//! membership tables are pure reverse-lookup indexes rebuilt on every
//! write. Node positions are fixed-point nanodegree columns under a
//! composite index which serves the bounding-box predicate.

use rusqlite::Connection;

use crate::error::StoreError;

/// Table names derived from one configuration prefix.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    pub nodes: String,
    pub ways: String,
    pub way_members: String,
    pub relations: String,
    pub relation_members: String,
    pub replication_state: String,
}

impl Tables {
    pub(crate) fn with_prefix(prefix: &str) -> Self {
        Self {
            nodes: format!("{prefix}nodes"),
            ways: format!("{prefix}ways"),
            way_members: format!("{prefix}way_members"),
            relations: format!("{prefix}relations"),
            relation_members: format!("{prefix}relation_members"),
            replication_state: format!("{prefix}replication_state"),
        }
    }
}

/// Create every table and index the store needs, if absent.
pub(crate) fn initialise(conn: &Connection, tables: &Tables) -> Result<(), StoreError> {
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {nodes} (
                id INTEGER PRIMARY KEY,
                lat INTEGER NOT NULL,
                lon INTEGER NOT NULL,
                version INTEGER NOT NULL,
                changeset INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                username TEXT NOT NULL,
                visible INTEGER NOT NULL,
                tags TEXT NOT NULL
            )",
            nodes = tables.nodes
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {nodes}_position ON {nodes} (lat, lon)",
            nodes = tables.nodes
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {nodes}_timestamp ON {nodes} (timestamp)",
            nodes = tables.nodes
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {ways} (
                id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                changeset INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                username TEXT NOT NULL,
                visible INTEGER NOT NULL,
                tags TEXT NOT NULL,
                refs TEXT NOT NULL
            )",
            ways = tables.ways
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {ways}_timestamp ON {ways} (timestamp)",
            ways = tables.ways
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {way_members} (
                way_id INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                PRIMARY KEY (way_id, idx)
            )",
            way_members = tables.way_members
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {way_members}_node ON {way_members} (node_id)",
            way_members = tables.way_members
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {relations} (
                id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                changeset INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                username TEXT NOT NULL,
                visible INTEGER NOT NULL,
                tags TEXT NOT NULL,
                members TEXT NOT NULL
            )",
            relations = tables.relations
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {relations}_timestamp ON {relations} (timestamp)",
            relations = tables.relations
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {relation_members} (
                relation_id INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                member_kind TEXT NOT NULL,
                member_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (relation_id, idx)
            )",
            relation_members = tables.relation_members
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {relation_members}_member
                ON {relation_members} (member_kind, member_id)",
            relation_members = tables.relation_members
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {replication_state} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                sequence INTEGER NOT NULL
            )",
            replication_state = tables.replication_state
        ),
    ];
    for statement in &statements {
        conn.execute(statement, [])?;
    }
    Ok(())
}

/// Whether the element tables exist under the configured prefix.
pub(crate) fn is_ready(conn: &Connection, tables: &Tables) -> Result<bool, StoreError> {
    let mut statement =
        conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    for table in [&tables.nodes, &tables.ways, &tables.relations] {
        let count: i64 = statement.query_row([table], |row| row.get(0))?;
        if count == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}
