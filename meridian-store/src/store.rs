//! SQLite-backed spatial store.
//!
//! All reads and writes run inside a caller-scoped [`StoreTransaction`];
//! dropping the transaction without committing rolls every change back,
//! including on error paths. Mutation goes exclusively through
//! [`StoreTransaction::apply_write`], which is atomic per call and enforces
//! the expected-version contract; no other component writes to the backend.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use geo::Rect;
use log::debug;
use meridian_core::{
    ChangeAction, Element, ElementKind, Member, Metadata, NanoDegrees, Node, Relation, Tags, Way,
};
use rusqlite::{Connection, OpenFlags, Row, params, params_from_iter};

use crate::error::StoreError;
use crate::schema::{self, Tables};

/// SQLite limits bound parameters per statement to 999 by default. The
/// store chunks `IN` queries to remain below that ceiling.
const SQLITE_MAX_VARIABLE_NUMBER: usize = 999;

/// Where the backing database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorePath {
    /// Private in-memory database, handy for tests and scratch imports.
    Memory,
    /// Database file on disk.
    File(PathBuf),
}

/// Store configuration.
///
/// The table prefix selects the schema (production vs test) without
/// branching query logic; the optional statement timeout is the caller's
/// cancellation deadline, checked at every operation boundary.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database location.
    pub path: StorePath,
    /// Prefix applied to every table name.
    pub table_prefix: String,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// Deadline applied to each transaction; `None` means unbounded.
    pub statement_timeout: Option<Duration>,
}

impl StoreConfig {
    /// Configuration for an on-disk store with the default prefix.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: StorePath::File(path.into()),
            ..Self::in_memory()
        }
    }

    /// Configuration for a private in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: StorePath::Memory,
            table_prefix: String::new(),
            busy_timeout: Duration::from_secs(5),
            statement_timeout: None,
        }
    }

    /// Use a different table prefix (for example a test schema).
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Apply a statement deadline to every transaction.
    #[must_use]
    pub const fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

/// Outcome of a single entity write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied.
    Applied,
    /// The stored version did not match the caller's expectation.
    VersionConflict {
        /// Version actually stored (0 when the row is absent).
        stored: u32,
    },
    /// Modify or delete targeted an element the store has never seen.
    NotFound,
}

/// Connection to the relational spatial backend.
pub struct SpatialStore {
    conn: Connection,
    config: StoreConfig,
    tables: Tables,
}

impl std::fmt::Debug for SpatialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialStore")
            .field("path", &self.config.path)
            .field("table_prefix", &self.config.table_prefix)
            .finish_non_exhaustive()
    }
}

impl SpatialStore {
    /// Open (or create) the backing database.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let conn = match &config.path {
            StorePath::Memory => Connection::open_in_memory().map_err(|source| {
                StoreError::OpenDatabase {
                    path: PathBuf::from(":memory:"),
                    source,
                }
            })?,
            StorePath::File(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
            .map_err(|source| StoreError::OpenDatabase {
                path: path.clone(),
                source,
            })?,
        };
        conn.busy_timeout(config.busy_timeout)?;
        let tables = Tables::with_prefix(&config.table_prefix);
        Ok(Self {
            conn,
            config,
            tables,
        })
    }

    /// Create the schema under the configured prefix, if absent.
    pub fn initialise(&self) -> Result<(), StoreError> {
        schema::initialise(&self.conn, &self.tables)
    }

    /// Whether the schema exists under the configured prefix.
    pub fn is_ready(&self) -> Result<bool, StoreError> {
        schema::is_ready(&self.conn, &self.tables)
    }

    /// Begin a caller-scoped transaction.
    ///
    /// Every read and write happens through the returned handle; dropping
    /// it without [`StoreTransaction::commit`] rolls back.
    pub fn transaction(&mut self) -> Result<StoreTransaction<'_>, StoreError> {
        let deadline = self.config.statement_timeout.map(|t| Instant::now() + t);
        let tx = self.conn.transaction()?;
        Ok(StoreTransaction {
            tx,
            tables: self.tables.clone(),
            deadline,
        })
    }
}

/// One unit of work against the store.
pub struct StoreTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    tables: Tables,
    deadline: Option<Instant>,
}

impl StoreTransaction<'_> {
    /// Commit the transaction.
    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }

    /// Roll the transaction back explicitly (dropping does the same).
    pub fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback()?;
        Ok(())
    }

    /// Enforce the caller's deadline; timing out rolls back with no
    /// partial result.
    pub(crate) fn check_deadline(&self, operation: &'static str) -> Result<(), StoreError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(StoreError::Timeout { operation })
            }
            _ => Ok(()),
        }
    }

    /// Live nodes inside the bounding box (boundary inclusive).
    pub fn nodes_in_bbox(&self, bbox: &Rect<f64>) -> Result<Vec<Node>, StoreError> {
        self.check_deadline("nodes_in_bbox")?;
        let sql = format!(
            "SELECT id, lat, lon, version, changeset, timestamp, uid, username, visible, tags
             FROM {nodes}
             WHERE visible = 1 AND lat BETWEEN ?1 AND ?2 AND lon BETWEEN ?3 AND ?4
             ORDER BY id",
            nodes = self.tables.nodes
        );
        let mut statement = self.tx.prepare(&sql)?;
        let mut rows = statement.query(params![
            NanoDegrees::from_degrees(bbox.min().y).nanos(),
            NanoDegrees::from_degrees(bbox.max().y).nanos(),
            NanoDegrees::from_degrees(bbox.min().x).nanos(),
            NanoDegrees::from_degrees(bbox.max().x).nanos(),
        ])?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            nodes.push(node_from_row(row)?);
        }
        Ok(nodes)
    }

    /// Live nodes with the given identifiers, ordered by id.
    pub fn nodes_by_id(&self, ids: &BTreeSet<i64>) -> Result<Vec<Node>, StoreError> {
        self.check_deadline("nodes_by_id")?;
        let mut nodes = Vec::new();
        self.for_id_chunks(ids, |chunk, placeholders| {
            let sql = format!(
                "SELECT id, lat, lon, version, changeset, timestamp, uid, username, visible, tags
                 FROM {nodes}
                 WHERE visible = 1 AND id IN ({placeholders})
                 ORDER BY id",
                nodes = self.tables.nodes
            );
            let mut statement = self.tx.prepare(&sql)?;
            let mut rows = statement.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                nodes.push(node_from_row(row)?);
            }
            Ok(())
        })?;
        Ok(nodes)
    }

    /// Live ways with the given identifiers, ordered by id.
    pub fn ways_by_id(&self, ids: &BTreeSet<i64>) -> Result<Vec<Way>, StoreError> {
        self.check_deadline("ways_by_id")?;
        let mut ways = Vec::new();
        self.for_id_chunks(ids, |chunk, placeholders| {
            let sql = format!(
                "SELECT id, version, changeset, timestamp, uid, username, visible, tags, refs
                 FROM {ways}
                 WHERE visible = 1 AND id IN ({placeholders})
                 ORDER BY id",
                ways = self.tables.ways
            );
            let mut statement = self.tx.prepare(&sql)?;
            let mut rows = statement.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                ways.push(way_from_row(row)?);
            }
            Ok(())
        })?;
        Ok(ways)
    }

    /// Live relations with the given identifiers, ordered by id.
    pub fn relations_by_id(&self, ids: &BTreeSet<i64>) -> Result<Vec<Relation>, StoreError> {
        self.check_deadline("relations_by_id")?;
        let mut relations = Vec::new();
        self.for_id_chunks(ids, |chunk, placeholders| {
            let sql = format!(
                "SELECT id, version, changeset, timestamp, uid, username, visible, tags, members
                 FROM {relations}
                 WHERE visible = 1 AND id IN ({placeholders})
                 ORDER BY id",
                relations = self.tables.relations
            );
            let mut statement = self.tx.prepare(&sql)?;
            let mut rows = statement.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                relations.push(relation_from_row(row)?);
            }
            Ok(())
        })?;
        Ok(relations)
    }

    /// Live ways referencing at least one of the given nodes.
    pub fn ways_containing_nodes(&self, node_ids: &BTreeSet<i64>) -> Result<Vec<Way>, StoreError> {
        self.check_deadline("ways_containing_nodes")?;
        let mut ways = Vec::new();
        let mut seen: BTreeSet<i64> = BTreeSet::new();
        self.for_id_chunks(node_ids, |chunk, placeholders| {
            let sql = format!(
                "SELECT DISTINCT w.id, w.version, w.changeset, w.timestamp, w.uid, w.username,
                        w.visible, w.tags, w.refs
                 FROM {way_members} m
                 INNER JOIN {ways} w ON w.id = m.way_id
                 WHERE w.visible = 1 AND m.node_id IN ({placeholders})
                 ORDER BY w.id",
                way_members = self.tables.way_members,
                ways = self.tables.ways
            );
            let mut statement = self.tx.prepare(&sql)?;
            let mut rows = statement.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let way = way_from_row(row)?;
                if seen.insert(way.id) {
                    ways.push(way);
                }
            }
            Ok(())
        })?;
        Ok(ways)
    }

    /// Live relations holding a member of `kind` among the given ids,
    /// excluding relation ids in `skip`.
    pub fn relations_referencing(
        &self,
        kind: ElementKind,
        ids: &BTreeSet<i64>,
        skip: &BTreeSet<i64>,
    ) -> Result<Vec<Relation>, StoreError> {
        self.check_deadline("relations_referencing")?;
        let mut relations = Vec::new();
        let mut seen: BTreeSet<i64> = skip.clone();
        self.for_id_chunks(ids, |chunk, placeholders| {
            let sql = format!(
                "SELECT DISTINCT r.id, r.version, r.changeset, r.timestamp, r.uid, r.username,
                        r.visible, r.tags, r.members
                 FROM {relation_members} m
                 INNER JOIN {relations} r ON r.id = m.relation_id
                 WHERE r.visible = 1 AND m.member_kind = ? AND m.member_id IN ({placeholders})
                 ORDER BY r.id",
                relation_members = self.tables.relation_members,
                relations = self.tables.relations
            );
            let mut statement = self.tx.prepare(&sql)?;
            let bound = std::iter::once(rusqlite::types::Value::from(kind.as_str().to_owned()))
                .chain(chunk.iter().map(|&id| rusqlite::types::Value::from(id)));
            let mut rows = statement.query(params_from_iter(bound))?;
            while let Some(row) = rows.next()? {
                let relation = relation_from_row(row)?;
                if seen.insert(relation.id) {
                    relations.push(relation);
                }
            }
            Ok(())
        })?;
        Ok(relations)
    }

    /// Every element of one kind, ordered by id; tombstones included on
    /// request.
    pub fn all_of_kind(
        &self,
        kind: ElementKind,
        only_visible: bool,
    ) -> Result<Vec<Element>, StoreError> {
        self.check_deadline("all_of_kind")?;
        let predicate = if only_visible { "WHERE visible = 1" } else { "" };
        let sql = match kind {
            ElementKind::Node => format!(
                "SELECT id, lat, lon, version, changeset, timestamp, uid, username, visible, tags
                 FROM {nodes} {predicate} ORDER BY id",
                nodes = self.tables.nodes
            ),
            ElementKind::Way => format!(
                "SELECT id, version, changeset, timestamp, uid, username, visible, tags, refs
                 FROM {ways} {predicate} ORDER BY id",
                ways = self.tables.ways
            ),
            ElementKind::Relation => format!(
                "SELECT id, version, changeset, timestamp, uid, username, visible, tags, members
                 FROM {relations} {predicate} ORDER BY id",
                relations = self.tables.relations
            ),
        };
        let mut statement = self.tx.prepare(&sql)?;
        let mut rows = statement.query([])?;
        let mut elements = Vec::new();
        while let Some(row) = rows.next()? {
            elements.push(match kind {
                ElementKind::Node => Element::Node(node_from_row(row)?),
                ElementKind::Way => Element::Way(way_from_row(row)?),
                ElementKind::Relation => Element::Relation(relation_from_row(row)?),
            });
        }
        Ok(elements)
    }

    /// Elements of one kind whose timestamp falls in `(since, until]`,
    /// ordered by timestamp. Tombstones are included: a replication diff
    /// must carry deletions.
    pub fn elements_in_window(
        &self,
        kind: ElementKind,
        since: i64,
        until: i64,
    ) -> Result<Vec<Element>, StoreError> {
        self.check_deadline("elements_in_window")?;
        let sql = match kind {
            ElementKind::Node => format!(
                "SELECT id, lat, lon, version, changeset, timestamp, uid, username, visible, tags
                 FROM {nodes} WHERE timestamp > ?1 AND timestamp <= ?2 ORDER BY timestamp, id",
                nodes = self.tables.nodes
            ),
            ElementKind::Way => format!(
                "SELECT id, version, changeset, timestamp, uid, username, visible, tags, refs
                 FROM {ways} WHERE timestamp > ?1 AND timestamp <= ?2 ORDER BY timestamp, id",
                ways = self.tables.ways
            ),
            ElementKind::Relation => format!(
                "SELECT id, version, changeset, timestamp, uid, username, visible, tags, members
                 FROM {relations} WHERE timestamp > ?1 AND timestamp <= ?2 ORDER BY timestamp, id",
                relations = self.tables.relations
            ),
        };
        let mut statement = self.tx.prepare(&sql)?;
        let mut rows = statement.query(params![since, until])?;
        let mut elements = Vec::new();
        while let Some(row) = rows.next()? {
            elements.push(match kind {
                ElementKind::Node => Element::Node(node_from_row(row)?),
                ElementKind::Way => Element::Way(way_from_row(row)?),
                ElementKind::Relation => Element::Relation(relation_from_row(row)?),
            });
        }
        Ok(elements)
    }

    /// The version currently stored for an element, visible or not.
    pub fn stored_version(&self, kind: ElementKind, id: i64) -> Result<Option<u32>, StoreError> {
        let table = match kind {
            ElementKind::Node => &self.tables.nodes,
            ElementKind::Way => &self.tables.ways,
            ElementKind::Relation => &self.tables.relations,
        };
        let sql = format!("SELECT version FROM {table} WHERE id = ?1");
        let mut statement = self.tx.prepare(&sql)?;
        let mut rows = statement.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Apply one entity write atomically.
    ///
    /// `expected_version` is the version the caller believes the store
    /// holds (0 for a brand-new element). A mismatch yields
    /// [`WriteOutcome::VersionConflict`]; modify/delete against an absent
    /// row yields [`WriteOutcome::NotFound`]. Deletes tombstone the row
    /// (`visible = 0`) and clear its membership index, preserving history.
    pub fn apply_write(
        &self,
        action: ChangeAction,
        element: &Element,
        expected_version: u32,
    ) -> Result<WriteOutcome, StoreError> {
        self.check_deadline("apply_write")?;
        let kind = element.kind();
        let id = element.id();
        let stored = self.stored_version(kind, id)?;

        match (action, stored) {
            (ChangeAction::Create, Some(stored)) => {
                return Ok(WriteOutcome::VersionConflict { stored });
            }
            (ChangeAction::Create, None) if expected_version != 0 => {
                return Ok(WriteOutcome::VersionConflict { stored: 0 });
            }
            (ChangeAction::Modify | ChangeAction::Delete, None) => {
                return Ok(WriteOutcome::NotFound);
            }
            (ChangeAction::Modify | ChangeAction::Delete, Some(stored))
                if stored != expected_version =>
            {
                return Ok(WriteOutcome::VersionConflict { stored });
            }
            _ => {}
        }

        debug!(
            "applying {} to {} {} (expected version {})",
            action.as_str(),
            kind,
            id,
            expected_version
        );
        match action {
            ChangeAction::Create => self.insert_element(element)?,
            ChangeAction::Modify => self.update_element(element)?,
            ChangeAction::Delete => self.tombstone_element(element)?,
        }
        Ok(WriteOutcome::Applied)
    }

    /// Last replication sequence recorded by [`set_replication_cursor`].
    ///
    /// [`set_replication_cursor`]: Self::set_replication_cursor
    pub fn replication_cursor(&self) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "SELECT sequence FROM {state} WHERE id = 1",
            state = self.tables.replication_state
        );
        let mut statement = self.tx.prepare(&sql)?;
        let mut rows = statement.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Persist the replication checkpoint for resumable replay.
    pub fn set_replication_cursor(&self, sequence: i64) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {state} (id, sequence) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET sequence = excluded.sequence",
            state = self.tables.replication_state
        );
        self.tx.execute(&sql, params![sequence])?;
        Ok(())
    }

    fn insert_element(&self, element: &Element) -> Result<(), StoreError> {
        match element {
            Element::Node(node) => {
                let sql = format!(
                    "INSERT INTO {nodes}
                        (id, lat, lon, version, changeset, timestamp, uid, username, visible, tags)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    nodes = self.tables.nodes
                );
                self.tx.execute(
                    &sql,
                    params![
                        node.id,
                        node.lat.nanos(),
                        node.lon.nanos(),
                        node.meta.version,
                        node.meta.changeset,
                        node.meta.timestamp,
                        node.meta.uid,
                        node.meta.user,
                        node.meta.visible,
                        encode_tags(&node.tags),
                    ],
                )?;
            }
            Element::Way(way) => {
                let sql = format!(
                    "INSERT INTO {ways}
                        (id, version, changeset, timestamp, uid, username, visible, tags, refs)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    ways = self.tables.ways
                );
                self.tx.execute(
                    &sql,
                    params![
                        way.id,
                        way.meta.version,
                        way.meta.changeset,
                        way.meta.timestamp,
                        way.meta.uid,
                        way.meta.user,
                        way.meta.visible,
                        encode_tags(&way.tags),
                        encode_refs(&way.refs),
                    ],
                )?;
                self.rebuild_way_members(way)?;
            }
            Element::Relation(relation) => {
                let sql = format!(
                    "INSERT INTO {relations}
                        (id, version, changeset, timestamp, uid, username, visible, tags, members)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    relations = self.tables.relations
                );
                self.tx.execute(
                    &sql,
                    params![
                        relation.id,
                        relation.meta.version,
                        relation.meta.changeset,
                        relation.meta.timestamp,
                        relation.meta.uid,
                        relation.meta.user,
                        relation.meta.visible,
                        encode_tags(&relation.tags),
                        encode_members(&relation.members),
                    ],
                )?;
                self.rebuild_relation_members(relation)?;
            }
        }
        Ok(())
    }

    fn update_element(&self, element: &Element) -> Result<(), StoreError> {
        match element {
            Element::Node(node) => {
                let sql = format!(
                    "UPDATE {nodes} SET lat = ?2, lon = ?3, version = ?4, changeset = ?5,
                        timestamp = ?6, uid = ?7, username = ?8, visible = ?9, tags = ?10
                     WHERE id = ?1",
                    nodes = self.tables.nodes
                );
                self.tx.execute(
                    &sql,
                    params![
                        node.id,
                        node.lat.nanos(),
                        node.lon.nanos(),
                        node.meta.version,
                        node.meta.changeset,
                        node.meta.timestamp,
                        node.meta.uid,
                        node.meta.user,
                        node.meta.visible,
                        encode_tags(&node.tags),
                    ],
                )?;
            }
            Element::Way(way) => {
                let sql = format!(
                    "UPDATE {ways} SET version = ?2, changeset = ?3, timestamp = ?4, uid = ?5,
                        username = ?6, visible = ?7, tags = ?8, refs = ?9
                     WHERE id = ?1",
                    ways = self.tables.ways
                );
                self.tx.execute(
                    &sql,
                    params![
                        way.id,
                        way.meta.version,
                        way.meta.changeset,
                        way.meta.timestamp,
                        way.meta.uid,
                        way.meta.user,
                        way.meta.visible,
                        encode_tags(&way.tags),
                        encode_refs(&way.refs),
                    ],
                )?;
                self.rebuild_way_members(way)?;
            }
            Element::Relation(relation) => {
                let sql = format!(
                    "UPDATE {relations} SET version = ?2, changeset = ?3, timestamp = ?4,
                        uid = ?5, username = ?6, visible = ?7, tags = ?8, members = ?9
                     WHERE id = ?1",
                    relations = self.tables.relations
                );
                self.tx.execute(
                    &sql,
                    params![
                        relation.id,
                        relation.meta.version,
                        relation.meta.changeset,
                        relation.meta.timestamp,
                        relation.meta.uid,
                        relation.meta.user,
                        relation.meta.visible,
                        encode_tags(&relation.tags),
                        encode_members(&relation.members),
                    ],
                )?;
                self.rebuild_relation_members(relation)?;
            }
        }
        Ok(())
    }

    fn tombstone_element(&self, element: &Element) -> Result<(), StoreError> {
        let meta = element.meta();
        let (table, members_table, members_key) = match element.kind() {
            ElementKind::Node => (&self.tables.nodes, None, ""),
            ElementKind::Way => (&self.tables.ways, Some(&self.tables.way_members), "way_id"),
            ElementKind::Relation => (
                &self.tables.relations,
                Some(&self.tables.relation_members),
                "relation_id",
            ),
        };
        let sql = format!(
            "UPDATE {table} SET version = ?2, changeset = ?3, timestamp = ?4, uid = ?5,
                username = ?6, visible = 0
             WHERE id = ?1"
        );
        self.tx.execute(
            &sql,
            params![
                element.id(),
                meta.version,
                meta.changeset,
                meta.timestamp,
                meta.uid,
                meta.user,
            ],
        )?;
        if let Some(members_table) = members_table {
            let sql = format!("DELETE FROM {members_table} WHERE {members_key} = ?1");
            self.tx.execute(&sql, params![element.id()])?;
        }
        Ok(())
    }

    fn rebuild_way_members(&self, way: &Way) -> Result<(), StoreError> {
        let delete = format!(
            "DELETE FROM {way_members} WHERE way_id = ?1",
            way_members = self.tables.way_members
        );
        self.tx.execute(&delete, params![way.id])?;
        let insert = format!(
            "INSERT INTO {way_members} (way_id, idx, node_id) VALUES (?1, ?2, ?3)",
            way_members = self.tables.way_members
        );
        let mut statement = self.tx.prepare(&insert)?;
        for (idx, node_id) in way.refs.iter().enumerate() {
            statement.execute(params![way.id, idx as i64, node_id])?;
        }
        Ok(())
    }

    fn rebuild_relation_members(&self, relation: &Relation) -> Result<(), StoreError> {
        let delete = format!(
            "DELETE FROM {relation_members} WHERE relation_id = ?1",
            relation_members = self.tables.relation_members
        );
        self.tx.execute(&delete, params![relation.id])?;
        let insert = format!(
            "INSERT INTO {relation_members} (relation_id, idx, member_kind, member_id, role)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            relation_members = self.tables.relation_members
        );
        let mut statement = self.tx.prepare(&insert)?;
        for (idx, member) in relation.members.iter().enumerate() {
            statement.execute(params![
                relation.id,
                idx as i64,
                member.kind.as_str(),
                member.id,
                member.role,
            ])?;
        }
        Ok(())
    }

    /// Run `body` once per id chunk, staying under the parameter ceiling.
    fn for_id_chunks<F>(&self, ids: &BTreeSet<i64>, mut body: F) -> Result<(), StoreError>
    where
        F: FnMut(&[i64], &str) -> Result<(), StoreError>,
    {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().copied().collect();
        // One slot stays free for an extra leading parameter.
        for chunk in ids.chunks(SQLITE_MAX_VARIABLE_NUMBER - 1) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            body(chunk, &placeholders)?;
        }
        Ok(())
    }
}

// Tags serialise as an ordered pair array, preserving insertion order.
fn encode_tags(tags: &Tags) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_owned())
}

fn encode_refs(refs: &[i64]) -> String {
    serde_json::to_string(refs).unwrap_or_else(|_| "[]".to_owned())
}

fn encode_members(members: &[Member]) -> String {
    serde_json::to_string(members).unwrap_or_else(|_| "[]".to_owned())
}

fn meta_from_row(row: &Row<'_>, first_column: usize) -> Result<Metadata, StoreError> {
    Ok(Metadata {
        version: row.get(first_column)?,
        changeset: row.get(first_column + 1)?,
        timestamp: row.get(first_column + 2)?,
        uid: row.get(first_column + 3)?,
        user: row.get(first_column + 4)?,
        visible: row.get(first_column + 5)?,
    })
}

fn node_from_row(row: &Row<'_>) -> Result<Node, StoreError> {
    let id: i64 = row.get(0)?;
    let lat: i64 = row.get(1)?;
    let lon: i64 = row.get(2)?;
    let meta = meta_from_row(row, 3)?;
    let tags_json: String = row.get(9)?;
    let tags: Tags = serde_json::from_str(&tags_json).map_err(|source| StoreError::InvalidTags {
        kind: ElementKind::Node,
        id,
        source,
    })?;
    Node::new(
        id,
        NanoDegrees::from_nanos(lat),
        NanoDegrees::from_nanos(lon),
        tags,
        meta,
    )
    .map_err(|source| StoreError::InvalidStored {
        kind: ElementKind::Node,
        id,
        source,
    })
}

fn way_from_row(row: &Row<'_>) -> Result<Way, StoreError> {
    let id: i64 = row.get(0)?;
    let meta = meta_from_row(row, 1)?;
    let tags_json: String = row.get(7)?;
    let tags: Tags = serde_json::from_str(&tags_json).map_err(|source| StoreError::InvalidTags {
        kind: ElementKind::Way,
        id,
        source,
    })?;
    let refs_json: String = row.get(8)?;
    let refs: Vec<i64> =
        serde_json::from_str(&refs_json).map_err(|source| StoreError::InvalidRefs {
            kind: ElementKind::Way,
            id,
            source,
        })?;
    Way::new(id, refs, tags, meta).map_err(|source| StoreError::InvalidStored {
        kind: ElementKind::Way,
        id,
        source,
    })
}

fn relation_from_row(row: &Row<'_>) -> Result<Relation, StoreError> {
    let id: i64 = row.get(0)?;
    let meta = meta_from_row(row, 1)?;
    let tags_json: String = row.get(7)?;
    let tags: Tags = serde_json::from_str(&tags_json).map_err(|source| StoreError::InvalidTags {
        kind: ElementKind::Relation,
        id,
        source,
    })?;
    let members_json: String = row.get(8)?;
    let members: Vec<Member> =
        serde_json::from_str(&members_json).map_err(|source| StoreError::InvalidRefs {
            kind: ElementKind::Relation,
            id,
            source,
        })?;
    Ok(Relation::new(id, members, tags, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::test_support::{node, way};
    use rstest::{fixture, rstest};

    #[fixture]
    fn store() -> SpatialStore {
        let store = SpatialStore::open(StoreConfig::in_memory()).expect("open in-memory store");
        store.initialise().expect("create schema");
        store
    }

    #[rstest]
    fn schema_is_ready_after_initialise(store: SpatialStore) {
        assert!(store.is_ready().unwrap());
    }

    #[rstest]
    fn prefixed_schema_is_independent() {
        let store = SpatialStore::open(StoreConfig::in_memory().with_prefix("test_"))
            .expect("open in-memory store");
        assert!(!store.is_ready().unwrap());
        store.initialise().unwrap();
        assert!(store.is_ready().unwrap());
    }

    #[rstest]
    fn create_then_read_round_trips(mut store: SpatialStore) {
        let fixture = node(42, 50.5, -1.25);
        let tx = store.transaction().unwrap();
        let outcome = tx
            .apply_write(ChangeAction::Create, &Element::Node(fixture.clone()), 0)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied);
        tx.commit().unwrap();

        let tx = store.transaction().unwrap();
        let found = tx.nodes_by_id(&BTreeSet::from([42])).unwrap();
        assert_eq!(found, vec![fixture]);
    }

    #[rstest]
    fn uncommitted_writes_roll_back(mut store: SpatialStore) {
        {
            let tx = store.transaction().unwrap();
            tx.apply_write(ChangeAction::Create, &Element::Node(node(1, 0.0, 0.0)), 0)
                .unwrap();
            // Dropped without commit.
        }
        let tx = store.transaction().unwrap();
        assert!(tx.nodes_by_id(&BTreeSet::from([1])).unwrap().is_empty());
    }

    #[rstest]
    fn create_conflicts_with_existing_row(mut store: SpatialStore) {
        let tx = store.transaction().unwrap();
        tx.apply_write(ChangeAction::Create, &Element::Node(node(7, 1.0, 1.0)), 0)
            .unwrap();
        let outcome = tx
            .apply_write(ChangeAction::Create, &Element::Node(node(7, 1.0, 1.0)), 0)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::VersionConflict { stored: 1 });
    }

    #[rstest]
    fn modify_requires_matching_version(mut store: SpatialStore) {
        let tx = store.transaction().unwrap();
        tx.apply_write(ChangeAction::Create, &Element::Node(node(7, 1.0, 1.0)), 0)
            .unwrap();

        let mut updated = node(7, 2.0, 2.0);
        updated.meta.version = 2;
        let outcome = tx
            .apply_write(ChangeAction::Modify, &Element::Node(updated.clone()), 9)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::VersionConflict { stored: 1 });

        let outcome = tx
            .apply_write(ChangeAction::Modify, &Element::Node(updated), 1)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied);
        assert_eq!(tx.stored_version(ElementKind::Node, 7).unwrap(), Some(2));
    }

    #[rstest]
    fn delete_tombstones_instead_of_removing(mut store: SpatialStore) {
        let tx = store.transaction().unwrap();
        tx.apply_write(ChangeAction::Create, &Element::Node(node(7, 1.0, 1.0)), 0)
            .unwrap();
        let mut tombstone = node(7, 1.0, 1.0);
        tombstone.meta.version = 2;
        tombstone.meta.visible = false;
        tx.apply_write(ChangeAction::Delete, &Element::Node(tombstone), 1)
            .unwrap();

        // Gone from live queries, still versioned in the table.
        assert!(tx.nodes_by_id(&BTreeSet::from([7])).unwrap().is_empty());
        assert_eq!(tx.stored_version(ElementKind::Node, 7).unwrap(), Some(2));
    }

    #[rstest]
    fn delete_of_unknown_element_is_not_found(store: SpatialStore) {
        let mut store = store;
        let tx = store.transaction().unwrap();
        let outcome = tx
            .apply_write(ChangeAction::Delete, &Element::Node(node(404, 0.0, 0.0)), 1)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::NotFound);
    }

    #[rstest]
    fn ways_containing_nodes_uses_membership_index(mut store: SpatialStore) {
        let tx = store.transaction().unwrap();
        for id in 1..=3 {
            tx.apply_write(
                ChangeAction::Create,
                &Element::Node(node(id, 1.0, 1.0)),
                0,
            )
            .unwrap();
        }
        tx.apply_write(
            ChangeAction::Create,
            &Element::Way(way(10, &[1, 2], &[])),
            0,
        )
        .unwrap();
        tx.apply_write(
            ChangeAction::Create,
            &Element::Way(way(11, &[3], &[])),
            0,
        )
        .unwrap();

        let found = tx.ways_containing_nodes(&BTreeSet::from([2])).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 10);
    }

    #[rstest]
    fn expired_deadline_reports_timeout() {
        let mut store = SpatialStore::open(
            StoreConfig::in_memory().with_statement_timeout(Duration::from_secs(0)),
        )
        .expect("open in-memory store");
        store.initialise().unwrap();
        let tx = store.transaction().unwrap();
        let err = tx.nodes_in_bbox(&geo::Rect::new(
            geo::Coord { x: -1.0, y: -1.0 },
            geo::Coord { x: 1.0, y: 1.0 },
        ));
        assert!(matches!(err, Err(StoreError::Timeout { .. })));
    }

    #[rstest]
    fn replication_cursor_round_trips(mut store: SpatialStore) {
        let tx = store.transaction().unwrap();
        assert_eq!(tx.replication_cursor().unwrap(), None);
        tx.set_replication_cursor(41).unwrap();
        tx.set_replication_cursor(42).unwrap();
        assert_eq!(tx.replication_cursor().unwrap(), Some(42));
    }
}
