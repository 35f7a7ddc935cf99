//! Changeset application and diff extraction.
//!
//! A changeset batch is applied strictly in ascending sequence order inside
//! one transaction. Entries whose version is not newer than the stored one
//! are stale — skipped and counted, never fatal. An entry that skips over a
//! missing predecessor version is a gap and aborts the whole batch; nothing
//! past the gap (or before it) stays visible. Deletes tombstone rather than
//! remove, preserving history.

use log::{debug, info, warn};
use meridian_core::{ChangeAction, Changeset, Element, ElementKind};

use crate::error::StoreError;
use crate::store::{SpatialStore, StoreTransaction, WriteOutcome};

/// Where a replication run ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Nothing has been applied yet.
    Idle,
    /// Entries are being applied inside the transaction.
    Applying,
    /// The batch committed.
    Committed,
    /// The batch rolled back.
    Aborted,
}

/// Summary of one applied changeset batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Final state of the run.
    pub state: ReplicationState,
    /// Changeset that was applied.
    pub changeset: i64,
    /// Entries written to the store.
    pub applied: u64,
    /// Entries skipped because their version was not newer than the
    /// stored one.
    pub stale: u64,
}

/// Apply one ordered changeset batch atomically.
///
/// On success every applicable entry is committed and the replication
/// cursor advances to the changeset id. On any error — including a version
/// gap — the transaction rolls back and the store is left exactly as it
/// was.
pub fn apply_changeset(
    store: &mut SpatialStore,
    changeset: &Changeset,
) -> Result<ReplicationReport, StoreError> {
    changeset.validate_order()?;
    debug!("changeset {}: idle -> applying", changeset.id);

    let tx = store.transaction()?;
    match apply_entries(&tx, changeset) {
        Ok((applied, stale)) => {
            tx.set_replication_cursor(changeset.id)?;
            tx.commit()?;
            info!(
                "changeset {}: committed ({applied} applied, {stale} stale)",
                changeset.id
            );
            Ok(ReplicationReport {
                state: ReplicationState::Committed,
                changeset: changeset.id,
                applied,
                stale,
            })
        }
        Err(err) => {
            // Dropping the transaction rolls back; nothing before the
            // failure stays visible.
            warn!("changeset {}: aborted ({err})", changeset.id);
            drop(tx);
            Err(err)
        }
    }
}

fn apply_entries(
    tx: &StoreTransaction<'_>,
    changeset: &Changeset,
) -> Result<(u64, u64), StoreError> {
    let mut applied = 0u64;
    let mut stale = 0u64;
    for entry in &changeset.entries {
        tx.check_deadline("apply_changeset")?;
        let kind = entry.element.kind();
        let id = entry.element.id();
        let incoming = entry.element.meta().version;
        let stored = tx.stored_version(kind, id)?.unwrap_or(0);

        if incoming <= stored {
            debug!(
                "entry {}: {kind} {id} v{incoming} is stale against stored v{stored}",
                entry.sequence
            );
            stale += 1;
            continue;
        }
        if incoming > stored + 1 {
            return Err(StoreError::ReplicationGap {
                sequence: entry.sequence,
                kind,
                id,
                stored,
                incoming,
            });
        }

        match tx.apply_write(entry.action, &entry.element, stored)? {
            WriteOutcome::Applied => applied += 1,
            WriteOutcome::VersionConflict { stored } => {
                warn!(
                    "entry {}: {kind} {id} conflicted against stored v{stored}; skipping",
                    entry.sequence
                );
                stale += 1;
            }
            // Deleting or modifying an element the store has never seen
            // means its create never arrived.
            WriteOutcome::NotFound => {
                return Err(StoreError::ReplicationGap {
                    sequence: entry.sequence,
                    kind,
                    id,
                    stored,
                    incoming,
                });
            }
        }
    }
    Ok((applied, stale))
}

/// Build an ordered diff of every element whose timestamp falls in
/// `(since, until]`, tombstones included.
///
/// The entry action is inferred from the stored row: invisible rows become
/// deletes, version-1 rows creates, everything else modifies. Sequence
/// numbers follow timestamp order.
pub fn extract_diff(
    store: &mut SpatialStore,
    since: i64,
    until: i64,
    changeset_id: i64,
) -> Result<Changeset, StoreError> {
    let tx = store.transaction()?;
    let mut stamped: Vec<(i64, Element)> = Vec::new();
    for kind in [ElementKind::Node, ElementKind::Way, ElementKind::Relation] {
        for element in tx.elements_in_window(kind, since, until)? {
            stamped.push((element.meta().timestamp, element));
        }
    }
    tx.commit()?;

    stamped.sort_by_key(|(timestamp, element)| (*timestamp, element.kind(), element.id()));

    let mut changeset = Changeset::new(changeset_id);
    for (sequence, (_, element)) in stamped.into_iter().enumerate() {
        let action = if !element.meta().visible {
            ChangeAction::Delete
        } else if element.meta().version == 1 {
            ChangeAction::Create
        } else {
            ChangeAction::Modify
        };
        changeset.push(sequence as u64 + 1, action, element);
    }
    debug!(
        "extracted diff {} with {} entries for window ({since}, {until}]",
        changeset.id,
        changeset.entries.len()
    );
    Ok(changeset)
}

/// Last committed replication checkpoint, if any.
pub fn replication_cursor(store: &mut SpatialStore) -> Result<Option<i64>, StoreError> {
    let tx = store.transaction()?;
    let cursor = tx.replication_cursor()?;
    tx.commit()?;
    Ok(cursor)
}
