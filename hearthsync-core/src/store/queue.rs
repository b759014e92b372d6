//! Pending-change queue, parked conflicts and their state transitions.

use super::{decode_envelope, encode_envelope, LocalStore, RecordDocument};
use crate::sync::{
    ChangeOp, ChangeState, ConflictRecord, NewChange, PendingChange, Priority, QueueStats,
};
use crate::{now_millis, DatabaseError, Result, SyncCoreError};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHANGE_COLUMNS: &str = "seq, change_id, record_id, entity_type, op, priority, state, \
     retry_count, next_retry_at, logical_ts, base_version, changed_fields, failure_reason, enqueued_at";

/// Query filter for [`LocalStore::list_changes`]. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub state: Option<ChangeState>,
    pub record_id: Option<String>,
    pub priority: Option<Priority>,
    pub limit: Option<usize>,
}

impl ChangeFilter {
    pub fn state(state: ChangeState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn record(record_id: impl Into<String>) -> Self {
        Self {
            record_id: Some(record_id.into()),
            ..Self::default()
        }
    }
}

/// Outcome of a conflict resolution to persist in one transaction.
#[derive(Debug, Clone)]
pub struct ResolutionCommit<'a> {
    pub record_id: &'a str,
    pub resolved: &'a RecordDocument,
    /// Local version the resolution was computed from.
    pub based_on: u64,
    /// Remote version the resolution was made against.
    pub remote_version: u64,
    /// Queue entries the resolution replaces.
    pub settled: &'a [Uuid],
    pub conflict_id: Option<Uuid>,
    /// Upload the resolution as a new change with this priority and retry count.
    pub requeue: Option<(Priority, u32)>,
}

pub(super) struct Carry {
    retry_count: u32,
    base_version: u64,
}

fn conversion_error<E>(index: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<PendingChange> {
    let change_id: String = row.get(1)?;
    let change_id = Uuid::parse_str(&change_id).map_err(|e| conversion_error(1, e))?;
    let fields: String = row.get(11)?;
    let changed_fields = serde_json::from_str(&fields).map_err(|e| conversion_error(11, e))?;

    Ok(PendingChange {
        seq: row.get(0)?,
        change_id,
        record_id: row.get(2)?,
        entity_type: row.get(3)?,
        op: ChangeOp::parse(&row.get::<_, String>(4)?),
        priority: Priority::from_rank(row.get(5)?),
        state: ChangeState::parse(&row.get::<_, String>(6)?),
        retry_count: row.get::<_, i64>(7)? as u32,
        next_retry_at: row.get(8)?,
        logical_ts: row.get::<_, i64>(9)? as u64,
        base_version: row.get::<_, i64>(10)? as u64,
        changed_fields,
        failure_reason: row.get(12)?,
        enqueued_at: row.get(13)?,
    })
}

fn next_logical_ts(conn: &Connection) -> Result<u64> {
    conn.execute(
        "INSERT INTO store_metadata (key, value) VALUES ('logical_clock', '1')
         ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1",
        [],
    )
    .map_err(DatabaseError::Sqlite)?;
    let value: String = conn
        .query_row(
            "SELECT value FROM store_metadata WHERE key = 'logical_clock'",
            [],
            |row| row.get(0),
        )
        .map_err(DatabaseError::Sqlite)?;
    value
        .parse()
        .map_err(|_| DatabaseError::Other(format!("Unreadable logical clock '{}'", value)).into())
}

fn refresh_sync_state(conn: &Connection, record_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE records SET sync_state = CASE
            WHEN EXISTS (SELECT 1 FROM conflicts WHERE record_id = ?1) THEN 'conflict'
            WHEN EXISTS (SELECT 1 FROM pending_changes WHERE record_id = ?1) THEN 'pending'
            ELSE 'synced' END
         WHERE record_id = ?1",
        [record_id],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

fn load_change(conn: &Connection, change_id: Uuid) -> Result<Option<PendingChange>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM pending_changes WHERE change_id = ?1", CHANGE_COLUMNS),
            [change_id.to_string()],
            change_from_row,
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?)
}

fn set_state(conn: &Connection, change_id: Uuid, state: ChangeState, now: i64) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE pending_changes SET state = ?2, updated_at = ?3 WHERE change_id = ?1",
            params![change_id.to_string(), state.as_str(), now],
        )
        .map_err(DatabaseError::Sqlite)?;
    Ok(updated > 0)
}

/// Insert a queue entry. The record row must already exist.
pub(super) fn insert_change(
    conn: &Connection,
    record_id: &str,
    entity_type: &str,
    change: NewChange,
    carry: Option<Carry>,
    now: i64,
) -> Result<PendingChange> {
    let change_id = change.change_id.unwrap_or_else(Uuid::new_v4);
    let logical_ts = next_logical_ts(conn)?;
    let (retry_count, base_version) = match carry {
        Some(carry) => (carry.retry_count, carry.base_version),
        None => {
            let synced: i64 = conn
                .query_row(
                    "SELECT synced_version FROM records WHERE record_id = ?1",
                    [record_id],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?;
            (0, synced as u64)
        }
    };
    let fields = serde_json::to_string(&change.changed_fields).map_err(DatabaseError::from)?;

    conn.execute(
        "INSERT INTO pending_changes (change_id, record_id, entity_type, op, priority, state,
                                      retry_count, next_retry_at, logical_ts, base_version,
                                      changed_fields, enqueued_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, ?8, ?9, ?10, ?7, ?7)",
        params![
            change_id.to_string(),
            record_id,
            entity_type,
            change.op.as_str(),
            change.priority.rank(),
            retry_count as i64,
            now,
            logical_ts as i64,
            base_version as i64,
            fields
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    refresh_sync_state(conn, record_id)?;

    debug!(
        "Queued {} of '{}' at {} priority",
        change.op.as_str(),
        record_id,
        change.priority.as_str()
    );

    Ok(PendingChange {
        seq: conn.last_insert_rowid(),
        change_id,
        record_id: record_id.to_string(),
        entity_type: entity_type.to_string(),
        op: change.op,
        priority: change.priority,
        state: ChangeState::Queued,
        retry_count,
        next_retry_at: now,
        logical_ts,
        base_version,
        changed_fields: change.changed_fields,
        failure_reason: None,
        enqueued_at: now,
    })
}

impl LocalStore {
    /// Claim the next eligible change and mark it in flight.
    ///
    /// Eligible means queued, due at `now_ms`, and the oldest entry of its
    /// record. Ties are broken by priority, then logical timestamp, then
    /// enqueue sequence.
    pub fn dequeue_next(&self, now_ms: i64) -> Result<Option<PendingChange>> {
        self.write(|tx| {
            let next = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM pending_changes p
                         WHERE p.state = 'queued' AND p.next_retry_at <= ?1
                           AND NOT EXISTS (
                               SELECT 1 FROM pending_changes q
                               WHERE q.record_id = p.record_id AND q.seq < p.seq)
                         ORDER BY p.priority ASC, p.logical_ts ASC, p.seq ASC
                         LIMIT 1",
                        CHANGE_COLUMNS
                    ),
                    [now_ms],
                    change_from_row,
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?;

            let Some(mut change) = next else {
                return Ok(None);
            };
            set_state(tx, change.change_id, ChangeState::InFlight, now_millis())?;
            change.state = ChangeState::InFlight;
            Ok(Some(change))
        })
    }

    /// Claim up to `limit` queued changes of the same record behind `head`,
    /// so they are sent together with it.
    pub fn absorb_followers(&self, head: &PendingChange, limit: usize) -> Result<Vec<PendingChange>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.write(|tx| {
            let followers: Vec<PendingChange> = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {} FROM pending_changes
                         WHERE record_id = ?1 AND seq > ?2
                         ORDER BY seq ASC LIMIT ?3",
                        CHANGE_COLUMNS
                    ))
                    .map_err(DatabaseError::Sqlite)?;
                let rows = stmt
                    .query_map(params![head.record_id, head.seq, limit as i64], change_from_row)
                    .map_err(DatabaseError::Sqlite)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(DatabaseError::Sqlite)?;
                rows
            };

            let now = now_millis();
            let mut absorbed = Vec::new();
            for mut change in followers {
                if change.state != ChangeState::Queued {
                    break;
                }
                set_state(tx, change.change_id, ChangeState::InFlight, now)?;
                change.state = ChangeState::InFlight;
                absorbed.push(change);
            }
            Ok(absorbed)
        })
    }

    /// Return changes to the queue, due at `next_retry_at`.
    pub fn schedule_retry(
        &self,
        change_ids: &[Uuid],
        retry_count: u32,
        next_retry_at: i64,
        reason: Option<&str>,
    ) -> Result<()> {
        let now = now_millis();
        self.write(|tx| {
            for id in change_ids {
                tx.execute(
                    "UPDATE pending_changes
                     SET state = 'queued', retry_count = ?2, next_retry_at = ?3,
                         failure_reason = ?4, updated_at = ?5
                     WHERE change_id = ?1",
                    params![id.to_string(), retry_count as i64, next_retry_at, reason, now],
                )
                .map_err(DatabaseError::Sqlite)?;
            }
            Ok(())
        })
    }

    /// Put a change in the terminal `Failed` state. It stays in the queue,
    /// blocking later changes of its record, until requeued or removed.
    pub fn mark_failed(&self, change_id: Uuid, reason: &str) -> Result<()> {
        let now = now_millis();
        let updated = self.write(|tx| {
            Ok(tx
                .execute(
                    "UPDATE pending_changes
                     SET state = 'failed', failure_reason = ?2, updated_at = ?3
                     WHERE change_id = ?1",
                    params![change_id.to_string(), reason, now],
                )
                .map_err(DatabaseError::Sqlite)?)
        })?;
        if updated == 0 {
            return Err(SyncCoreError::NotFound(format!("change {}", change_id)));
        }
        warn!("Change {} failed permanently: {}", change_id, reason);
        Ok(())
    }

    /// Drop a queue entry without sending it.
    pub fn remove_change(&self, change_id: Uuid) -> Result<bool> {
        self.write(|tx| {
            let Some(change) = load_change(tx, change_id)? else {
                return Ok(false);
            };
            tx.execute(
                "DELETE FROM pending_changes WHERE change_id = ?1",
                [change_id.to_string()],
            )
            .map_err(DatabaseError::Sqlite)?;
            refresh_sync_state(tx, &change.record_id)?;
            Ok(true)
        })
    }

    pub fn get_change(&self, change_id: Uuid) -> Result<Option<PendingChange>> {
        self.read(|conn| load_change(conn, change_id))
    }

    /// Settle acknowledged changes.
    ///
    /// The record is now at `remote_version` remotely; later changes of the same
    /// record are rebased onto it. An acknowledged tombstone with nothing left
    /// to send is purged.
    pub fn acknowledge(&self, record_id: &str, change_ids: &[Uuid], remote_version: u64) -> Result<()> {
        self.write(|tx| {
            for id in change_ids {
                tx.execute(
                    "DELETE FROM pending_changes WHERE change_id = ?1",
                    [id.to_string()],
                )
                .map_err(DatabaseError::Sqlite)?;
            }
            tx.execute(
                "UPDATE records SET synced_version = MAX(synced_version, ?2) WHERE record_id = ?1",
                params![record_id, remote_version as i64],
            )
            .map_err(DatabaseError::Sqlite)?;
            tx.execute(
                "UPDATE pending_changes SET base_version = ?2 WHERE record_id = ?1",
                params![record_id, remote_version as i64],
            )
            .map_err(DatabaseError::Sqlite)?;

            let remaining: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM pending_changes WHERE record_id = ?1",
                    [record_id],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?;
            let tombstone: Option<bool> = tx
                .query_row(
                    "SELECT is_deleted FROM records WHERE record_id = ?1",
                    [record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?;

            if remaining == 0 && tombstone == Some(true) {
                tx.execute("DELETE FROM records WHERE record_id = ?1", [record_id])
                    .map_err(DatabaseError::Sqlite)?;
                debug!("Purged acknowledged tombstone '{}'", record_id);
            } else {
                refresh_sync_state(tx, record_id)?;
            }
            Ok(())
        })
    }

    /// Park a conflict for manual resolution. The content is stored encrypted
    /// and the blocked changes move to `Conflicted`.
    pub fn park_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let json = zeroize::Zeroizing::new(serde_json::to_vec(conflict).map_err(DatabaseError::from)?);
        let envelope = self.encryption().encrypt_default(&json)?;
        let blob = encode_envelope(&envelope)?;
        let now = now_millis();

        self.write(|tx| {
            tx.execute(
                "INSERT INTO conflicts (conflict_id, record_id, strategy, envelope, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conflict.conflict_id.to_string(),
                    conflict.record_id,
                    conflict.strategy.as_str(),
                    blob,
                    conflict.created_at
                ],
            )
            .map_err(DatabaseError::Sqlite)?;
            for id in &conflict.change_ids {
                set_state(tx, *id, ChangeState::Conflicted, now)?;
            }
            refresh_sync_state(tx, &conflict.record_id)
        })?;

        info!("Conflict on '{}' parked for manual resolution", conflict.record_id);
        Ok(())
    }

    fn decode_conflict(&self, blob: &[u8]) -> Result<ConflictRecord> {
        let plaintext = zeroize::Zeroizing::new(self.encryption().decrypt(&decode_envelope(blob)?)?);
        Ok(serde_json::from_slice(&plaintext).map_err(DatabaseError::from)?)
    }

    /// Parked conflicts, oldest first.
    pub fn list_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let blobs: Vec<Vec<u8>> = self.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT envelope FROM conflicts ORDER BY created_at ASC, conflict_id ASC")
                .map_err(DatabaseError::Sqlite)?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(DatabaseError::Sqlite)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(DatabaseError::Sqlite)?;
            Ok(rows)
        })?;

        blobs.iter().map(|blob| self.decode_conflict(blob)).collect()
    }

    pub fn get_conflict(&self, conflict_id: Uuid) -> Result<Option<ConflictRecord>> {
        let blob: Option<Vec<u8>> = self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT envelope FROM conflicts WHERE conflict_id = ?1",
                    [conflict_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?)
        })?;
        blob.map(|blob| self.decode_conflict(&blob)).transpose()
    }

    pub fn unresolved_conflicts(&self) -> Result<usize> {
        self.read(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))
                .map_err(DatabaseError::Sqlite)?;
            Ok(count as usize)
        })
    }

    /// Persist a conflict resolution.
    ///
    /// Writes the resolved document, marks the record synced at the remote
    /// version, drops the settled changes and the parked conflict, and, when
    /// asked, queues the resolution for upload against the remote version.
    ///
    /// Fails with [`SyncCoreError::StaleResolution`], leaving everything
    /// untouched, when the stored record is no longer at `based_on`.
    pub fn commit_resolution(&self, commit: ResolutionCommit<'_>) -> Result<Option<PendingChange>> {
        let resolved = commit.resolved;
        let envelope = self.encryption().encrypt_default(&resolved.to_bytes()?)?;
        let now = now_millis();

        self.write(|tx| {
            let stored: Option<i64> = tx
                .query_row(
                    "SELECT local_version FROM records WHERE record_id = ?1",
                    [commit.record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?;
            if let Some(found) = stored.map(|v| v as u64).filter(|v| *v != commit.based_on) {
                debug!(
                    "Resolution of '{}' is stale: local version {} is now {}",
                    commit.record_id, commit.based_on, found
                );
                return Err(SyncCoreError::StaleResolution {
                    record_id: commit.record_id.to_string(),
                    expected: commit.based_on,
                    found,
                });
            }

            for id in commit.settled {
                tx.execute(
                    "DELETE FROM pending_changes WHERE change_id = ?1",
                    [id.to_string()],
                )
                .map_err(DatabaseError::Sqlite)?;
            }
            if let Some(conflict_id) = commit.conflict_id {
                tx.execute(
                    "DELETE FROM conflicts WHERE conflict_id = ?1",
                    [conflict_id.to_string()],
                )
                .map_err(DatabaseError::Sqlite)?;
            }

            let remaining: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM pending_changes WHERE record_id = ?1",
                    [commit.record_id],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?;

            if resolved.deleted && commit.requeue.is_none() && remaining == 0 {
                tx.execute("DELETE FROM records WHERE record_id = ?1", [commit.record_id])
                    .map_err(DatabaseError::Sqlite)?;
                return Ok(None);
            }

            self.upsert_record(
                tx,
                commit.record_id,
                &resolved.entity_type,
                &envelope,
                Some(resolved.version),
                Some(resolved.deleted),
                now,
            )?;
            tx.execute(
                "UPDATE records SET synced_version = ?2 WHERE record_id = ?1",
                params![commit.record_id, commit.remote_version as i64],
            )
            .map_err(DatabaseError::Sqlite)?;
            tx.execute(
                "UPDATE pending_changes SET base_version = ?2 WHERE record_id = ?1",
                params![commit.record_id, commit.remote_version as i64],
            )
            .map_err(DatabaseError::Sqlite)?;

            let requeued = match commit.requeue {
                Some((priority, retry_count)) => {
                    let op = if resolved.deleted {
                        ChangeOp::Delete
                    } else {
                        ChangeOp::Update
                    };
                    let fields: Vec<String> = resolved.fields.keys().cloned().collect();
                    Some(insert_change(
                        tx,
                        commit.record_id,
                        &resolved.entity_type,
                        NewChange::new(op, priority).with_fields(fields),
                        Some(Carry {
                            retry_count,
                            base_version: commit.remote_version,
                        }),
                        now,
                    )?)
                }
                None => None,
            };

            refresh_sync_state(tx, commit.record_id)?;
            Ok(requeued)
        })
    }

    /// Queue entries matching `filter`, in enqueue order.
    pub fn list_changes(&self, filter: &ChangeFilter) -> Result<Vec<PendingChange>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM pending_changes
                     WHERE (?1 IS NULL OR state = ?1)
                       AND (?2 IS NULL OR record_id = ?2)
                       AND (?3 IS NULL OR priority = ?3)
                     ORDER BY seq ASC LIMIT ?4",
                    CHANGE_COLUMNS
                ))
                .map_err(DatabaseError::Sqlite)?;
            let rows = stmt
                .query_map(
                    params![
                        filter.state.map(|s| s.as_str()),
                        filter.record_id,
                        filter.priority.map(|p| p.rank()),
                        limit
                    ],
                    change_from_row,
                )
                .map_err(DatabaseError::Sqlite)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(DatabaseError::Sqlite)?;
            Ok(rows)
        })
    }

    /// Move failed changes (all, or one record's) back to the queue with a
    /// fresh retry budget.
    pub fn requeue_failed(&self, record_id: Option<&str>) -> Result<usize> {
        let now = now_millis();
        let count = self.write(|tx| {
            Ok(tx
                .execute(
                    "UPDATE pending_changes
                     SET state = 'queued', retry_count = 0, next_retry_at = ?2,
                         failure_reason = NULL, updated_at = ?2
                     WHERE state = 'failed' AND (?1 IS NULL OR record_id = ?1)",
                    params![record_id, now],
                )
                .map_err(DatabaseError::Sqlite)?)
        })?;
        if count > 0 {
            info!("Re-queued {} failed change(s)", count);
        }
        Ok(count)
    }

    /// Return changes left in flight (by a crash) to the queue.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let now = now_millis();
        self.write(|tx| {
            Ok(tx
                .execute(
                    "UPDATE pending_changes SET state = 'queued', updated_at = ?1
                     WHERE state = 'in_flight'",
                    [now],
                )
                .map_err(DatabaseError::Sqlite)?)
        })
    }

    /// Earliest time a head-of-record queued change becomes due.
    pub fn next_ready_at(&self) -> Result<Option<i64>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT MIN(p.next_retry_at) FROM pending_changes p
                     WHERE p.state = 'queued'
                       AND NOT EXISTS (
                           SELECT 1 FROM pending_changes q
                           WHERE q.record_id = p.record_id AND q.seq < p.seq)",
                    [],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?)
        })
    }

    pub fn queue_stats(&self, now_ms: i64) -> Result<QueueStats> {
        self.read(|conn| {
            let mut stats = QueueStats::default();
            let mut stmt = conn
                .prepare(
                    "SELECT state, COUNT(*), SUM(CASE WHEN next_retry_at <= ?1 THEN 1 ELSE 0 END)
                     FROM pending_changes GROUP BY state",
                )
                .map_err(DatabaseError::Sqlite)?;
            let rows = stmt
                .query_map([now_ms], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(DatabaseError::Sqlite)?;

            for row in rows {
                let (state, count, due) = row.map_err(DatabaseError::Sqlite)?;
                let count = count as usize;
                match ChangeState::parse(&state) {
                    ChangeState::Queued => {
                        stats.queued = count;
                        stats.ready = due as usize;
                    }
                    ChangeState::InFlight => stats.in_flight = count,
                    ChangeState::Conflicted => stats.conflicted = count,
                    ChangeState::Failed => stats.failed = count,
                }
            }

            let conflicts: i64 = conn
                .query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))
                .map_err(DatabaseError::Sqlite)?;
            stats.unresolved_conflicts = conflicts as usize;
            Ok(stats)
        })
    }
}
