//! Durable local store.
//!
//! [`LocalStore`] is the single writer for encrypted records, the pending
//! change queue, parked conflicts and key usage metadata. A record write and
//! the queue entry describing it always commit in one SQLite transaction.

pub mod documents;
mod queue;
pub mod schema;

#[cfg(test)]
mod tests;

pub use documents::RecordDocument;
pub use queue::{ChangeFilter, ResolutionCommit};
pub use schema::Database;

use crate::config::StorageConfig;
use crate::crypto::EncryptedRecord;
use crate::encryption::EncryptionService;
use crate::sync::{ChangeState, NewChange, PendingChange, RemoteVersion};
use crate::{now_millis, DatabaseError, Result, SyncCoreError};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sync state of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    Pending,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "conflict" => Self::Conflict,
            _ => Self::Pending,
        }
    }
}

/// Metadata of a stored record, without decrypting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInfo {
    pub record_id: String,
    pub entity_type: String,
    pub key_id: String,
    pub key_fingerprint: String,
    pub local_version: u64,
    pub synced_version: u64,
    pub sync_state: SyncState,
    pub deleted: bool,
    pub updated_at: i64,
}

/// Per-key usage row from `cache_metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUsage {
    pub key_id: String,
    pub persisted: bool,
    pub record_count: u64,
    pub first_used_at: i64,
    pub last_used_at: i64,
}

/// Plaintext view of selected records taken at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub taken_at: i64,
    pub documents: Vec<RecordDocument>,
}

/// Durable, transactional record and queue storage.
pub struct LocalStore {
    db: Mutex<Database>,
    encryption: Arc<EncryptionService>,
    quota_bytes: Option<u64>,
}

fn is_disk_full(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::DiskFull)
}

fn stored_bytes(conn: &Connection, excluding: Option<&str>) -> Result<u64> {
    let used: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(length(envelope)), 0) FROM records WHERE record_id IS NOT ?1",
            params![excluding],
            |row| row.get(0),
        )
        .map_err(DatabaseError::Sqlite)?;
    Ok(used.max(0) as u64)
}

pub(crate) fn encode_envelope(record: &EncryptedRecord) -> Result<Vec<u8>> {
    Ok(bincode::serialize(record).map_err(DatabaseError::from)?)
}

pub(crate) fn decode_envelope(bytes: &[u8]) -> Result<EncryptedRecord> {
    Ok(bincode::deserialize(bytes).map_err(DatabaseError::from)?)
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    ///
    /// Changes left in flight by a previous process are put back in the queue;
    /// the exchange is idempotent, so resending them is safe.
    pub fn open<P: AsRef<Path>>(
        path: P,
        encryption: Arc<EncryptionService>,
        quota_bytes: Option<u64>,
    ) -> Result<Self> {
        let db = Database::open(path)?;
        Self::with_database(db, encryption, quota_bytes)
    }

    pub fn in_memory(encryption: Arc<EncryptionService>) -> Result<Self> {
        Self::with_database(Database::in_memory()?, encryption, None)
    }

    pub fn from_config(config: &StorageConfig, encryption: Arc<EncryptionService>) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(&config.path, encryption, config.quota_bytes)
    }

    fn with_database(
        db: Database,
        encryption: Arc<EncryptionService>,
        quota_bytes: Option<u64>,
    ) -> Result<Self> {
        db.initialize_schema()?;
        let store = Self {
            db: Mutex::new(db),
            encryption,
            quota_bytes,
        };

        let recovered = store.recover_in_flight()?;
        if recovered > 0 {
            info!("Re-queued {} change(s) interrupted mid-flight", recovered);
        }
        Ok(store)
    }

    pub fn encryption(&self) -> &Arc<EncryptionService> {
        &self.encryption
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| {
            SyncCoreError::from(DatabaseError::LockPoisoned(
                "Failed to lock local store".to_string(),
            ))
        })
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.lock()?;
        f(db.conn())
    }

    /// Run `f` in one transaction. A full disk surfaces as `QuotaExceeded`.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut db = self.lock()?;
        let result = (|| {
            let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;
            let value = f(&tx)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            Ok(value)
        })();

        match result {
            Err(SyncCoreError::Database(DatabaseError::Sqlite(e))) if is_disk_full(&e) => {
                let used = stored_bytes(db.conn(), None).unwrap_or(0);
                warn!("Device storage full while writing to local store");
                Err(SyncCoreError::QuotaExceeded {
                    used,
                    limit: self.quota_bytes.unwrap_or(used),
                })
            }
            other => other,
        }
    }

    fn check_quota(&self, conn: &Connection, record_id: &str, incoming: usize) -> Result<()> {
        let Some(limit) = self.quota_bytes else {
            return Ok(());
        };
        let used = stored_bytes(conn, Some(record_id))?;
        if used + incoming as u64 > limit {
            return Err(SyncCoreError::QuotaExceeded { used, limit });
        }
        Ok(())
    }

    fn refresh_key_usage(&self, conn: &Connection, key_id: &str, now: i64) -> Result<()> {
        let persisted = self.encryption.keys().policy().is_persisted(key_id);
        conn.execute(
            "INSERT INTO cache_metadata (key_id, persisted, record_count, first_used_at, last_used_at)
             VALUES (?1, ?2, (SELECT COUNT(*) FROM records WHERE key_id = ?1), ?3, ?3)
             ON CONFLICT(key_id) DO UPDATE SET
                persisted = excluded.persisted,
                record_count = excluded.record_count,
                last_used_at = excluded.last_used_at",
            params![key_id, persisted, now],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Insert or replace a record row. Versions and sync state of an existing
    /// row are left to the caller's follow-up updates.
    #[allow(clippy::too_many_arguments)]
    fn upsert_record(
        &self,
        conn: &Connection,
        record_id: &str,
        entity_type: &str,
        envelope: &EncryptedRecord,
        local_version: Option<u64>,
        deleted: Option<bool>,
        now: i64,
    ) -> Result<()> {
        let blob = encode_envelope(envelope)?;
        self.check_quota(conn, record_id, blob.len())?;

        let previous_key: Option<String> = conn
            .query_row(
                "SELECT key_id FROM records WHERE record_id = ?1",
                [record_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        conn.execute(
            "INSERT INTO records (record_id, entity_type, envelope, key_id, key_fingerprint,
                                  format_version, local_version, is_deleted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 0), COALESCE(?8, 0), ?9)
             ON CONFLICT(record_id) DO UPDATE SET
                entity_type = excluded.entity_type,
                envelope = excluded.envelope,
                key_id = excluded.key_id,
                key_fingerprint = excluded.key_fingerprint,
                format_version = excluded.format_version,
                local_version = COALESCE(?7, records.local_version),
                is_deleted = COALESCE(?8, records.is_deleted),
                updated_at = excluded.updated_at",
            params![
                record_id,
                entity_type,
                blob,
                envelope.key_id,
                envelope.key_fingerprint,
                envelope.format_version as i64,
                local_version.map(|v| v as i64),
                deleted,
                now
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        self.refresh_key_usage(conn, &envelope.key_id, now)?;
        if let Some(previous) = previous_key.filter(|k| k != &envelope.key_id) {
            self.refresh_key_usage(conn, &previous, now)?;
        }
        Ok(())
    }

    /// Store an encrypted record without queueing a change.
    ///
    /// Use [`LocalStore::put_with_change`] for local edits that must sync.
    pub fn put(&self, record_id: &str, entity_type: &str, record: &EncryptedRecord) -> Result<()> {
        let now = now_millis();
        self.write(|tx| self.upsert_record(tx, record_id, entity_type, record, None, None, now))
    }

    /// Encrypted record stored under `record_id`.
    pub fn get(&self, record_id: &str) -> Result<Option<EncryptedRecord>> {
        let blob: Option<Vec<u8>> = self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT envelope FROM records WHERE record_id = ?1",
                    [record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?)
        })?;

        blob.map(|blob| decode_envelope(&blob)).transpose()
    }

    /// Purge a record together with its queued changes and parked conflicts.
    pub fn delete(&self, record_id: &str) -> Result<bool> {
        let now = now_millis();
        self.write(|tx| {
            let key_id: Option<String> = tx
                .query_row(
                    "SELECT key_id FROM records WHERE record_id = ?1",
                    [record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?;

            let Some(key_id) = key_id else {
                return Ok(false);
            };

            tx.execute("DELETE FROM records WHERE record_id = ?1", [record_id])
                .map_err(DatabaseError::Sqlite)?;
            self.refresh_key_usage(tx, &key_id, now)?;
            Ok(true)
        })
    }

    pub fn record_info(&self, record_id: &str) -> Result<Option<RecordInfo>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT record_id, entity_type, key_id, key_fingerprint, local_version,
                            synced_version, sync_state, is_deleted, updated_at
                     FROM records WHERE record_id = ?1",
                    [record_id],
                    |row| {
                        Ok(RecordInfo {
                            record_id: row.get(0)?,
                            entity_type: row.get(1)?,
                            key_id: row.get(2)?,
                            key_fingerprint: row.get(3)?,
                            local_version: row.get::<_, i64>(4)? as u64,
                            synced_version: row.get::<_, i64>(5)? as u64,
                            sync_state: SyncState::parse(&row.get::<_, String>(6)?),
                            deleted: row.get(7)?,
                            updated_at: row.get(8)?,
                        })
                    },
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?)
        })
    }

    /// Ids of all records (tombstones included), sorted.
    pub fn record_ids(&self) -> Result<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT record_id FROM records ORDER BY record_id")
                .map_err(DatabaseError::Sqlite)?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .map_err(DatabaseError::Sqlite)?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(DatabaseError::Sqlite)?;
            Ok(ids)
        })
    }

    /// Write a record and the queue entry describing it in one transaction.
    pub fn put_with_change(
        &self,
        record_id: &str,
        entity_type: &str,
        record: &EncryptedRecord,
        local_version: u64,
        deleted: bool,
        change: NewChange,
    ) -> Result<PendingChange> {
        let now = now_millis();
        self.write(|tx| {
            self.upsert_record(
                tx,
                record_id,
                entity_type,
                record,
                Some(local_version),
                Some(deleted),
                now,
            )?;
            queue::insert_change(tx, record_id, entity_type, change, None, now)
        })
    }

    /// Queue a change for an existing record.
    pub fn enqueue_change(&self, record_id: &str, change: NewChange) -> Result<PendingChange> {
        let now = now_millis();
        self.write(|tx| {
            let entity_type: Option<String> = tx
                .query_row(
                    "SELECT entity_type FROM records WHERE record_id = ?1",
                    [record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?;
            let entity_type = entity_type
                .ok_or_else(|| SyncCoreError::NotFound(format!("record '{}'", record_id)))?;

            queue::insert_change(tx, record_id, &entity_type, change, None, now)
        })
    }

    /// Store a remote document as synced content.
    ///
    /// Skipped (returns `false`) while the record has unsynced local changes,
    /// which will surface the divergence as a conflict when drained, or when
    /// the stored copy is already at or past `remote.version`.
    pub fn apply_remote(&self, remote: &RemoteVersion) -> Result<bool> {
        let doc = &remote.document;
        let envelope = if doc.deleted {
            None
        } else {
            Some(self.encryption.encrypt_default(&doc.to_bytes()?)?)
        };
        let now = now_millis();

        self.write(|tx| {
            let pending: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM pending_changes WHERE record_id = ?1",
                    [&doc.id],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?;
            if pending > 0 {
                debug!("Record '{}' has local changes; remote copy deferred", doc.id);
                return Ok(false);
            }

            let synced: Option<i64> = tx
                .query_row(
                    "SELECT synced_version FROM records WHERE record_id = ?1",
                    [&doc.id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?;
            if synced.is_some_and(|v| v as u64 >= remote.version) {
                return Ok(false);
            }

            match &envelope {
                None => {
                    let key_id: Option<String> = tx
                        .query_row(
                            "SELECT key_id FROM records WHERE record_id = ?1",
                            [&doc.id],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(DatabaseError::Sqlite)?;
                    tx.execute("DELETE FROM records WHERE record_id = ?1", [&doc.id])
                        .map_err(DatabaseError::Sqlite)?;
                    if let Some(key_id) = key_id {
                        self.refresh_key_usage(tx, &key_id, now)?;
                    }
                }
                Some(envelope) => {
                    self.upsert_record(
                        tx,
                        &doc.id,
                        &doc.entity_type,
                        envelope,
                        Some(doc.version),
                        Some(false),
                        now,
                    )?;
                    tx.execute(
                        "UPDATE records SET synced_version = ?2, sync_state = 'synced'
                         WHERE record_id = ?1",
                        params![doc.id, remote.version as i64],
                    )
                    .map_err(DatabaseError::Sqlite)?;
                }
            }
            Ok(true)
        })
    }

    /// Decrypted snapshot of the selected records (all when `ids` is `None`),
    /// read inside one transaction so no write interleaves. Tombstones are
    /// left out.
    pub fn snapshot(&self, ids: Option<&[String]>) -> Result<ExportSnapshot> {
        let (taken_at, rows) = {
            let mut db = self.lock()?;
            let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;
            let taken_at = now_millis();
            let rows: Vec<(String, Vec<u8>)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT record_id, envelope FROM records
                         WHERE is_deleted = 0 ORDER BY record_id",
                    )
                    .map_err(DatabaseError::Sqlite)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(DatabaseError::Sqlite)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(DatabaseError::Sqlite)?;
                rows
            };
            tx.commit().map_err(DatabaseError::Sqlite)?;
            (taken_at, rows)
        };

        let mut documents = Vec::with_capacity(rows.len());
        for (record_id, blob) in rows {
            if ids.is_some_and(|ids| !ids.contains(&record_id)) {
                continue;
            }
            let plaintext = zeroize::Zeroizing::new(self.encryption.decrypt(&decode_envelope(&blob)?)?);
            documents.push(RecordDocument::from_bytes(&plaintext)?);
        }

        Ok(ExportSnapshot {
            taken_at,
            documents,
        })
    }

    /// Records under `key_id` that are not encrypted with its active key.
    pub fn stale_records(&self, key_id: &str) -> Result<Vec<String>> {
        let active = self
            .encryption
            .keys()
            .material(key_id)?
            .map(|m| m.fingerprint().to_string());

        self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT record_id FROM records
                     WHERE key_id = ?1 AND key_fingerprint IS NOT ?2
                     ORDER BY record_id",
                )
                .map_err(DatabaseError::Sqlite)?;
            let ids = stmt
                .query_map(params![key_id, active], |row| row.get(0))
                .map_err(DatabaseError::Sqlite)?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(DatabaseError::Sqlite)?;
            Ok(ids)
        })
    }

    /// Migrate stale records of `key_id` onto its active key. Returns how many
    /// records were rewritten.
    pub fn reencrypt_records(&self, key_id: &str) -> Result<usize> {
        let mut migrated = 0;
        for record_id in self.stale_records(key_id)? {
            let Some(envelope) = self.get(&record_id)? else {
                continue;
            };
            let Some(fresh) = self.encryption.reencrypt(&envelope)? else {
                continue;
            };
            let now = now_millis();
            self.write(|tx| {
                // only replace the envelope if nobody rewrote it meanwhile
                let current: Option<String> = tx
                    .query_row(
                        "SELECT key_fingerprint FROM records WHERE record_id = ?1",
                        [&record_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(DatabaseError::Sqlite)?;
                if current.as_deref() != Some(envelope.key_fingerprint.as_str()) {
                    return Ok(());
                }
                let entity_type: String = tx
                    .query_row(
                        "SELECT entity_type FROM records WHERE record_id = ?1",
                        [&record_id],
                        |row| row.get(0),
                    )
                    .map_err(DatabaseError::Sqlite)?;
                self.upsert_record(tx, &record_id, &entity_type, &fresh, None, None, now)
            })?;
            migrated += 1;
        }

        if migrated > 0 {
            info!("Re-encrypted {} record(s) under key '{}'", migrated, key_id);
            self.encryption.keys().audit_event(
                crate::audit::AuditEventType::RecordsReencrypted {
                    key_id: key_id.to_string(),
                    count: migrated,
                },
                "explicit re-encryption",
            );
        }
        Ok(migrated)
    }

    /// Usage rows from `cache_metadata`, sorted by key id.
    pub fn key_usage(&self) -> Result<Vec<KeyUsage>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key_id, persisted, record_count, first_used_at, last_used_at
                     FROM cache_metadata ORDER BY key_id",
                )
                .map_err(DatabaseError::Sqlite)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(KeyUsage {
                        key_id: row.get(0)?,
                        persisted: row.get(1)?,
                        record_count: row.get::<_, i64>(2)? as u64,
                        first_used_at: row.get(3)?,
                        last_used_at: row.get(4)?,
                    })
                })
                .map_err(DatabaseError::Sqlite)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(DatabaseError::Sqlite)?;
            Ok(rows)
        })
    }

    /// Bytes currently used by record envelopes.
    pub fn stored_bytes(&self) -> Result<u64> {
        self.read(|conn| stored_bytes(conn, None))
    }

    /// Number of queue entries in `state`.
    pub fn count_changes(&self, state: ChangeState) -> Result<usize> {
        self.read(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM pending_changes WHERE state = ?1",
                    [state.as_str()],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?;
            Ok(count as usize)
        })
    }

    pub(crate) fn change_exists(&self, change_id: Uuid) -> Result<bool> {
        self.read(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM pending_changes WHERE change_id = ?1",
                    [change_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?;
            Ok(found.is_some())
        })
    }
}
