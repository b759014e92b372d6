//! Database schema and connection management.

use crate::{DatabaseError, Result, SyncCoreError};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;
        Self::configure(conn)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        // Enable foreign key constraints
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;
        // WAL keeps readers off the writer's back; in-memory databases ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(DatabaseError::Sqlite)?;
        conn.execute("PRAGMA synchronous = FULL", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Create tables on a fresh database and validate the version of an existing one
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_store_metadata_table()?;
        self.create_records_table()?;
        self.create_pending_changes_table()?;
        self.create_conflicts_table()?;
        self.create_cache_metadata_table()?;
        self.create_indexes()?;
        self.validate_schema_version()
    }

    fn create_store_metadata_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS store_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_records_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS records (
                record_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                envelope BLOB NOT NULL,
                key_id TEXT NOT NULL,
                key_fingerprint TEXT NOT NULL,
                format_version INTEGER NOT NULL,
                local_version INTEGER NOT NULL DEFAULT 0,
                synced_version INTEGER NOT NULL DEFAULT 0,
                sync_state TEXT NOT NULL DEFAULT 'synced',
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_pending_changes_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS pending_changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                change_id TEXT NOT NULL UNIQUE,
                record_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                op TEXT NOT NULL,
                priority INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER NOT NULL,
                logical_ts INTEGER NOT NULL,
                base_version INTEGER NOT NULL,
                changed_fields TEXT NOT NULL,
                failure_reason TEXT,
                enqueued_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (record_id) REFERENCES records(record_id) ON DELETE CASCADE
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_conflicts_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS conflicts (
                conflict_id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                envelope BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (record_id) REFERENCES records(record_id) ON DELETE CASCADE
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_cache_metadata_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS cache_metadata (
                key_id TEXT PRIMARY KEY,
                persisted INTEGER NOT NULL,
                record_count INTEGER NOT NULL DEFAULT 0,
                first_used_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_pending_state_ready ON pending_changes(state, next_retry_at)",
            "CREATE INDEX IF NOT EXISTS idx_pending_record_seq ON pending_changes(record_id, seq)",
            "CREATE INDEX IF NOT EXISTS idx_records_key_id ON records(key_id)",
            "CREATE INDEX IF NOT EXISTS idx_records_sync_state ON records(sync_state)",
            "CREATE INDEX IF NOT EXISTS idx_conflicts_record ON conflicts(record_id)",
        ];
        for sql in &indexes {
            self.conn.execute(sql, []).map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    /// Stamp a fresh database with the current version, or reject one written
    /// by an incompatible build.
    pub fn validate_schema_version(&self) -> Result<()> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        let Some(stored) = stored else {
            self.conn
                .execute(
                    "INSERT INTO store_metadata (key, value) VALUES ('schema_version', ?1)",
                    [CURRENT_SCHEMA_VERSION.to_string()],
                )
                .map_err(DatabaseError::Sqlite)?;
            return Ok(());
        };

        let found: i32 = stored.parse().map_err(|_| {
            DatabaseError::Other(format!("Unreadable schema version '{}'", stored))
        })?;

        if found == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        Err(SyncCoreError::from(DatabaseError::SchemaMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found,
        }))
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(db: &Database, kind: &str) -> Vec<String> {
        db.conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();

        let tables = names(&db, "table");
        for table in [
            "store_metadata",
            "records",
            "pending_changes",
            "conflicts",
            "cache_metadata",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }

        let indexes = names(&db, "index");
        assert!(indexes.contains(&"idx_pending_state_ready".to_string()));
        assert!(indexes.contains(&"idx_pending_record_seq".to_string()));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.initialize_schema().unwrap();
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.conn
            .execute(
                "UPDATE store_metadata SET value = '99' WHERE key = 'schema_version'",
                [],
            )
            .unwrap();

        assert!(matches!(
            db.validate_schema_version(),
            Err(SyncCoreError::Database(DatabaseError::SchemaMismatch {
                expected: 1,
                found: 99
            }))
        ));
    }
}
