//! Durable storage for persisted key payloads.

use super::KeyPayload;
use crate::{DatabaseError, Result, SyncCoreError};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Backing store for payloads that the persistence policy admits.
pub trait KeyPayloadStore: Send + Sync {
    fn load(&self, key_id: &str) -> Result<Option<KeyPayload>>;

    fn save(&self, key_id: &str, payload: &KeyPayload) -> Result<()>;

    /// Returns whether a payload was removed.
    fn delete(&self, key_id: &str) -> Result<bool>;

    fn list_ids(&self) -> Result<Vec<String>>;

    /// Atomically store `archived` under `archived_id` (if given) and
    /// replace the payload under `key_id` with `replacement`.
    fn replace(
        &self,
        key_id: &str,
        replacement: &KeyPayload,
        archived: Option<(&str, &KeyPayload)>,
    ) -> Result<()>;
}

/// SQLite-backed payload table
pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS key_payloads (
                key_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                shape TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            SyncCoreError::from(DatabaseError::LockPoisoned(
                "Failed to lock key store".to_string(),
            ))
        })
    }
}

fn upsert(conn: &Connection, key_id: &str, payload: &KeyPayload) -> Result<()> {
    conn.execute(
        "INSERT INTO key_payloads (key_id, payload, shape, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key_id) DO UPDATE SET
            payload = excluded.payload,
            shape = excluded.shape,
            created_at = excluded.created_at",
        params![
            key_id,
            payload.to_json()?,
            payload.shape(),
            payload.created_at().timestamp_millis()
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

impl KeyPayloadStore for SqliteKeyStore {
    fn load(&self, key_id: &str) -> Result<Option<KeyPayload>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT payload FROM key_payloads WHERE key_id = ?1",
                [key_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        json.map(|json| KeyPayload::from_json(&json)).transpose()
    }

    fn save(&self, key_id: &str, payload: &KeyPayload) -> Result<()> {
        let conn = self.lock()?;
        upsert(&conn, key_id, payload)
    }

    fn delete(&self, key_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM key_payloads WHERE key_id = ?1", [key_id])
            .map_err(DatabaseError::Sqlite)?;
        Ok(removed > 0)
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key_id FROM key_payloads ORDER BY key_id")
            .map_err(DatabaseError::Sqlite)?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(ids)
    }

    fn replace(
        &self,
        key_id: &str,
        replacement: &KeyPayload,
        archived: Option<(&str, &KeyPayload)>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;
        if let Some((archived_id, archived_payload)) = archived {
            upsert(&tx, archived_id, archived_payload)?;
        }
        upsert(&tx, key_id, replacement)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}

/// Payload store that forgets everything on drop; for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryKeyStore {
    payloads: Mutex<BTreeMap<String, KeyPayload>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, KeyPayload>>> {
        self.payloads.lock().map_err(|_| {
            SyncCoreError::from(DatabaseError::LockPoisoned(
                "Failed to lock key store".to_string(),
            ))
        })
    }
}

impl KeyPayloadStore for MemoryKeyStore {
    fn load(&self, key_id: &str) -> Result<Option<KeyPayload>> {
        Ok(self.lock()?.get(key_id).cloned())
    }

    fn save(&self, key_id: &str, payload: &KeyPayload) -> Result<()> {
        self.lock()?.insert(key_id.to_string(), payload.clone());
        Ok(())
    }

    fn delete(&self, key_id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(key_id).is_some())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn replace(
        &self,
        key_id: &str,
        replacement: &KeyPayload,
        archived: Option<(&str, &KeyPayload)>,
    ) -> Result<()> {
        let mut payloads = self.lock()?;
        if let Some((archived_id, archived_payload)) = archived {
            payloads.insert(archived_id.to_string(), archived_payload.clone());
        }
        payloads.insert(key_id.to_string(), replacement.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyMaterial;
    use chrono::Utc;

    fn payload(byte: u8) -> KeyPayload {
        KeyPayload::seal(&KeyMaterial::new([byte; 32], [byte; 32]), None, Utc::now()).unwrap()
    }

    #[test]
    fn sqlite_store_crud() {
        let store = SqliteKeyStore::in_memory().unwrap();
        assert!(store.load("primary").unwrap().is_none());

        let saved = payload(1);
        store.save("primary", &saved).unwrap();
        assert_eq!(store.load("primary").unwrap(), Some(saved));
        assert_eq!(store.list_ids().unwrap(), vec!["primary".to_string()]);

        assert!(store.delete("primary").unwrap());
        assert!(!store.delete("primary").unwrap());
    }

    #[test]
    fn sqlite_replace_keeps_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let old = payload(1);
        let new = payload(2);

        {
            let store = SqliteKeyStore::open(&path).unwrap();
            store.save("primary", &old).unwrap();
            store
                .replace("primary", &new, Some(("primary-archived-x", &old)))
                .unwrap();
        }

        let store = SqliteKeyStore::open(&path).unwrap();
        assert_eq!(store.load("primary").unwrap(), Some(new));
        assert_eq!(store.load("primary-archived-x").unwrap(), Some(old));
    }

    #[test]
    fn corrupt_payload_surfaces_as_invalid() {
        let store = SqliteKeyStore::in_memory().unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO key_payloads (key_id, payload, shape, created_at)
                 VALUES ('primary', '{\"shape\":\"raw\"}', 'raw', 0)",
                [],
            )
            .unwrap();

        assert!(matches!(
            store.load("primary"),
            Err(SyncCoreError::InvalidKeyPayload(_))
        ));
    }

    #[test]
    fn memory_store_replace() {
        let store = MemoryKeyStore::new();
        store.replace("primary", &payload(3), None).unwrap();
        assert_eq!(store.list_ids().unwrap(), vec!["primary".to_string()]);
    }
}
