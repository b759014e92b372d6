//! Plaintext record documents and local writes through the queue.

use super::{decode_envelope, queue, LocalStore};
use crate::sync::{ChangeOp, NewChange, PendingChange, Priority};
use crate::{now_millis, DatabaseError, Result, SyncCoreError};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Decrypted content of a record.
///
/// Every field carries the Unix-millisecond time it was last modified, which
/// drives field-level conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDocument {
    pub id: String,
    pub entity_type: String,
    /// Local edit counter.
    pub version: u64,
    pub deleted: bool,
    pub fields: BTreeMap<String, Value>,
    pub modified: BTreeMap<String, i64>,
}

impl RecordDocument {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            version: 0,
            deleted: false,
            fields: BTreeMap::new(),
            modified: BTreeMap::new(),
        }
    }

    /// Set a field, stamping its modification time.
    pub fn set(&mut self, field: impl Into<String>, value: Value, at: i64) {
        let field = field.into();
        self.modified.insert(field.clone(), at);
        self.fields.insert(field, value);
    }

    /// Remove a field, stamping the removal time.
    pub fn unset(&mut self, field: &str, at: i64) {
        self.fields.remove(field);
        self.modified.insert(field.to_string(), at);
    }

    pub fn modified_at(&self, field: &str) -> Option<i64> {
        self.modified.get(field).copied()
    }

    /// Most recent field modification.
    pub fn last_modified(&self) -> i64 {
        self.modified.values().copied().max().unwrap_or(0)
    }

    /// Names of fields whose values differ between the two documents.
    pub fn differing_fields(&self, other: &RecordDocument) -> Vec<String> {
        let mut names: Vec<String> = self
            .fields
            .keys()
            .chain(other.fields.keys())
            .filter(|name| self.fields.get(*name) != other.fields.get(*name))
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self).map_err(DatabaseError::from)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes).map_err(DatabaseError::from)?)
    }
}

impl LocalStore {
    fn load_document(&self, conn: &Connection, record_id: &str) -> Result<Option<RecordDocument>> {
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT envelope FROM records WHERE record_id = ?1",
                [record_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        let Some(blob) = blob else {
            return Ok(None);
        };
        let plaintext = zeroize::Zeroizing::new(self.encryption().decrypt(&decode_envelope(&blob)?)?);
        Ok(Some(RecordDocument::from_bytes(&plaintext)?))
    }

    /// Encrypt `doc` and store it together with its queue entry.
    fn store_edit(&self, conn: &Connection, doc: &RecordDocument, change: NewChange) -> Result<PendingChange> {
        let envelope = self.encryption().encrypt_default(&doc.to_bytes()?)?;
        let now = now_millis();
        self.upsert_record(
            conn,
            &doc.id,
            &doc.entity_type,
            &envelope,
            Some(doc.version),
            Some(doc.deleted),
            now,
        )?;
        queue::insert_change(conn, &doc.id, &doc.entity_type, change, None, now)
    }

    /// Decrypt and return a record's document; tombstones are returned too.
    pub fn read_document(&self, record_id: &str) -> Result<Option<RecordDocument>> {
        self.read(|conn| self.load_document(conn, record_id))
    }

    /// Apply field updates to a record, creating it if needed, and enqueue the
    /// change in the same transaction.
    ///
    /// Returns `None` when none of the given values differ from the stored ones.
    pub fn write_document(
        &self,
        entity_type: &str,
        record_id: &str,
        updates: BTreeMap<String, Value>,
        priority: Priority,
    ) -> Result<Option<PendingChange>> {
        if record_id.trim().is_empty() {
            return Err(SyncCoreError::InvalidInput(
                "record id must not be empty".to_string(),
            ));
        }

        self.write(|tx| {
            let existing = self.load_document(tx, record_id)?;
            if let Some(doc) = &existing {
                if doc.entity_type != entity_type {
                    return Err(SyncCoreError::InvalidInput(format!(
                        "record '{}' is a '{}', not a '{}'",
                        record_id, doc.entity_type, entity_type
                    )));
                }
            }

            let (mut doc, op) = match existing {
                Some(doc) if !doc.deleted => (doc, ChangeOp::Update),
                Some(mut doc) => {
                    // writing to a tombstone revives it
                    doc.deleted = false;
                    (doc, ChangeOp::Create)
                }
                None => (RecordDocument::new(record_id, entity_type), ChangeOp::Create),
            };

            let now = now_millis();
            let changed: Vec<String> = updates
                .into_iter()
                .filter_map(|(field, value)| {
                    if doc.fields.get(&field) == Some(&value) {
                        None
                    } else {
                        doc.set(field.clone(), value, now);
                        Some(field)
                    }
                })
                .collect();

            if changed.is_empty() && op == ChangeOp::Update {
                debug!("No field changes for record '{}'", record_id);
                return Ok(None);
            }

            doc.version += 1;
            let change = self.store_edit(tx, &doc, NewChange::new(op, priority).with_fields(changed))?;
            Ok(Some(change))
        })
    }

    /// Tombstone a record and enqueue its deletion.
    pub fn delete_document(&self, record_id: &str, priority: Priority) -> Result<PendingChange> {
        self.write(|tx| {
            let mut doc = self
                .load_document(tx, record_id)?
                .filter(|doc| !doc.deleted)
                .ok_or_else(|| SyncCoreError::NotFound(format!("record '{}'", record_id)))?;

            let now = now_millis();
            let removed: Vec<String> = doc.fields.keys().cloned().collect();
            for field in &removed {
                doc.unset(field, now);
            }
            doc.deleted = true;
            doc.version += 1;

            self.store_edit(
                tx,
                &doc,
                NewChange::new(ChangeOp::Delete, priority).with_fields(removed),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differing_fields_covers_both_sides() {
        let mut a = RecordDocument::new("r", "journal");
        let mut b = RecordDocument::new("r", "journal");
        a.set("notes", Value::from("x"), 1);
        a.set("mood", Value::from(3), 1);
        b.set("mood", Value::from(3), 2);
        b.set("sleep", Value::from(8), 2);

        assert_eq!(
            a.differing_fields(&b),
            vec!["notes".to_string(), "sleep".to_string()]
        );
        assert_eq!(b.last_modified(), 2);
    }

    #[test]
    fn unset_stamps_removal() {
        let mut doc = RecordDocument::new("r", "journal");
        doc.set("notes", Value::from("x"), 1);
        doc.unset("notes", 5);
        assert!(!doc.fields.contains_key("notes"));
        assert_eq!(doc.modified_at("notes"), Some(5));
    }
}
