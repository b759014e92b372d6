//! Which key identifiers are written to durable storage.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeSet;

const ARCHIVE_MARKER: &str = "-archived-";
/// Prefix of keys that protect export bundles; always persisted.
pub const BACKUP_PREFIX: &str = "backup-";

/// Whitelist persistence policy.
///
/// Identifiers in the whitelist, and any identifier starting with `backup-`,
/// are persisted. Everything else is ephemeral and lives only in the process.
/// Archived ids inherit eligibility from the id they were rotated out of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    persisted_ids: BTreeSet<String>,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::new(["primary".to_string()])
    }
}

impl KeyPolicy {
    pub fn new<I: IntoIterator<Item = String>>(persisted_ids: I) -> Self {
        Self {
            persisted_ids: persisted_ids.into_iter().collect(),
        }
    }

    pub fn is_persisted(&self, key_id: &str) -> bool {
        let base = base_id(key_id);
        is_backup(base) || self.persisted_ids.contains(base)
    }

    pub fn persisted_ids(&self) -> impl Iterator<Item = &str> {
        self.persisted_ids.iter().map(String::as_str)
    }
}

pub fn is_backup(key_id: &str) -> bool {
    key_id.starts_with(BACKUP_PREFIX) && key_id.len() > BACKUP_PREFIX.len()
}

/// Lifecycle id a key was archived from, or the id itself.
pub fn base_id(key_id: &str) -> &str {
    match key_id.find(ARCHIVE_MARKER) {
        Some(idx) => &key_id[..idx],
        None => key_id,
    }
}

/// True if `candidate` is an archived generation of `key_id`.
pub fn is_archive_of(candidate: &str, key_id: &str) -> bool {
    candidate
        .strip_prefix(key_id)
        .is_some_and(|rest| rest.starts_with(ARCHIVE_MARKER))
}

pub fn is_archived(key_id: &str) -> bool {
    key_id.contains(ARCHIVE_MARKER)
}

/// Identifier an active key is archived under when rotated at `at`.
pub fn archive_id(key_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        key_id,
        ARCHIVE_MARKER,
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

pub fn validate_key_id(key_id: &str) -> crate::Result<()> {
    if key_id.trim().is_empty() {
        return Err(crate::SyncCoreError::InvalidInput(
            "key id must not be empty".to_string(),
        ));
    }
    if is_archived(key_id) {
        return Err(crate::SyncCoreError::InvalidInput(format!(
            "'{}' is reserved for archived keys",
            key_id
        )));
    }
    Ok(())
}
