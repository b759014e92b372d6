//! Sealed export bundles.
//!
//! A bundle is a consistent plaintext snapshot of selected records,
//! encrypted under a `backup-*` key and signed with that key's integrity
//! component. Formatting the snapshot into a document is left to the caller.

use crate::audit::AuditEventType;
use crate::crypto::EncryptedRecord;
use crate::encryption::{EncryptionService, IntegrityTag};
use crate::keys::policy;
use crate::store::{encode_envelope, ExportSnapshot, LocalStore};
use crate::{DatabaseError, DecryptionFailure, Result, SyncCoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const BUNDLE_FORMAT_VERSION: u16 = 1;

/// Encrypted, signed export of an [`ExportSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub format_version: u16,
    pub taken_at: i64,
    pub record_count: usize,
    pub sealed: EncryptedRecord,
    pub signature: IntegrityTag,
}

impl ExportBundle {
    fn signed_bytes(format_version: u16, taken_at: i64, record_count: usize, sealed: &EncryptedRecord) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.extend_from_slice(&format_version.to_be_bytes());
        data.extend_from_slice(&taken_at.to_be_bytes());
        data.extend_from_slice(&(record_count as u64).to_be_bytes());
        data.extend_from_slice(&encode_envelope(sealed)?);
        Ok(data)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncCoreError::from(DatabaseError::from(e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SyncCoreError::from(DatabaseError::from(e)))
    }
}

/// Snapshot the selected records (all when `ids` is `None`) and seal them
/// under `key_id`, which must be a `backup-*` key.
pub fn seal_snapshot(
    store: &LocalStore,
    key_id: &str,
    ids: Option<&[String]>,
) -> Result<ExportBundle> {
    if !policy::is_backup(key_id) {
        return Err(SyncCoreError::InvalidInput(format!(
            "export key '{}' must start with '{}'",
            key_id,
            policy::BACKUP_PREFIX
        )));
    }

    let encryption = store.encryption();
    let snapshot = store.snapshot(ids)?;
    let plaintext = zeroize::Zeroizing::new(
        serde_json::to_vec(&snapshot).map_err(DatabaseError::from)?,
    );
    let sealed = encryption.encrypt(&plaintext, key_id)?;

    let record_count = snapshot.documents.len();
    let signed = ExportBundle::signed_bytes(
        BUNDLE_FORMAT_VERSION,
        snapshot.taken_at,
        record_count,
        &sealed,
    )?;
    let signature = encryption.sign(&signed, key_id)?;

    encryption.keys().audit_event(
        AuditEventType::SnapshotExported {
            key_id: key_id.to_string(),
            records: record_count,
        },
        "export bundle sealed",
    );
    info!("Sealed {} record(s) under '{}'", record_count, key_id);

    Ok(ExportBundle {
        format_version: BUNDLE_FORMAT_VERSION,
        taken_at: snapshot.taken_at,
        record_count,
        sealed,
        signature,
    })
}

/// Verify and decrypt a bundle produced by [`seal_snapshot`].
///
/// A bad signature or a record count that does not match the content is
/// reported as tampering.
pub fn open_bundle(encryption: &EncryptionService, bundle: &ExportBundle) -> Result<ExportSnapshot> {
    if bundle.format_version != BUNDLE_FORMAT_VERSION {
        return Err(SyncCoreError::InvalidInput(format!(
            "unsupported bundle format {}",
            bundle.format_version
        )));
    }

    let signed = ExportBundle::signed_bytes(
        bundle.format_version,
        bundle.taken_at,
        bundle.record_count,
        &bundle.sealed,
    )?;
    if !encryption.verify(&signed, &bundle.signature)? {
        warn!("Export bundle signature did not verify");
        return Err(SyncCoreError::Decryption(DecryptionFailure::AuthFailure));
    }

    let plaintext = zeroize::Zeroizing::new(encryption.decrypt(&bundle.sealed)?);
    let snapshot: ExportSnapshot =
        serde_json::from_slice(&plaintext).map_err(DatabaseError::from)?;
    if snapshot.documents.len() != bundle.record_count || snapshot.taken_at != bundle.taken_at {
        return Err(SyncCoreError::Decryption(DecryptionFailure::AuthFailure));
    }
    Ok(snapshot)
}
