//! Authenticated record encryption on top of [`KeyManager`].

use crate::crypto::{cipher, CryptoError, EncryptedRecord, KeyMaterial};
use crate::keys::KeyManager;
use crate::{DecryptionFailure, Result, SyncCoreError};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_CONTEXT: &[u8] = b"hearthsync-integrity-v1";

/// HMAC-SHA256 over auxiliary data, made with a key's integrity component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityTag {
    pub key_id: String,
    pub key_fingerprint: String,
    #[serde(with = "crate::keys::payload::base64_bytes")]
    pub mac: Vec<u8>,
}

/// Encrypts and decrypts records. Never persists keys itself.
pub struct EncryptionService {
    keys: Arc<KeyManager>,
    default_key_id: String,
}

impl EncryptionService {
    /// Create the service and make sure the default key exists.
    ///
    /// A missing default key is generated here; the event is logged and
    /// audited so its timing can be traced.
    pub fn new(keys: Arc<KeyManager>, default_key_id: impl Into<String>) -> Result<Self> {
        let service = Self {
            keys,
            default_key_id: default_key_id.into(),
        };
        service.ensure_default_key()?;
        Ok(service)
    }

    fn ensure_default_key(&self) -> Result<()> {
        let (_, created) = self.keys.get_or_generate(&self.default_key_id)?;
        if created {
            self.keys
                .audit_auto_generation(&self.default_key_id, "encryption service initialization");
        }
        Ok(())
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn default_key_id(&self) -> &str {
        &self.default_key_id
    }

    /// Encrypt `plaintext` under the active key for `key_id`, generating the
    /// key if it does not exist yet.
    pub fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<EncryptedRecord> {
        let (material, created) = self
            .keys
            .get_or_generate(key_id)
            .map_err(|e| SyncCoreError::Encryption(format!("no key for '{}': {}", key_id, e)))?;
        if created {
            self.keys.audit_auto_generation(key_id, "encrypt");
        }

        cipher::seal(&material, key_id, plaintext)
            .map_err(|e| SyncCoreError::Encryption(e.to_string()))
    }

    pub fn encrypt_default(&self, plaintext: &[u8]) -> Result<EncryptedRecord> {
        self.encrypt(plaintext, &self.default_key_id)
    }

    fn key_for(&self, key_id: &str, fingerprint: &str) -> Result<Arc<KeyMaterial>> {
        match self.keys.find_by_fingerprint(key_id, fingerprint) {
            Ok(Some((_, material))) => Ok(material),
            Ok(None) => Err(SyncCoreError::Decryption(DecryptionFailure::KeyNotFound {
                key_id: key_id.to_string(),
            })),
            Err(SyncCoreError::KeyUnavailable { reason, .. }) => {
                warn!("Key '{}' is unavailable: {}", key_id, reason);
                Err(SyncCoreError::Decryption(DecryptionFailure::KeyNotFound {
                    key_id: key_id.to_string(),
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Decrypt and authenticate a record.
    ///
    /// Fails with [`DecryptionFailure::KeyNotFound`] when neither the active
    /// nor any archived key matches the record, and with
    /// [`DecryptionFailure::AuthFailure`] when the data does not authenticate.
    pub fn decrypt(&self, record: &EncryptedRecord) -> Result<Vec<u8>> {
        let material = self.key_for(&record.key_id, &record.key_fingerprint)?;

        cipher::open(&material, record).map_err(|e| {
            if !matches!(e, CryptoError::AuthenticationFailed) {
                warn!("Record under key '{}' rejected: {}", record.key_id, e);
            }
            SyncCoreError::Decryption(DecryptionFailure::AuthFailure)
        })
    }

    /// True if `record` is encrypted under the active key of its key id.
    pub fn is_current(&self, record: &EncryptedRecord) -> Result<bool> {
        Ok(self
            .keys
            .material(&record.key_id)?
            .is_some_and(|active| active.fingerprint() == record.key_fingerprint))
    }

    /// Re-encrypt a record under the active key of its key id.
    ///
    /// Returns `None` when the record already uses the active key.
    pub fn reencrypt(&self, record: &EncryptedRecord) -> Result<Option<EncryptedRecord>> {
        if self.is_current(record)? {
            return Ok(None);
        }
        let plaintext = zeroize::Zeroizing::new(self.decrypt(record)?);
        debug!("Re-encrypting record under active '{}' key", record.key_id);
        self.encrypt(&plaintext, &record.key_id).map(Some)
    }

    /// Sign auxiliary data with the integrity key of `key_id`.
    pub fn sign(&self, data: &[u8], key_id: &str) -> Result<IntegrityTag> {
        let (material, created) = self
            .keys
            .get_or_generate(key_id)
            .map_err(|e| SyncCoreError::Encryption(format!("no key for '{}': {}", key_id, e)))?;
        if created {
            self.keys.audit_auto_generation(key_id, "sign");
        }

        Ok(IntegrityTag {
            key_id: key_id.to_string(),
            key_fingerprint: material.fingerprint().to_string(),
            mac: compute_mac(&material, data)?,
        })
    }

    /// Check a tag produced by [`EncryptionService::sign`].
    ///
    /// `Ok(false)` means the data or tag was altered; a missing key is an error.
    pub fn verify(&self, data: &[u8], tag: &IntegrityTag) -> Result<bool> {
        let material = self.key_for(&tag.key_id, &tag.key_fingerprint)?;
        let expected = compute_mac(&material, data)?;
        Ok(expected.ct_eq(&tag.mac).into())
    }
}

fn compute_mac(material: &KeyMaterial, data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(material.integrity_key())
        .map_err(|e| SyncCoreError::Encryption(format!("HMAC init failed: {}", e)))?;
    mac.update(SIGNATURE_CONTEXT);
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditLogger};
    use crate::keys::{KeyPolicy, MemoryKeyStore};

    fn service() -> (EncryptionService, Arc<AuditLogger>) {
        let audit = Arc::new(AuditLogger::in_memory());
        let keys = Arc::new(
            KeyManager::new(Arc::new(MemoryKeyStore::new()), KeyPolicy::default())
                .with_audit(audit.clone()),
        );
        (EncryptionService::new(keys, "primary").unwrap(), audit)
    }

    #[test]
    fn initialization_generates_and_audits_default_key() {
        let (service, audit) = service();
        assert!(service.keys().retrieve_key("primary").unwrap().is_some());

        let auto: Vec<_> = audit
            .get_entries(10)
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.event_type, AuditEventType::DefaultKeyAutoGenerated { .. }))
            .collect();
        assert_eq!(auto.len(), 1);

        // a second service over the same keys does not generate again
        EncryptionService::new(service.keys().clone(), "primary").unwrap();
        assert_eq!(audit.get_entries_by_severity(3).unwrap().len(), 1);
    }

    #[test]
    fn roundtrip_various_plaintexts() {
        let (service, _) = service();
        let plaintexts: [&[u8]; 4] = [b"", b"pain=7", &[0u8; 4096], "naïve ☕".as_bytes()];
        for plaintext in plaintexts {
            let record = service.encrypt(plaintext, "primary").unwrap();
            assert_eq!(service.decrypt(&record).unwrap(), plaintext);
        }
    }

    #[test]
    fn tampering_is_an_auth_failure() {
        let (service, _) = service();
        let mut record = service.encrypt(b"mood=4", "primary").unwrap();
        record.ciphertext[0] ^= 0xff;

        assert!(matches!(
            service.decrypt(&record),
            Err(SyncCoreError::Decryption(DecryptionFailure::AuthFailure))
        ));
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let (service, _) = service();
        let record = service.encrypt(b"x", "scratch").unwrap();
        service.keys().delete_key("scratch").unwrap();

        match service.decrypt(&record) {
            Err(SyncCoreError::Decryption(DecryptionFailure::KeyNotFound { key_id })) => {
                assert_eq!(key_id, "scratch")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn rotation_keeps_old_records_readable_until_reencrypted() {
        let (service, _) = service();
        let record = service.encrypt(b"sleep=6h", "primary").unwrap();

        service.keys().rotate_key("primary").unwrap();
        assert!(!service.is_current(&record).unwrap());
        assert_eq!(service.decrypt(&record).unwrap(), b"sleep=6h");

        let migrated = service.reencrypt(&record).unwrap().unwrap();
        assert!(service.is_current(&migrated).unwrap());
        assert_ne!(migrated.key_fingerprint, record.key_fingerprint);
        assert_eq!(service.decrypt(&migrated).unwrap(), b"sleep=6h");
        assert!(service.reencrypt(&migrated).unwrap().is_none());
    }

    #[test]
    fn sign_and_verify() {
        let (service, _) = service();
        let tag = service.sign(b"snapshot bytes", "primary").unwrap();

        assert!(service.verify(b"snapshot bytes", &tag).unwrap());
        assert!(!service.verify(b"snapshot bytez", &tag).unwrap());

        let mut forged = tag.clone();
        forged.mac[0] ^= 1;
        assert!(!service.verify(b"snapshot bytes", &forged).unwrap());
    }

    #[test]
    fn encryption_and_integrity_keys_differ() {
        let (service, _) = service();
        let material = service.keys().material("primary").unwrap().unwrap();
        assert_ne!(material.encryption_key(), material.integrity_key());
    }
}
