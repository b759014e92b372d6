//! AES-256-GCM encryption and decryption for records.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key
//! - 96-bit (12 byte) nonce, drawn fresh from the OS RNG for every call
//! - 128-bit authentication tag
//! - Associated data binding the format version, key id and key fingerprint

use crate::crypto::{random_bytes, CryptoError, KeyMaterial, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};

/// Envelope format written by this build.
pub const RECORD_FORMAT_VERSION: u16 = 1;

const TAG_LEN: usize = 16;

/// An encrypted record with everything needed to decrypt it again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    /// Envelope layout version
    pub format_version: u16,

    /// Lifecycle identifier of the key used (e.g. "primary")
    pub key_id: String,

    /// Fingerprint of the exact key pair, survives rotation of `key_id`
    pub key_fingerprint: String,

    /// Unique nonce for this record (12 bytes)
    pub nonce: [u8; 12],

    /// Encrypted data
    pub ciphertext: Vec<u8>,

    /// Authentication tag (16 bytes)
    pub auth_tag: [u8; 16],
}

impl EncryptedRecord {
    fn associated_data(format_version: u16, key_id: &str, fingerprint: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(2 + key_id.len() + fingerprint.len() + 2);
        aad.extend_from_slice(&format_version.to_be_bytes());
        aad.extend_from_slice(key_id.as_bytes());
        aad.push(0);
        aad.extend_from_slice(fingerprint.as_bytes());
        aad
    }

    /// Approximate at-rest size of the envelope in bytes.
    pub fn stored_len(&self) -> usize {
        12 + TAG_LEN + self.ciphertext.len() + self.key_id.len() + self.key_fingerprint.len() + 2
    }
}

/// Encrypt data under the encryption component of `material`
///
/// Never reuse nonces with the same key: the nonce is generated randomly for
/// each call and stored alongside the ciphertext.
pub fn seal(material: &KeyMaterial, key_id: &str, plaintext: &[u8]) -> Result<EncryptedRecord> {
    let cipher = Aes256Gcm::new(material.encryption_key().into());

    let nonce_bytes: [u8; 12] = random_bytes()?;
    let nonce = Nonce::from(nonce_bytes);
    let aad = EncryptedRecord::associated_data(
        RECORD_FORMAT_VERSION,
        key_id,
        material.fingerprint(),
    );

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    // AES-GCM appends the auth tag to the ciphertext
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::EncryptionFailed(
            "Ciphertext too short - missing auth tag".to_string(),
        ));
    }

    let tag_start = ciphertext.len() - TAG_LEN;
    let auth_tag: [u8; 16] = ciphertext[tag_start..]
        .try_into()
        .map_err(|_| CryptoError::EncryptionFailed("Invalid auth tag length".to_string()))?;

    Ok(EncryptedRecord {
        format_version: RECORD_FORMAT_VERSION,
        key_id: key_id.to_string(),
        key_fingerprint: material.fingerprint().to_string(),
        nonce: nonce_bytes,
        ciphertext: ciphertext[..tag_start].to_vec(),
        auth_tag,
    })
}

/// Decrypt and verify a record
///
/// Returns `AuthenticationFailed` when the tag does not verify, which covers
/// a wrong key as well as any modified byte of ciphertext, tag, nonce or the
/// bound metadata.
pub fn open(material: &KeyMaterial, record: &EncryptedRecord) -> Result<Vec<u8>> {
    if record.format_version != RECORD_FORMAT_VERSION {
        return Err(CryptoError::DecryptionFailed(format!(
            "Unsupported record format version {}",
            record.format_version
        )));
    }

    let cipher = Aes256Gcm::new(material.encryption_key().into());
    let nonce = Nonce::from(record.nonce);
    let aad = EncryptedRecord::associated_data(
        record.format_version,
        &record.key_id,
        &record.key_fingerprint,
    );

    let mut ciphertext_with_tag = Vec::with_capacity(record.ciphertext.len() + TAG_LEN);
    ciphertext_with_tag.extend_from_slice(&record.ciphertext);
    ciphertext_with_tag.extend_from_slice(&record.auth_tag);

    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: &ciphertext_with_tag,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
