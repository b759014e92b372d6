//! Zeroizing containers for root secrets and key material.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Opaque root secret handed in by the unlock collaborator.
///
/// This is the output of the caller's own passphrase derivation (or a
/// capability token from a secure enclave). The key manager never sees the raw
/// passphrase.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootSecret {
    bytes: Vec<u8>,
}

impl RootSecret {
    /// Wrap caller-derived secret bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the secret bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for RootSecret {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl std::fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootSecret([REDACTED; {}])", self.bytes.len())
    }
}

/// Unwrapped key pair held in the key cache.
///
/// The encryption component feeds AES-256-GCM; the integrity component feeds
/// HMAC-SHA256. Both are zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    encryption_key: [u8; 32],
    integrity_key: [u8; 32],
    #[zeroize(skip)]
    fingerprint: String,
}

impl KeyMaterial {
    pub fn new(encryption_key: [u8; 32], integrity_key: [u8; 32]) -> Self {
        let fingerprint = fingerprint_of(&encryption_key, &integrity_key);
        Self {
            encryption_key,
            integrity_key,
            fingerprint,
        }
    }

    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.encryption_key
    }

    pub fn integrity_key(&self) -> &[u8; 32] {
        &self.integrity_key
    }

    /// Short, non-secret identifier of this exact key pair.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn fingerprint_of(encryption_key: &[u8; 32], integrity_key: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"hearthsync-key-fingerprint-v1");
    hasher.update(encryption_key);
    hasher.update(integrity_key);
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = KeyMaterial::new([1u8; 32], [2u8; 32]);
        let b = KeyMaterial::new([1u8; 32], [2u8; 32]);
        let c = KeyMaterial::new([1u8; 32], [3u8; 32]);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let secret = RootSecret::new(vec![0xAA; 32]);
        let rendered = format!("{:?}", secret);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("170"));

        let material = KeyMaterial::new([9u8; 32], [9u8; 32]);
        assert!(!format!("{:?}", material).contains("encryption_key"));
    }
}
