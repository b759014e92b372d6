//! Cryptographic primitives for the sync core.
//!
//! This module provides:
//! - Argon2id key derivation with configurable cost and a fresh salt per derivation
//! - AES-256-GCM record encryption with a random 96-bit nonce per call
//! - Key wrapping under a root secret or an OS keychain
//! - Zeroizing containers for key material and root secrets

pub mod cipher;
pub mod kdf;
pub mod keyring;
pub mod secret;

pub use cipher::{EncryptedRecord, RECORD_FORMAT_VERSION};
pub use kdf::{derive_key_pair, derive_root_secret, random_key_pair, KdfParams};
pub use keyring::{KeyWrapper, RootKeyWrapper, WrappedKey};
pub use secret::{KeyMaterial, RootSecret};

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Random number generation failed: {0}")]
    RandomFailed(String),

    #[error("Key wrapping unavailable: {0}")]
    WrappingUnavailable(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Fill a fixed-size array from the OS randomness source.
///
/// Unlike `OsRng::fill_bytes`, a failing entropy source surfaces as an error.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::RandomFailed(e.to_string()))?;
    Ok(buf)
}
