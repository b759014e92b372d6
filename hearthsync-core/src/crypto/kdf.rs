//! Argon2id key derivation.
//!
//! Default parameters:
//! - Memory cost: 64 MB (65,536 KiB)
//! - Time cost: 3 iterations (configurable, the "iteration count")
//! - Parallelism: 4 lanes
//! - Salt length: 16 bytes, drawn fresh for every key derivation

use crate::crypto::{random_bytes, CryptoError, KeyMaterial, Result, RootSecret};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Lowest memory cost accepted by [`KdfParams::validate`], in KiB.
pub const MIN_MEM_COST_KIB: u32 = 8_192;

/// Parameters for Argon2id key derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Salt for key derivation (16 bytes)
    pub salt: [u8; 16],

    /// Memory cost in KiB
    pub mem_cost: u32,

    /// Time cost (number of iterations)
    pub time_cost: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: rand::random(),
            mem_cost: 65_536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Create new KDF parameters with a random salt
    pub fn new() -> Self {
        Self::default()
    }

    /// Same cost parameters, different salt.
    pub fn with_fresh_salt(&self) -> Result<Self> {
        Ok(Self {
            salt: random_bytes()?,
            ..self.clone()
        })
    }

    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.mem_cost < MIN_MEM_COST_KIB {
            return Err(CryptoError::KdfFailed(format!(
                "Memory cost too low (minimum: {} KiB)",
                MIN_MEM_COST_KIB
            )));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        Ok(())
    }

    fn hash_into(&self, input: &[u8], out: &mut [u8]) -> Result<()> {
        self.validate()?;

        let params = Params::new(
            self.mem_cost,
            self.time_cost,
            self.parallelism,
            Some(out.len()),
        )
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(input, &self.salt, out)
            .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))
    }
}

/// Derive a root secret from a passphrase.
///
/// This runs on the caller's side of the unlock boundary: the result is handed
/// to the key manager opaquely and the passphrase itself never crosses over.
/// The salt in `params` must be persisted by the caller to re-derive later.
pub fn derive_root_secret(passphrase: &[u8], params: &KdfParams) -> Result<RootSecret> {
    let mut out = Zeroizing::new(vec![0u8; 32]);
    params.hash_into(passphrase, &mut out)?;
    Ok(RootSecret::new(out.to_vec()))
}

/// Derive an encryption key and a separate integrity key from a root secret.
///
/// A fresh random salt is drawn for every call, so two derivations from the
/// same root never produce the same pair. Returns the salt that was used.
pub fn derive_key_pair(root: &RootSecret, cost: &KdfParams) -> Result<(KeyMaterial, [u8; 16])> {
    if root.is_empty() {
        return Err(CryptoError::KdfFailed("Root secret is empty".to_string()));
    }

    let params = cost.with_fresh_salt()?;
    let mut out = Zeroizing::new([0u8; 64]);
    params.hash_into(root.as_bytes(), out.as_mut_slice())?;

    let mut encryption_key = [0u8; 32];
    let mut integrity_key = [0u8; 32];
    encryption_key.copy_from_slice(&out[..32]);
    integrity_key.copy_from_slice(&out[32..]);

    Ok((KeyMaterial::new(encryption_key, integrity_key), params.salt))
}

/// Draw an independent random key pair (no root secret available).
pub fn random_key_pair() -> Result<KeyMaterial> {
    Ok(KeyMaterial::new(random_bytes()?, random_bytes()?))
}
