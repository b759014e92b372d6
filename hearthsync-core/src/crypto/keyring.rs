//! Key wrapping.
//!
//! Implements the wrapping scheme used for persisted key payloads:
//! Root Secret → HKDF-SHA256 → Key-Encryption Key → wraps → key components
//!
//! With the `os-keyring` feature an OS keychain entry can hold the
//! key-encryption key instead of the root secret.

use crate::crypto::{random_bytes, CryptoError, Result, RootSecret};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroizing, ZeroizeOnDrop};

const KEK_SALT: &[u8] = b"hearthsync-kek-v1";
const KEK_INFO: &[u8] = b"key-wrapping";

/// A wrapped (encrypted) key component that can be safely stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrappedKey {
    /// Wrapped (encrypted) key bytes
    #[serde(with = "crate::keys::payload::base64_bytes")]
    pub wrapped: Vec<u8>,

    /// Nonce used for wrapping
    #[serde(with = "crate::keys::payload::base64_array")]
    pub nonce: [u8; 12],

    /// Authentication tag
    #[serde(with = "crate::keys::payload::base64_array")]
    pub auth_tag: [u8; 16],
}

/// A platform-provided key-wrapping primitive.
pub trait KeyWrapper: Send + Sync {
    /// Stable identifier recorded in wrapped payloads.
    fn wrapper_id(&self) -> &str;

    /// Wrap a 32-byte key component
    fn wrap(&self, key: &[u8; 32]) -> Result<WrappedKey>;

    /// Unwrap a key component previously produced by [`KeyWrapper::wrap`]
    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Zeroizing<[u8; 32]>>;
}

/// AES-256-GCM wrapping under a key-encryption key derived from the root secret
#[derive(ZeroizeOnDrop)]
pub struct RootKeyWrapper {
    kek: [u8; 32],
}

impl RootKeyWrapper {
    /// Wrapper identifier written into payloads
    pub const ID: &'static str = "root-v1";

    /// Derive the key-encryption key from an opaque root secret
    pub fn from_root(root: &RootSecret) -> Result<Self> {
        if root.is_empty() {
            return Err(CryptoError::KdfFailed("Root secret is empty".to_string()));
        }

        let hk = Hkdf::<Sha256>::new(Some(KEK_SALT), root.as_bytes());
        let mut kek = [0u8; 32];
        hk.expand(KEK_INFO, &mut kek)
            .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;

        Ok(Self { kek })
    }

    fn from_kek(kek: [u8; 32]) -> Self {
        Self { kek }
    }
}

impl KeyWrapper for RootKeyWrapper {
    fn wrapper_id(&self) -> &str {
        Self::ID
    }

    fn wrap(&self, key: &[u8; 32]) -> Result<WrappedKey> {
        wrap_with_kek(&self.kek, key)
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Zeroizing<[u8; 32]>> {
        unwrap_with_kek(&self.kek, wrapped)
    }
}

fn wrap_with_kek(kek: &[u8; 32], key: &[u8; 32]) -> Result<WrappedKey> {
    let cipher = Aes256Gcm::new(kek.into());
    let nonce_bytes: [u8; 12] = random_bytes()?;
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, key.as_ref())
        .map_err(|e| CryptoError::EncryptionFailed(format!("Failed to wrap key: {}", e)))?;

    if ciphertext.len() < 16 {
        return Err(CryptoError::EncryptionFailed(
            "Wrapped key too short".to_string(),
        ));
    }

    let tag_start = ciphertext.len() - 16;
    let auth_tag: [u8; 16] = ciphertext[tag_start..]
        .try_into()
        .map_err(|_| CryptoError::EncryptionFailed("Invalid auth tag".to_string()))?;

    Ok(WrappedKey {
        wrapped: ciphertext[..tag_start].to_vec(),
        nonce: nonce_bytes,
        auth_tag,
    })
}

fn unwrap_with_kek(kek: &[u8; 32], wrapped: &WrappedKey) -> Result<Zeroizing<[u8; 32]>> {
    let cipher = Aes256Gcm::new(kek.into());
    let nonce = Nonce::from(wrapped.nonce);

    let mut ciphertext_with_tag = wrapped.wrapped.clone();
    ciphertext_with_tag.extend_from_slice(&wrapped.auth_tag);

    let key_bytes = Zeroizing::new(
        cipher
            .decrypt(&nonce, ciphertext_with_tag.as_ref())
            .map_err(|_| CryptoError::AuthenticationFailed)?,
    );

    if key_bytes.len() != 32 {
        return Err(CryptoError::InvalidKeyLength {
            expected: 32,
            got: key_bytes.len(),
        });
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&key_bytes);
    Ok(key)
}

/// Key-encryption key held in the operating system keychain.
#[cfg(feature = "os-keyring")]
pub struct OsKeyringWrapper {
    inner: RootKeyWrapper,
}

#[cfg(feature = "os-keyring")]
impl OsKeyringWrapper {
    /// Wrapper identifier written into payloads
    pub const ID: &'static str = "os-keyring-v1";

    const SERVICE_NAME: &'static str = "HearthSync";

    /// Load the key-encryption key stored under `account`, creating it on first use.
    pub fn open(account: &str) -> Result<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let entry = ::keyring::Entry::new(Self::SERVICE_NAME, account).map_err(|e| {
            CryptoError::WrappingUnavailable(format!("Failed to initialize keyring entry: {}", e))
        })?;

        let kek: [u8; 32] = match entry.get_password() {
            Ok(encoded) => {
                let decoded = Zeroizing::new(STANDARD.decode(encoded).map_err(|e| {
                    CryptoError::WrappingUnavailable(format!(
                        "Stored keyring secret is invalid: {}",
                        e
                    ))
                })?);
                decoded
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyLength {
                        expected: 32,
                        got: decoded.len(),
                    })?
            }
            Err(::keyring::Error::NoEntry) => {
                let fresh: [u8; 32] = random_bytes()?;
                entry.set_password(&STANDARD.encode(fresh)).map_err(|e| {
                    CryptoError::WrappingUnavailable(format!(
                        "Failed to store keyring secret: {}",
                        e
                    ))
                })?;
                tracing::info!("Created key-encryption key in OS keychain");
                fresh
            }
            Err(e) => {
                return Err(CryptoError::WrappingUnavailable(format!(
                    "Keyring secret is unavailable: {}",
                    e
                )))
            }
        };

        Ok(Self {
            inner: RootKeyWrapper::from_kek(kek),
        })
    }
}

#[cfg(feature = "os-keyring")]
impl KeyWrapper for OsKeyringWrapper {
    fn wrapper_id(&self) -> &str {
        Self::ID
    }

    fn wrap(&self, key: &[u8; 32]) -> Result<WrappedKey> {
        self.inner.wrap(key)
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Zeroizing<[u8; 32]>> {
        self.inner.unwrap(wrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let wrapper = RootKeyWrapper::from_root(&RootSecret::new(vec![3u8; 32])).unwrap();
        let key = [42u8; 32];

        let wrapped = wrapper.wrap(&key).unwrap();
        assert!(!wrapped.wrapped.is_empty());
        assert_ne!(wrapped.wrapped, key.to_vec());

        let unwrapped = wrapper.unwrap(&wrapped).unwrap();
        assert_eq!(*unwrapped, key);
    }

    #[test]
    fn test_unwrap_with_different_root_fails() {
        let a = RootKeyWrapper::from_root(&RootSecret::new(vec![1u8; 32])).unwrap();
        let b = RootKeyWrapper::from_root(&RootSecret::new(vec![2u8; 32])).unwrap();

        let wrapped = a.wrap(&[9u8; 32]).unwrap();
        assert!(matches!(
            b.unwrap(&wrapped),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_same_root_derives_same_kek() {
        let root = RootSecret::new(vec![5u8; 32]);
        let a = RootKeyWrapper::from_root(&root).unwrap();
        let b = RootKeyWrapper::from_root(&root).unwrap();

        let wrapped = a.wrap(&[8u8; 32]).unwrap();
        assert_eq!(*b.unwrap(&wrapped).unwrap(), [8u8; 32]);
    }

    #[test]
    fn test_empty_root_rejected() {
        assert!(RootKeyWrapper::from_root(&RootSecret::new(Vec::new())).is_err());
    }
}
