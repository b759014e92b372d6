//! On-disk representation of a key pair.

use crate::crypto::{KeyMaterial, KeyWrapper, WrappedKey};
use crate::{Result, SyncCoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

const WRAPPED_FIELDS: &[&str] = &[
    "shape",
    "wrapper",
    "encryption_key",
    "integrity_key",
    "created_at",
];
const RAW_FIELDS: &[&str] = &["shape", "encryption_key", "integrity_key", "created_at"];

/// Persisted form of a key pair.
///
/// `Wrapped` is preferred: both components are encrypted under a
/// [`KeyWrapper`]. `Raw` stores directly usable key bytes and is only written
/// when no wrapper is installed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum KeyPayload {
    Wrapped {
        wrapper: String,
        encryption_key: WrappedKey,
        integrity_key: WrappedKey,
        created_at: DateTime<Utc>,
    },
    Raw {
        #[serde(with = "base64_bytes")]
        encryption_key: Vec<u8>,
        #[serde(with = "base64_bytes")]
        integrity_key: Vec<u8>,
        created_at: DateTime<Utc>,
    },
}

impl KeyPayload {
    /// Build the payload for `material`, wrapping it when a wrapper is available.
    pub fn seal(
        material: &KeyMaterial,
        wrapper: Option<&dyn KeyWrapper>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        match wrapper {
            Some(wrapper) => {
                let wrap = |key: &[u8; 32]| {
                    wrapper
                        .wrap(key)
                        .map_err(|e| SyncCoreError::KeyGeneration(format!("Key wrapping failed: {}", e)))
                };
                Ok(Self::Wrapped {
                    wrapper: wrapper.wrapper_id().to_string(),
                    encryption_key: wrap(material.encryption_key())?,
                    integrity_key: wrap(material.integrity_key())?,
                    created_at,
                })
            }
            None => Ok(Self::Raw {
                encryption_key: material.encryption_key().to_vec(),
                integrity_key: material.integrity_key().to_vec(),
                created_at,
            }),
        }
    }

    /// Recover usable key material.
    ///
    /// A wrapped payload needs the same wrapper that produced it; without one
    /// the key is reported as unavailable rather than invalid.
    pub fn open(&self, key_id: &str, wrapper: Option<&dyn KeyWrapper>) -> Result<KeyMaterial> {
        match self {
            Self::Raw {
                encryption_key,
                integrity_key,
                ..
            } => Ok(KeyMaterial::new(
                to_key(encryption_key)?,
                to_key(integrity_key)?,
            )),
            Self::Wrapped {
                wrapper: wrapper_id,
                encryption_key,
                integrity_key,
                ..
            } => {
                let wrapper = wrapper.ok_or_else(|| SyncCoreError::KeyUnavailable {
                    key_id: key_id.to_string(),
                    reason: "key store is locked".to_string(),
                })?;
                if wrapper.wrapper_id() != wrapper_id {
                    return Err(SyncCoreError::KeyUnavailable {
                        key_id: key_id.to_string(),
                        reason: format!(
                            "payload wrapped by '{}', installed wrapper is '{}'",
                            wrapper_id,
                            wrapper.wrapper_id()
                        ),
                    });
                }

                let unwrap = |wrapped: &WrappedKey| {
                    wrapper.unwrap(wrapped).map_err(|e| SyncCoreError::KeyUnavailable {
                        key_id: key_id.to_string(),
                        reason: format!("unwrap failed: {}", e),
                    })
                };
                let enc = unwrap(encryption_key)?;
                let int = unwrap(integrity_key)?;
                Ok(KeyMaterial::new(*enc, *int))
            }
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Wrapped { created_at, .. } | Self::Raw { created_at, .. } => *created_at,
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, Self::Wrapped { .. })
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Wrapped { .. } => "wrapped",
            Self::Raw { .. } => "raw",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SyncCoreError::InvalidKeyPayload(format!("serialize: {}", e)))
    }

    /// Parse a stored payload, rejecting anything that is not exactly one shape.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| SyncCoreError::InvalidKeyPayload(format!("not JSON: {}", e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| SyncCoreError::InvalidKeyPayload("expected an object".to_string()))?;

        let allowed = match object.get("shape").and_then(|s| s.as_str()) {
            Some("wrapped") => WRAPPED_FIELDS,
            Some("raw") => RAW_FIELDS,
            Some(other) => {
                return Err(SyncCoreError::InvalidKeyPayload(format!(
                    "unknown shape '{}'",
                    other
                )))
            }
            None => {
                return Err(SyncCoreError::InvalidKeyPayload(
                    "missing shape discriminator".to_string(),
                ))
            }
        };

        if let Some(extra) = object.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(SyncCoreError::InvalidKeyPayload(format!(
                "unexpected field '{}'",
                extra
            )));
        }

        let payload: Self = serde_json::from_value(value)
            .map_err(|e| SyncCoreError::InvalidKeyPayload(e.to_string()))?;

        if let Self::Raw {
            encryption_key,
            integrity_key,
            ..
        } = &payload
        {
            to_key(encryption_key)?;
            to_key(integrity_key)?;
        }

        Ok(payload)
    }
}

impl Drop for KeyPayload {
    fn drop(&mut self) {
        if let Self::Raw {
            encryption_key,
            integrity_key,
            ..
        } = self
        {
            encryption_key.zeroize();
            integrity_key.zeroize();
        }
    }
}

impl std::fmt::Debug for KeyPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPayload")
            .field("shape", &self.shape())
            .field("created_at", &self.created_at())
            .finish_non_exhaustive()
    }
}

fn to_key(bytes: &[u8]) -> Result<[u8; 32]> {
    let key: Zeroizing<[u8; 32]> = Zeroizing::new(bytes.try_into().map_err(|_| {
        SyncCoreError::InvalidKeyPayload(format!(
            "key component must be 32 bytes, got {}",
            bytes.len()
        ))
    })?);
    Ok(*key)
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod base64_array {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(len, &"a fixed-size byte array"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{RootKeyWrapper, RootSecret};

    fn material() -> KeyMaterial {
        KeyMaterial::new([1u8; 32], [2u8; 32])
    }

    fn wrapper() -> RootKeyWrapper {
        RootKeyWrapper::from_root(&RootSecret::new(vec![4u8; 32])).unwrap()
    }

    #[test]
    fn raw_payload_roundtrip() {
        let payload = KeyPayload::seal(&material(), None, Utc::now()).unwrap();
        assert_eq!(payload.shape(), "raw");

        let parsed = KeyPayload::from_json(&payload.to_json().unwrap()).unwrap();
        let opened = parsed.open("primary", None).unwrap();
        assert_eq!(opened.fingerprint(), material().fingerprint());
    }

    #[test]
    fn wrapped_payload_needs_wrapper() {
        let w = wrapper();
        let payload = KeyPayload::seal(&material(), Some(&w), Utc::now()).unwrap();
        assert!(payload.is_wrapped());

        let json = payload.to_json().unwrap();
        assert!(!json.contains(&base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            [1u8; 32]
        )));

        let parsed = KeyPayload::from_json(&json).unwrap();
        assert!(matches!(
            parsed.open("primary", None),
            Err(SyncCoreError::KeyUnavailable { .. })
        ));
        assert_eq!(
            parsed.open("primary", Some(&w)).unwrap().fingerprint(),
            material().fingerprint()
        );
    }

    #[test]
    fn mixed_shapes_are_rejected() {
        let w = wrapper();
        let wrapped = KeyPayload::seal(&material(), Some(&w), Utc::now()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&wrapped.to_json().unwrap()).unwrap();

        // a wrapped payload carrying a stray raw field
        value["raw_key"] = serde_json::json!("AAAA");
        assert!(matches!(
            KeyPayload::from_json(&value.to_string()),
            Err(SyncCoreError::InvalidKeyPayload(_))
        ));

        // wrapped components under a raw discriminator
        value.as_object_mut().unwrap().remove("raw_key");
        value.as_object_mut().unwrap().remove("wrapper");
        value["shape"] = serde_json::json!("raw");
        assert!(KeyPayload::from_json(&value.to_string()).is_err());

        // no discriminator at all
        value.as_object_mut().unwrap().remove("shape");
        assert!(KeyPayload::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn raw_component_length_is_checked() {
        let json = serde_json::json!({
            "shape": "raw",
            "encryption_key": "AAAA",
            "integrity_key": "AAAA",
            "created_at": Utc::now(),
        });
        assert!(matches!(
            KeyPayload::from_json(&json.to_string()),
            Err(SyncCoreError::InvalidKeyPayload(_))
        ));
    }

    #[test]
    fn debug_is_redacted() {
        let payload = KeyPayload::seal(&material(), None, Utc::now()).unwrap();
        let rendered = format!("{:?}", payload);
        assert!(rendered.contains("raw"));
        assert!(!rendered.contains("encryption_key"));
    }
}
