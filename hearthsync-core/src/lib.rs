//! HearthSync Core Library
//!
//! Local-first encrypted synchronization core. Four components, leaves first:
//!
//! - [`keys::KeyManager`] derives, wraps, persists, rotates and retrieves key material.
//! - [`encryption::EncryptionService`] authenticates-and-encrypts records and signs
//!   auxiliary integrity data.
//! - [`store::LocalStore`] is the durable, transactional home of encrypted records,
//!   the pending-change queue and key usage metadata.
//! - [`sync::SyncCoordinator`] drains the queue against a [`sync::RemoteExchange`],
//!   retries with backoff and reconciles conflicts.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod encryption;
pub mod export;
pub mod keys;
pub mod platform;
pub mod store;
pub mod sync;

pub use config::CoreConfig;
pub use crypto::{CryptoError, EncryptedRecord, RootSecret, RECORD_FORMAT_VERSION};
pub use encryption::{EncryptionService, IntegrityTag};
pub use keys::{KeyManager, KeyPayload, KeyPolicy};
pub use store::{ChangeFilter, LocalStore, RecordDocument};
pub use sync::{
    ConflictRecord, ConflictStrategy, DrainReport, ExchangeOutcome, PendingChange, Priority,
    RemoteExchange, SyncCoordinator,
};

use thiserror::Error;

/// Result type for sync core operations
pub type Result<T> = std::result::Result<T, SyncCoreError>;

/// Why a record could not be decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptionFailure {
    /// No key (active or archived) matches the record. Recoverable by
    /// re-importing or unlocking the key.
    KeyNotFound { key_id: String },
    /// The authentication tag did not verify: the data is corrupted or was
    /// tampered with. Not recoverable.
    AuthFailure,
}

impl std::fmt::Display for DecryptionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyNotFound { key_id } => write!(f, "key '{}' not found", key_id),
            Self::AuthFailure => write!(f, "authentication failed - data corrupted or tampered"),
        }
    }
}

/// General error type for sync core operations
#[derive(Error, Debug)]
pub enum SyncCoreError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key '{key_id}' is unavailable: {reason}")]
    KeyUnavailable { key_id: String, reason: String },

    #[error("Invalid key payload: {0}")]
    InvalidKeyPayload(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(DecryptionFailure),

    #[error("Storage quota exceeded: {used} of {limit} bytes in use")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("Transport error (retryable: {retryable}): {message}")]
    Transport { retryable: bool, message: String },

    #[error("Conflict on record '{record_id}' is awaiting resolution")]
    ConflictUnresolved { record_id: String },

    #[error("Change {change_id} failed permanently: {reason}")]
    TerminalSyncFailure { change_id: String, reason: String },

    #[error("Record '{record_id}' moved to local version {found} while resolving version {expected}")]
    StaleResolution {
        record_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncCoreError {
    /// True for failures that the caller can recover from without data loss.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Decryption(DecryptionFailure::AuthFailure)
                | Self::TerminalSyncFailure { .. }
                | Self::InvalidKeyPayload(_)
        )
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("{0}")]
    Other(String),
}

impl From<bincode::Error> for DatabaseError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Current time as Unix milliseconds. All queue and field timestamps use this unit.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
