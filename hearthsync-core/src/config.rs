//! Core configuration.

use crate::crypto::kdf::{KdfParams, MIN_MEM_COST_KIB};
use crate::keys::KeyPolicy;
use crate::sync::{ConflictStrategy, RetryPolicy, StrategyTable};
use crate::{Result, SyncCoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub storage: StorageConfig,
    pub keys: KeysConfig,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Upper bound on stored envelope bytes; `None` disables the check.
    pub quota_bytes: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: crate::platform::get_default_store_path(),
            quota_bytes: Some(512 * 1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub default_key_id: String,
    /// Identifiers written to durable storage. `backup-*` ids always are.
    pub persisted_ids: Vec<String>,
    pub cache_capacity: usize,
    pub kdf_mem_cost: u32,
    pub kdf_time_cost: u32,
    pub kdf_parallelism: u32,
    pub audit_dir: Option<PathBuf>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            default_key_id: "primary".to_string(),
            persisted_ids: vec!["primary".to_string()],
            cache_capacity: 64,
            kdf_mem_cost: 65_536,
            kdf_time_cost: 3,
            kdf_parallelism: 4,
            audit_dir: None,
        }
    }
}

impl KeysConfig {
    /// Cost parameters for key derivation; the salt is replaced on every use.
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            mem_cost: self.kdf_mem_cost,
            time_cost: self.kdf_time_cost,
            parallelism: self.kdf_parallelism,
            ..KdfParams::default()
        }
    }

    pub fn policy(&self) -> KeyPolicy {
        KeyPolicy::new(self.persisted_ids.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    pub max_concurrency: usize,
    /// Maximum number of consecutive same-record changes coalesced into one send.
    pub batch_limit: usize,
    pub periodic_interval_secs: u64,
    pub max_unresolved_conflicts: usize,
    /// Delay applied to a change whose manual conflict cannot be parked yet.
    pub conflict_deferral_ms: u64,
    pub default_strategy: ConflictStrategy,
    pub entity_strategies: BTreeMap<String, ConflictStrategy>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.2,
            max_concurrency: 4,
            batch_limit: 16,
            periodic_interval_secs: 300,
            max_unresolved_conflicts: 256,
            conflict_deferral_ms: 60_000,
            default_strategy: ConflictStrategy::LatestTimestamp,
            entity_strategies: BTreeMap::new(),
        }
    }
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }

    pub fn strategy_table(&self) -> StrategyTable {
        let mut table = StrategyTable::new(self.default_strategy);
        for (entity, strategy) in &self.entity_strategies {
            table.set(entity.clone(), *strategy);
        }
        table
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SyncCoreError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.max_attempts == 0 {
            return Err(SyncCoreError::Config(
                "sync.max_attempts must be at least 1".to_string(),
            ));
        }
        if sync.max_concurrency == 0 {
            return Err(SyncCoreError::Config(
                "sync.max_concurrency must be at least 1".to_string(),
            ));
        }
        if sync.batch_limit == 0 {
            return Err(SyncCoreError::Config(
                "sync.batch_limit must be at least 1".to_string(),
            ));
        }
        if sync.max_delay_ms < sync.base_delay_ms {
            return Err(SyncCoreError::Config(
                "sync.max_delay_ms must not be below sync.base_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&sync.jitter_ratio) {
            return Err(SyncCoreError::Config(
                "sync.jitter_ratio must be within [0, 1]".to_string(),
            ));
        }
        if sync.max_unresolved_conflicts == 0 {
            return Err(SyncCoreError::Config(
                "sync.max_unresolved_conflicts must be at least 1".to_string(),
            ));
        }

        let keys = &self.keys;
        if keys.default_key_id.trim().is_empty() {
            return Err(SyncCoreError::Config(
                "keys.default_key_id must not be empty".to_string(),
            ));
        }
        if keys.cache_capacity == 0 {
            return Err(SyncCoreError::Config(
                "keys.cache_capacity must be at least 1".to_string(),
            ));
        }
        if keys.kdf_mem_cost < MIN_MEM_COST_KIB {
            return Err(SyncCoreError::Config(format!(
                "keys.kdf_mem_cost must be at least {} KiB",
                MIN_MEM_COST_KIB
            )));
        }
        keys.kdf_params()
            .validate()
            .map_err(|e| SyncCoreError::Config(e.to_string()))?;

        Ok(())
    }
}
