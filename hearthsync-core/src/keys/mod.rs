//! Key lifecycle management.
//!
//! [`KeyManager`] owns every key pair in the process. Persisted keys (see
//! [`KeyPolicy`]) are written through a [`KeyPayloadStore`]; ephemeral keys
//! only ever live in the in-memory cache and vanish with the process.
//!
//! The cache is read-mostly and shared across concurrent encrypt/decrypt
//! calls. Generation, rotation and deletion serialize on a single mutation
//! lock and publish their result with one write-lock swap, so readers never
//! observe a half-rotated key.

pub mod payload;
pub mod policy;
pub mod store;

#[cfg(test)]
mod tests;

pub use payload::KeyPayload;
pub use policy::KeyPolicy;
pub use store::{KeyPayloadStore, MemoryKeyStore, SqliteKeyStore};

use crate::audit::{AuditEventType, AuditLogger};
use crate::config::KeysConfig;
use crate::crypto::{
    derive_key_pair, random_key_pair, CryptoError, KdfParams, KeyMaterial, KeyWrapper,
    RootKeyWrapper, RootSecret,
};
use crate::{DatabaseError, Result, SyncCoreError};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

struct CachedKey {
    payload: KeyPayload,
    material: Arc<KeyMaterial>,
    persisted: bool,
    last_used: AtomicU64,
}

#[derive(Default)]
struct Unlock {
    root: Option<RootSecret>,
    wrapper: Option<Arc<dyn KeyWrapper>>,
}

/// Owns, caches and persists key pairs.
pub struct KeyManager {
    policy: KeyPolicy,
    store: Arc<dyn KeyPayloadStore>,
    cache: RwLock<HashMap<String, CachedKey>>,
    capacity: usize,
    tick: AtomicU64,
    /// Bumped whenever a mutation publishes to the cache.
    generation: AtomicU64,
    mutation: Mutex<()>,
    unlock: RwLock<Unlock>,
    kdf: KdfParams,
    audit: Option<Arc<AuditLogger>>,
}

fn poisoned(what: &str) -> SyncCoreError {
    SyncCoreError::from(DatabaseError::LockPoisoned(format!(
        "Failed to lock {}",
        what
    )))
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyPayloadStore>, policy: KeyPolicy) -> Self {
        Self {
            policy,
            store,
            cache: RwLock::new(HashMap::new()),
            capacity: 64,
            tick: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            mutation: Mutex::new(()),
            unlock: RwLock::new(Unlock::default()),
            kdf: KdfParams::default(),
            audit: None,
        }
    }

    pub fn from_config(config: &KeysConfig, store: Arc<dyn KeyPayloadStore>) -> Self {
        Self::new(store, config.policy())
            .with_capacity(config.cache_capacity)
            .with_kdf_params(config.kdf_params())
    }

    /// Maximum number of persisted keys kept unwrapped in memory.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Cost parameters for deriving key pairs from the root secret.
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Install a root secret handed over by the unlock collaborator.
    ///
    /// New key pairs are then derived from it with Argon2id, and persisted
    /// payloads are wrapped under a key-encryption key derived from it.
    pub fn unlock(&self, root: RootSecret) -> Result<()> {
        let wrapper = RootKeyWrapper::from_root(&root).map_err(|e| SyncCoreError::KeyUnavailable {
            key_id: "*".to_string(),
            reason: e.to_string(),
        })?;

        let mut unlock = self.unlock.write().map_err(|_| poisoned("unlock state"))?;
        unlock.root = Some(root);
        unlock.wrapper = Some(Arc::new(wrapper));
        drop(unlock);

        info!("Key manager unlocked");
        self.audit_event(AuditEventType::KeysUnlocked, "root secret installed");
        Ok(())
    }

    /// Use a platform wrapper (e.g. the OS keychain) without a root secret.
    pub fn set_wrapper(&self, wrapper: Arc<dyn KeyWrapper>) -> Result<()> {
        let mut unlock = self.unlock.write().map_err(|_| poisoned("unlock state"))?;
        info!("Key wrapper installed: {}", wrapper.wrapper_id());
        unlock.wrapper = Some(wrapper);
        Ok(())
    }

    /// Forget the root secret and every unwrapped persisted key.
    ///
    /// Ephemeral keys stay cached: dropping them would destroy them.
    pub fn lock(&self) -> Result<()> {
        {
            let mut unlock = self.unlock.write().map_err(|_| poisoned("unlock state"))?;
            *unlock = Unlock::default();
        }
        {
            let mut cache = self.cache.write().map_err(|_| poisoned("key cache"))?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            cache.retain(|_, entry| !entry.persisted);
        }

        info!("Key manager locked");
        self.audit_event(AuditEventType::KeysLocked, "key cache cleared");
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlock
            .read()
            .map(|unlock| unlock.wrapper.is_some())
            .unwrap_or(false)
    }

    fn wrapper(&self) -> Result<Option<Arc<dyn KeyWrapper>>> {
        Ok(self
            .unlock
            .read()
            .map_err(|_| poisoned("unlock state"))?
            .wrapper
            .clone())
    }

    fn new_material(&self) -> Result<KeyMaterial> {
        let unlock = self.unlock.read().map_err(|_| poisoned("unlock state"))?;
        let result = match &unlock.root {
            Some(root) => derive_key_pair(root, &self.kdf).map(|(material, _salt)| material),
            None => random_key_pair(),
        };
        result.map_err(|e| match e {
            CryptoError::RandomFailed(msg) => {
                SyncCoreError::KeyGeneration(format!("randomness source unavailable: {}", msg))
            }
            other => SyncCoreError::KeyGeneration(other.to_string()),
        })
    }

    /// Create a new key pair under `key_id`.
    ///
    /// Fails if an active key already exists for the id; use
    /// [`KeyManager::rotate_key`] to replace one.
    pub fn generate_key(&self, key_id: &str) -> Result<KeyPayload> {
        policy::validate_key_id(key_id)?;
        let _guard = self.mutation.lock().map_err(|_| poisoned("key mutation"))?;
        self.generate_locked(key_id)
    }

    fn generate_locked(&self, key_id: &str) -> Result<KeyPayload> {
        if self.exists(key_id)? {
            return Err(SyncCoreError::KeyGeneration(format!(
                "key '{}' already exists; rotate it instead",
                key_id
            )));
        }

        let material = self.new_material()?;
        let wrapper = self.wrapper()?;
        let persisted = self.policy.is_persisted(key_id);
        let payload = KeyPayload::seal(&material, wrapper.as_deref(), Utc::now())?;

        if persisted {
            self.store.save(key_id, &payload)?;
        }
        self.insert_cached(key_id, payload.clone(), Arc::new(material), persisted)?;

        info!(
            "Generated key '{}' ({}, {})",
            key_id,
            payload.shape(),
            if persisted { "persisted" } else { "ephemeral" }
        );
        self.audit_event(
            AuditEventType::KeyGenerated {
                key_id: key_id.to_string(),
                persisted,
            },
            payload.shape(),
        );

        Ok(payload)
    }

    fn exists(&self, key_id: &str) -> Result<bool> {
        if self
            .cache
            .read()
            .map_err(|_| poisoned("key cache"))?
            .contains_key(key_id)
        {
            return Ok(true);
        }
        Ok(self.policy.is_persisted(key_id) && self.store.load(key_id)?.is_some())
    }

    /// Payload stored under `key_id`, or `None` if no such key was created.
    pub fn retrieve_key(&self, key_id: &str) -> Result<Option<KeyPayload>> {
        if let Some(entry) = self
            .cache
            .read()
            .map_err(|_| poisoned("key cache"))?
            .get(key_id)
        {
            return Ok(Some(entry.payload.clone()));
        }

        if self.policy.is_persisted(key_id) {
            return self.store.load(key_id);
        }
        Ok(None)
    }

    /// Unwrapped key pair for `key_id`, loading it from storage on a cache miss.
    ///
    /// The load runs outside the mutation lock. If a generation, rotation or
    /// deletion publishes while it runs, the loaded payload is discarded and
    /// the lookup starts over, so a rotated-out key never re-enters the cache
    /// as the active one.
    pub fn material(&self, key_id: &str) -> Result<Option<Arc<KeyMaterial>>> {
        loop {
            {
                let cache = self.cache.read().map_err(|_| poisoned("key cache"))?;
                if let Some(entry) = cache.get(key_id) {
                    entry
                        .last_used
                        .store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                    return Ok(Some(entry.material.clone()));
                }
            }

            if !self.policy.is_persisted(key_id) {
                return Ok(None);
            }

            let seen = self.generation.load(Ordering::SeqCst);
            let Some(payload) = self.store.load(key_id)? else {
                return Ok(None);
            };
            let wrapper = self.wrapper()?;
            let material = Arc::new(payload.open(key_id, wrapper.as_deref())?);

            let mut cache = self.cache.write().map_err(|_| poisoned("key cache"))?;
            if let Some(entry) = cache.get(key_id) {
                return Ok(Some(entry.material.clone()));
            }
            if self.generation.load(Ordering::SeqCst) != seen {
                debug!("Key '{}' changed while loading; reloading", key_id);
                continue;
            }
            cache.insert(
                key_id.to_string(),
                CachedKey {
                    payload,
                    material: material.clone(),
                    persisted: true,
                    last_used: AtomicU64::new(self.tick.fetch_add(1, Ordering::Relaxed)),
                },
            );
            self.evict_locked(&mut cache, key_id);
            debug!("Loaded key '{}' into cache", key_id);
            return Ok(Some(material));
        }
    }

    /// Active key for `key_id`, generating it if it does not exist yet.
    ///
    /// Returns the material and whether it was generated by this call.
    pub fn get_or_generate(&self, key_id: &str) -> Result<(Arc<KeyMaterial>, bool)> {
        if let Some(material) = self.material(key_id)? {
            return Ok((material, false));
        }

        policy::validate_key_id(key_id)?;
        let _guard = self.mutation.lock().map_err(|_| poisoned("key mutation"))?;
        // another caller may have generated it while we waited
        if let Some(material) = self.material(key_id)? {
            return Ok((material, false));
        }

        self.generate_locked(key_id)?;
        let material = self.material(key_id)?.ok_or_else(|| {
            SyncCoreError::KeyGeneration(format!("key '{}' vanished after generation", key_id))
        })?;
        Ok((material, true))
    }

    /// Find the key of lifecycle `key_id` whose fingerprint is `fingerprint`,
    /// looking at the active key first and then at archived generations,
    /// newest first.
    pub fn find_by_fingerprint(
        &self,
        key_id: &str,
        fingerprint: &str,
    ) -> Result<Option<(String, Arc<KeyMaterial>)>> {
        if let Some(material) = self.material(key_id)? {
            if material.fingerprint() == fingerprint {
                return Ok(Some((key_id.to_string(), material)));
            }
        }

        let mut archived: Vec<String> = self
            .list_keys()?
            .into_iter()
            .filter(|id| policy::is_archive_of(id, key_id))
            .collect();
        archived.sort_unstable_by(|a, b| b.cmp(a));

        for id in archived {
            match self.material(&id) {
                Ok(Some(material)) if material.fingerprint() == fingerprint => {
                    return Ok(Some((id, material)));
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping archived key '{}': {}", id, e),
            }
        }
        Ok(None)
    }

    /// Replace the active key for `key_id` with a fresh pair.
    ///
    /// The previous payload is archived under `{key_id}-archived-{timestamp}`.
    /// Records encrypted under it are not touched; they stay readable through
    /// the archived key until re-encrypted.
    pub fn rotate_key(&self, key_id: &str) -> Result<KeyPayload> {
        policy::validate_key_id(key_id)?;
        let _guard = self.mutation.lock().map_err(|_| poisoned("key mutation"))?;

        let old_material = self
            .material(key_id)?
            .ok_or_else(|| SyncCoreError::NotFound(format!("key '{}'", key_id)))?;
        let old_payload = self
            .retrieve_key(key_id)?
            .ok_or_else(|| SyncCoreError::NotFound(format!("key '{}'", key_id)))?;

        let material = Arc::new(self.new_material()?);
        let wrapper = self.wrapper()?;
        let now = Utc::now();
        let payload = KeyPayload::seal(&material, wrapper.as_deref(), now)?;
        let mut archived_id = policy::archive_id(key_id, now);
        let mut suffix = 1;
        while self.exists(&archived_id)? {
            archived_id = format!("{}.{}", policy::archive_id(key_id, now), suffix);
            suffix += 1;
        }
        let persisted = self.policy.is_persisted(key_id);

        if persisted {
            self.store
                .replace(key_id, &payload, Some((&archived_id, &old_payload)))?;
        }

        {
            let mut cache = self.cache.write().map_err(|_| poisoned("key cache"))?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            let tick = self.tick.fetch_add(2, Ordering::Relaxed);
            cache.insert(
                archived_id.clone(),
                CachedKey {
                    payload: old_payload,
                    material: old_material,
                    persisted,
                    last_used: AtomicU64::new(tick),
                },
            );
            cache.insert(
                key_id.to_string(),
                CachedKey {
                    payload: payload.clone(),
                    material,
                    persisted,
                    last_used: AtomicU64::new(tick + 1),
                },
            );
            self.evict_locked(&mut cache, key_id);
        }

        info!("Rotated key '{}', previous key archived as '{}'", key_id, archived_id);
        self.audit_event(
            AuditEventType::KeyRotated {
                key_id: key_id.to_string(),
                archived_as: archived_id,
            },
            "records are not re-encrypted by rotation",
        );

        Ok(payload)
    }

    /// Irreversibly delete `key_id`. Data encrypted under it becomes unreadable.
    pub fn delete_key(&self, key_id: &str) -> Result<()> {
        let _guard = self.mutation.lock().map_err(|_| poisoned("key mutation"))?;

        // storage before cache; a load in progress then finds nothing
        let stored = self.policy.is_persisted(key_id) && self.store.delete(key_id)?;
        let cached = {
            let mut cache = self.cache.write().map_err(|_| poisoned("key cache"))?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            cache.remove(key_id).is_some()
        };

        if !cached && !stored {
            return Err(SyncCoreError::NotFound(format!("key '{}'", key_id)));
        }

        warn!(
            "Deleted key '{}': any data still encrypted under it is now unreadable",
            key_id
        );
        self.audit_event(
            AuditEventType::KeyDeleted {
                key_id: key_id.to_string(),
            },
            "orphans data encrypted under this key",
        );
        Ok(())
    }

    /// Every known key id (active and archived, persisted and ephemeral), sorted.
    pub fn list_keys(&self) -> Result<Vec<String>> {
        let mut ids: BTreeSet<String> = self.store.list_ids()?.into_iter().collect();
        ids.extend(
            self.cache
                .read()
                .map_err(|_| poisoned("key cache"))?
                .keys()
                .cloned(),
        );
        Ok(ids.into_iter().collect())
    }

    /// Record that the default key was created implicitly on first use.
    pub(crate) fn audit_auto_generation(&self, key_id: &str, trigger: &str) {
        info!(
            "Auto-generated default key '{}' on first use ({})",
            key_id, trigger
        );
        self.audit_event(
            AuditEventType::DefaultKeyAutoGenerated {
                key_id: key_id.to_string(),
                trigger: trigger.to_string(),
            },
            "zero-friction default key policy",
        );
    }

    pub(crate) fn audit_event(&self, event: AuditEventType, context: &str) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log(event, context) {
                warn!("Failed to write audit entry: {}", e);
            }
        }
    }

    fn insert_cached(
        &self,
        key_id: &str,
        payload: KeyPayload,
        material: Arc<KeyMaterial>,
        persisted: bool,
    ) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| poisoned("key cache"))?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        cache.insert(
            key_id.to_string(),
            CachedKey {
                payload,
                material,
                persisted,
                last_used: AtomicU64::new(self.tick.fetch_add(1, Ordering::Relaxed)),
            },
        );
        self.evict_locked(&mut cache, key_id);
        Ok(())
    }

    /// Drop least recently used persisted keys above capacity. Ephemeral keys
    /// cannot be reloaded and are never evicted.
    fn evict_locked(&self, cache: &mut HashMap<String, CachedKey>, keep: &str) {
        while cache.len() > self.capacity {
            let victim = cache
                .iter()
                .filter(|(id, entry)| entry.persisted && id.as_str() != keep)
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(id, _)| id.clone());

            match victim {
                Some(id) => {
                    debug!("Evicting key '{}' from cache", id);
                    cache.remove(&id);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cache
            .read()
            .map(|cache| cache.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}
