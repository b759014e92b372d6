use super::*;
use crate::crypto::kdf::MIN_MEM_COST_KIB;
use std::sync::mpsc;

fn cheap_kdf() -> KdfParams {
    KdfParams {
        mem_cost: MIN_MEM_COST_KIB,
        time_cost: 1,
        parallelism: 1,
        ..KdfParams::default()
    }
}

fn manager() -> KeyManager {
    KeyManager::new(Arc::new(MemoryKeyStore::new()), KeyPolicy::default())
        .with_kdf_params(cheap_kdf())
}

#[test]
fn test_generate_and_retrieve() {
    let keys = manager();
    assert!(keys.retrieve_key("primary").unwrap().is_none());

    let payload = keys.generate_key("primary").unwrap();
    assert_eq!(payload.shape(), "raw");
    assert_eq!(keys.retrieve_key("primary").unwrap(), Some(payload));
    assert!(keys.material("primary").unwrap().is_some());
}

#[test]
fn test_generate_twice_is_rejected() {
    let keys = manager();
    keys.generate_key("primary").unwrap();
    assert!(matches!(
        keys.generate_key("primary"),
        Err(SyncCoreError::KeyGeneration(_))
    ));
}

#[test]
fn test_archived_ids_cannot_be_generated_directly() {
    let keys = manager();
    assert!(matches!(
        keys.generate_key("primary-archived-2026"),
        Err(SyncCoreError::InvalidInput(_))
    ));
}

#[test]
fn test_whitelist_controls_persistence() {
    let store = Arc::new(MemoryKeyStore::new());
    let keys = KeyManager::new(store.clone(), KeyPolicy::default());

    keys.generate_key("primary").unwrap();
    keys.generate_key("backup-export").unwrap();
    keys.generate_key("scratch").unwrap();

    assert_eq!(
        store.list_ids().unwrap(),
        vec!["backup-export".to_string(), "primary".to_string()]
    );

    // a fresh manager over the same store sees only the persisted keys
    let reopened = KeyManager::new(store, KeyPolicy::default());
    assert!(reopened.retrieve_key("primary").unwrap().is_some());
    assert!(reopened.retrieve_key("backup-export").unwrap().is_some());
    assert!(reopened.retrieve_key("scratch").unwrap().is_none());
}

#[test]
fn test_rotation_archives_previous_key() {
    let store = Arc::new(MemoryKeyStore::new());
    let keys = KeyManager::new(store.clone(), KeyPolicy::default());

    keys.generate_key("primary").unwrap();
    let before = keys.material("primary").unwrap().unwrap();

    keys.rotate_key("primary").unwrap();
    let after = keys.material("primary").unwrap().unwrap();
    assert_ne!(before.fingerprint(), after.fingerprint());

    let ids = keys.list_keys().unwrap();
    assert_eq!(ids.len(), 2);
    let archived = ids
        .iter()
        .find(|id| id.starts_with("primary-archived-"))
        .unwrap();
    assert!(store.list_ids().unwrap().contains(archived));

    let (found_id, found) = keys
        .find_by_fingerprint("primary", before.fingerprint())
        .unwrap()
        .unwrap();
    assert_eq!(&found_id, archived);
    assert_eq!(found.fingerprint(), before.fingerprint());
}

#[test]
fn test_ephemeral_rotation_stays_in_memory() {
    let store = Arc::new(MemoryKeyStore::new());
    let keys = KeyManager::new(store.clone(), KeyPolicy::default());

    keys.generate_key("scratch").unwrap();
    keys.rotate_key("scratch").unwrap();

    assert_eq!(keys.list_keys().unwrap().len(), 2);
    assert!(store.list_ids().unwrap().is_empty());
}

#[test]
fn test_rotate_missing_key() {
    let keys = manager();
    assert!(matches!(
        keys.rotate_key("primary"),
        Err(SyncCoreError::NotFound(_))
    ));
}

#[test]
fn test_delete_key() {
    let audit = Arc::new(AuditLogger::in_memory());
    let keys = manager().with_audit(audit.clone());

    keys.generate_key("primary").unwrap();
    keys.delete_key("primary").unwrap();

    assert!(keys.retrieve_key("primary").unwrap().is_none());
    assert!(matches!(
        keys.delete_key("primary"),
        Err(SyncCoreError::NotFound(_))
    ));

    let high = audit.get_entries_by_severity(5).unwrap();
    assert_eq!(high.len(), 1);
    assert!(matches!(
        high[0].event_type,
        AuditEventType::KeyDeleted { .. }
    ));
}

#[test]
fn test_unlocked_keys_are_wrapped_and_derived() {
    let store = Arc::new(MemoryKeyStore::new());
    let keys = KeyManager::new(store.clone(), KeyPolicy::default()).with_kdf_params(cheap_kdf());
    keys.unlock(RootSecret::new(vec![11u8; 32])).unwrap();

    let payload = keys.generate_key("primary").unwrap();
    assert!(payload.is_wrapped());
    let fingerprint = keys.material("primary").unwrap().unwrap().fingerprint().to_string();

    // without the root secret the persisted key cannot be opened
    let locked = KeyManager::new(store.clone(), KeyPolicy::default());
    assert!(matches!(
        locked.material("primary"),
        Err(SyncCoreError::KeyUnavailable { .. })
    ));

    // with it, the same key comes back
    locked.unlock(RootSecret::new(vec![11u8; 32])).unwrap();
    assert_eq!(
        locked.material("primary").unwrap().unwrap().fingerprint(),
        fingerprint
    );
}

#[test]
fn test_lock_clears_persisted_keys_only() {
    let keys = manager();
    keys.unlock(RootSecret::new(vec![1u8; 32])).unwrap();
    keys.generate_key("primary").unwrap();
    keys.generate_key("scratch").unwrap();

    keys.lock().unwrap();
    assert!(!keys.is_unlocked());
    assert_eq!(keys.cached_ids(), vec!["scratch".to_string()]);
    assert!(keys.material("primary").is_err());
}

#[test]
fn test_cache_evicts_persisted_keys_lru() {
    let store = Arc::new(MemoryKeyStore::new());
    let policy = KeyPolicy::new(["a".to_string(), "b".to_string(), "c".to_string()]);
    let keys = KeyManager::new(store, policy).with_capacity(2);

    keys.generate_key("a").unwrap();
    keys.generate_key("b").unwrap();
    keys.material("a").unwrap();
    keys.generate_key("c").unwrap();

    assert_eq!(keys.cached_ids(), vec!["a".to_string(), "c".to_string()]);
    // evicted keys reload transparently
    assert!(keys.material("b").unwrap().is_some());
}

#[test]
fn test_get_or_generate_reports_creation() {
    let keys = manager();
    let (first, created) = keys.get_or_generate("primary").unwrap();
    assert!(created);
    let (second, created) = keys.get_or_generate("primary").unwrap();
    assert!(!created);
    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[test]
fn test_concurrent_readers_never_see_missing_key_during_rotation() {
    let keys = Arc::new(manager());
    keys.generate_key("primary").unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let keys = keys.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    assert!(keys.material("primary").unwrap().is_some());
                }
            })
        })
        .collect();

    for _ in 0..5 {
        keys.rotate_key("primary").unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(keys.list_keys().unwrap().len(), 6);
}

/// Store whose next load of an armed id blocks until released, after
/// reporting that the payload has been read.
#[derive(Default)]
struct PausingStore {
    inner: MemoryKeyStore,
    pause: std::sync::Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl PausingStore {
    fn arm(&self, loaded: mpsc::Sender<()>, resume: mpsc::Receiver<()>) {
        *self.pause.lock().unwrap() = Some((loaded, resume));
    }
}

impl KeyPayloadStore for PausingStore {
    fn load(&self, key_id: &str) -> Result<Option<KeyPayload>> {
        let payload = self.inner.load(key_id)?;
        let pause = self.pause.lock().unwrap().take();
        if let Some((loaded, resume)) = pause {
            loaded.send(()).unwrap();
            resume.recv().unwrap();
        }
        Ok(payload)
    }

    fn save(&self, key_id: &str, payload: &KeyPayload) -> Result<()> {
        self.inner.save(key_id, payload)
    }

    fn delete(&self, key_id: &str) -> Result<bool> {
        self.inner.delete(key_id)
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        self.inner.list_ids()
    }

    fn replace(
        &self,
        key_id: &str,
        replacement: &KeyPayload,
        archived: Option<(&str, &KeyPayload)>,
    ) -> Result<()> {
        self.inner.replace(key_id, replacement, archived)
    }
}

#[test]
fn test_load_racing_rotation_keeps_new_key_active() {
    let store = Arc::new(PausingStore::default());
    let keys = Arc::new(KeyManager::new(store.clone(), KeyPolicy::default()));
    keys.generate_key("primary").unwrap();
    let old = keys.material("primary").unwrap().unwrap().fingerprint().to_string();
    // empty the cache so the next read goes to storage
    keys.lock().unwrap();

    let (loaded_tx, loaded_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    store.arm(loaded_tx, resume_rx);

    let reader = {
        let keys = keys.clone();
        std::thread::spawn(move || {
            keys.material("primary")
                .unwrap()
                .unwrap()
                .fingerprint()
                .to_string()
        })
    };

    // the reader now holds the pre-rotation payload
    loaded_rx.recv().unwrap();
    keys.rotate_key("primary").unwrap();
    resume_tx.send(()).unwrap();
    let seen = reader.join().unwrap();

    let stored = store
        .load("primary")
        .unwrap()
        .unwrap()
        .open("primary", None)
        .unwrap()
        .fingerprint()
        .to_string();
    let active = keys.material("primary").unwrap().unwrap().fingerprint().to_string();
    assert_ne!(stored, old);
    assert_eq!(active, stored);
    assert_eq!(seen, stored);
}

#[test]
fn test_load_racing_deletion_does_not_resurrect_key() {
    let store = Arc::new(PausingStore::default());
    let keys = Arc::new(KeyManager::new(store.clone(), KeyPolicy::default()));
    keys.generate_key("primary").unwrap();
    keys.lock().unwrap();

    let (loaded_tx, loaded_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    store.arm(loaded_tx, resume_rx);

    let reader = {
        let keys = keys.clone();
        std::thread::spawn(move || keys.material("primary").unwrap().is_some())
    };
    loaded_rx.recv().unwrap();
    keys.delete_key("primary").unwrap();
    resume_tx.send(()).unwrap();

    assert!(!reader.join().unwrap());
    assert!(keys.material("primary").unwrap().is_none());
}

#[test]
fn test_sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");

    let fingerprint = {
        let keys = KeyManager::new(
            Arc::new(SqliteKeyStore::open(&path).unwrap()),
            KeyPolicy::default(),
        );
        keys.generate_key("primary").unwrap();
        keys.material("primary").unwrap().unwrap().fingerprint().to_string()
    };

    let keys = KeyManager::new(
        Arc::new(SqliteKeyStore::open(&path).unwrap()),
        KeyPolicy::default(),
    );
    assert_eq!(
        keys.material("primary").unwrap().unwrap().fingerprint(),
        fingerprint
    );
}
