//! Remote exchange boundary.

use crate::sync::models::{ExchangeOutcome, OutboundChange, RemoteVersion, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Sends one (possibly coalesced) change to the remote side.
///
/// Implementations must be idempotent under retry: sending the same change
/// ids twice has the effect of sending them once. A remote copy that moved
/// past `change.base_version` must be reported as
/// [`ExchangeOutcome::Conflict`], not as a failure.
#[async_trait]
pub trait RemoteExchange: Send + Sync {
    async fn send(&self, outbound: &OutboundChange) -> ExchangeOutcome;
}

#[derive(Default)]
struct RemoteState {
    documents: HashMap<String, RemoteVersion>,
    /// Change id -> version it produced, for idempotent replays.
    applied: HashMap<Uuid, u64>,
}

/// In-process remote keeping one versioned copy per record.
///
/// Useful as a loopback peer for several local stores in one process, and
/// for exercising the coordinator without a network.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    online: AtomicBool,
    sends: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            online: AtomicBool::new(true),
            sends: AtomicUsize::new(0),
        }
    }

    /// While offline every send fails with a retryable network error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of send calls so far.
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn get(&self, record_id: &str) -> Option<RemoteVersion> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.documents.get(record_id).cloned())
    }

    /// Overwrite the remote copy, as another device's upload would.
    pub fn put(&self, remote: RemoteVersion) {
        if let Ok(mut state) = self.state.lock() {
            state.documents.insert(remote.document.id.clone(), remote);
        }
    }
}

#[async_trait]
impl RemoteExchange for InMemoryRemote {
    async fn send(&self, outbound: &OutboundChange) -> ExchangeOutcome {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return ExchangeOutcome::Failed(TransportError::network("remote unreachable"));
        }

        let Ok(mut state) = self.state.lock() else {
            return ExchangeOutcome::Failed(TransportError::network("remote state poisoned"));
        };

        let ids = outbound.change_ids();
        let replayed = ids
            .iter()
            .map(|id| state.applied.get(id).copied())
            .collect::<Option<Vec<u64>>>()
            .and_then(|versions| versions.into_iter().max());
        if let Some(version) = replayed {
            return ExchangeOutcome::Ack {
                remote_version: version,
            };
        }

        let record_id = &outbound.document.id;
        let current = state.documents.get(record_id).map(|r| r.version).unwrap_or(0);
        if current != outbound.change.base_version {
            if let Some(remote) = state.documents.get(record_id) {
                return ExchangeOutcome::Conflict(remote.clone());
            }
        }

        let version = current + 1;
        state.documents.insert(
            record_id.clone(),
            RemoteVersion {
                version,
                document: outbound.document.clone(),
            },
        );
        for id in ids {
            state.applied.insert(id, version);
        }
        ExchangeOutcome::Ack {
            remote_version: version,
        }
    }
}
