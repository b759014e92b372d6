//! Drains the pending-change queue against the remote exchange.
//!
//! Per change: `Queued -> InFlight -> {Acknowledged | Conflicted | Queued (retry) | Failed}`.
//! Errors never reach the original writer; they stay visible as queue state
//! (failed changes, parked conflicts) and as [`SyncEvent`]s.

use super::backoff::RetryPolicy;
use super::conflict::{ConflictResolver, Resolution};
use super::exchange::RemoteExchange;
use super::merge::MergeRegistry;
use super::models::{
    ChangeState, ConflictRecord, ConflictStrategy, ExchangeOutcome, OutboundChange,
    PendingChange, Priority, RemoteVersion,
};
use crate::config::SyncSettings;
use crate::store::{ChangeFilter, LocalStore, RecordDocument, ResolutionCommit};
use crate::{now_millis, Result, SyncCoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;
/// Times a resolution is recomputed after local edits overtook it.
const STALE_RESOLUTION_RETRIES: u32 = 3;

/// A change that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalFailure {
    pub change_id: Uuid,
    pub record_id: String,
    pub reason: String,
}

impl From<TerminalFailure> for SyncCoreError {
    fn from(f: TerminalFailure) -> Self {
        Self::TerminalSyncFailure {
            change_id: f.change_id.to_string(),
            reason: f.reason,
        }
    }
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Changes removed from the queue after remote acknowledgment.
    pub acknowledged: usize,
    pub retried: usize,
    pub terminal_failures: Vec<TerminalFailure>,
    pub conflicts_resolved: usize,
    pub conflicts_parked: usize,
    pub conflicts_deferred: usize,
    pub cancelled: bool,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        self.acknowledged == 0
            && self.retried == 0
            && self.terminal_failures.is_empty()
            && self.conflicts_resolved == 0
            && self.conflicts_parked == 0
            && self.conflicts_deferred == 0
    }

    fn absorb(&mut self, step: Step) {
        match step {
            Step::Acknowledged(count) => self.acknowledged += count,
            Step::Retried => self.retried += 1,
            Step::Failed(failures) => self.terminal_failures.extend(failures),
            Step::Resolved => self.conflicts_resolved += 1,
            Step::Parked => self.conflicts_parked += 1,
            Step::Deferred => self.conflicts_deferred += 1,
            Step::Skipped => {}
        }
    }
}

/// Observable sync progress.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Acknowledged {
        record_id: String,
        change_ids: Vec<Uuid>,
        remote_version: u64,
    },
    RetryScheduled {
        record_id: String,
        attempt: u32,
        next_retry_at: i64,
        reason: String,
    },
    Failed(TerminalFailure),
    ConflictResolved {
        record_id: String,
        strategy: ConflictStrategy,
        requeued: bool,
    },
    ConflictParked {
        conflict_id: Uuid,
        record_id: String,
    },
    ConflictDeferred {
        record_id: String,
        until: i64,
    },
    DrainFinished(DrainReport),
}

/// Caller decision for a parked conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualChoice {
    KeepLocal,
    AcceptRemote,
    Custom(RecordDocument),
}

enum Step {
    Acknowledged(usize),
    Retried,
    Failed(Vec<TerminalFailure>),
    Resolved,
    Parked,
    Deferred,
    Skipped,
}

struct Inner {
    store: Arc<LocalStore>,
    exchange: Arc<dyn RemoteExchange>,
    resolver: ConflictResolver,
    policy: RetryPolicy,
    max_concurrency: usize,
    batch_limit: usize,
    max_unresolved_conflicts: usize,
    conflict_deferral: Duration,
    record_locks: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
    cancel: AtomicBool,
    draining: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

/// Drains the queue with bounded concurrency across records and strict
/// enqueue order within a record. Cheap to clone.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        exchange: Arc<dyn RemoteExchange>,
        settings: &SyncSettings,
        mergers: MergeRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                exchange,
                resolver: ConflictResolver::new(settings.strategy_table(), mergers),
                policy: settings.retry_policy(),
                max_concurrency: settings.max_concurrency.max(1),
                batch_limit: settings.batch_limit.max(1),
                max_unresolved_conflicts: settings.max_unresolved_conflicts,
                conflict_deferral: Duration::from_millis(settings.conflict_deferral_ms),
                record_locks: StdMutex::new(HashMap::new()),
                cancel: AtomicBool::new(false),
                draining: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the current drain before its next dequeue. Exchanges already in
    /// flight complete normally. A cancel issued while idle stops the next
    /// drain before it sends anything.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Process every ready change until the queue has nothing due.
    ///
    /// Concurrent calls run one after another.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.run(None).await
    }

    /// Like [`SyncCoordinator::drain`], but stops dequeuing once `budget`
    /// has elapsed, for short host-provided background windows.
    pub async fn drain_for(&self, budget: Duration) -> Result<DrainReport> {
        self.run(Some(Instant::now() + budget)).await
    }

    async fn run(&self, deadline: Option<Instant>) -> Result<DrainReport> {
        let inner = &self.inner;
        let _draining = inner.draining.lock().await;

        let mut report = DrainReport::default();
        let mut workers: JoinSet<Step> = JoinSet::new();
        let mut claimed: HashMap<task::Id, PendingChange> = HashMap::new();
        let mut store_error = None;
        let mut stopped = false;

        loop {
            while !stopped && workers.len() < inner.max_concurrency {
                if inner.cancel.load(Ordering::SeqCst) {
                    debug!("Drain cancelled");
                    report.cancelled = true;
                    stopped = true;
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    debug!("Drain budget spent");
                    stopped = true;
                    break;
                }
                match inner.store.dequeue_next(now_millis()) {
                    Ok(Some(change)) => {
                        let worker = Arc::clone(inner);
                        let head = change.clone();
                        let handle = workers.spawn(async move { worker.process(change).await });
                        claimed.insert(handle.id(), head);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to dequeue next change: {}", e);
                        store_error = Some(e);
                        stopped = true;
                        break;
                    }
                }
            }

            match workers.join_next_with_id().await {
                Some(Ok((id, step))) => {
                    claimed.remove(&id);
                    report.absorb(step);
                }
                Some(Err(e)) => {
                    warn!("Drain worker aborted: {}", e);
                    // release what the worker claimed
                    if let Some(head) = claimed.remove(&e.id()) {
                        let error = SyncCoreError::Transport {
                            retryable: true,
                            message: format!("change handler panicked: {}", e),
                        };
                        report.absorb(inner.release_after_error(&head, error));
                    }
                }
                None => break,
            }
        }

        inner.cancel.store(false, Ordering::SeqCst);

        if let Some(e) = store_error {
            return Err(e);
        }
        if !report.is_idle() {
            info!(
                "Drain finished: {} acknowledged, {} retrying, {} failed, {} conflicts resolved, {} parked",
                report.acknowledged,
                report.retried,
                report.terminal_failures.len(),
                report.conflicts_resolved,
                report.conflicts_parked
            );
        }
        inner.emit(SyncEvent::DrainFinished(report.clone()));
        Ok(report)
    }

    /// Parked conflicts awaiting a caller decision, oldest first.
    pub fn unresolved_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.inner.store.list_conflicts()
    }

    /// Changes that failed permanently and wait for caller intervention.
    pub fn failed_changes(&self) -> Result<Vec<PendingChange>> {
        self.inner
            .store
            .list_changes(&ChangeFilter::state(ChangeState::Failed))
    }

    /// Apply a caller decision to a parked conflict.
    ///
    /// The chosen document becomes the local copy. If it differs from the
    /// remote copy it is queued for upload; the returned change is that entry.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        choice: ManualChoice,
    ) -> Result<Option<PendingChange>> {
        let inner = &self.inner;
        let not_found = || SyncCoreError::NotFound(format!("conflict {}", conflict_id));

        let record_id = inner
            .store
            .get_conflict(conflict_id)?
            .ok_or_else(not_found)?
            .record_id;
        let lock = inner.record_lock(&record_id);
        let _held = lock.lock().await;

        // re-read under the record lock
        let conflict = inner.store.get_conflict(conflict_id)?.ok_or_else(not_found)?;
        let remote = &conflict.remote.document;
        let priority = match conflict.change_ids.first() {
            Some(id) => inner.store.get_change(*id)?.map(|c| c.priority),
            None => None,
        }
        .unwrap_or(Priority::Medium);

        let mut refreshed = 0;
        let requeued = loop {
            let current = inner
                .store
                .read_document(&conflict.record_id)?
                .unwrap_or_else(|| conflict.local.clone());

            let mut resolved = match &choice {
                ManualChoice::KeepLocal => current.clone(),
                ManualChoice::AcceptRemote => remote.clone(),
                ManualChoice::Custom(doc) => {
                    if doc.id != conflict.record_id || doc.entity_type != conflict.entity_type {
                        return Err(SyncCoreError::InvalidInput(format!(
                            "resolution for '{}' must be a '{}' with the same id",
                            conflict.record_id, conflict.entity_type
                        )));
                    }
                    doc.clone()
                }
            };
            resolved.version = current.version.max(remote.version) + 1;
            let diverges = resolved.fields != remote.fields || resolved.deleted != remote.deleted;

            match inner.store.commit_resolution(ResolutionCommit {
                record_id: &conflict.record_id,
                resolved: &resolved,
                based_on: current.version,
                remote_version: conflict.remote.version,
                settled: &conflict.change_ids,
                conflict_id: Some(conflict_id),
                requeue: diverges.then_some((priority, 0)),
            }) {
                Err(SyncCoreError::StaleResolution { .. }) if refreshed < STALE_RESOLUTION_RETRIES => {
                    refreshed += 1;
                }
                other => break other?,
            }
        };

        info!("Conflict on '{}' resolved by caller", conflict.record_id);
        inner.emit(SyncEvent::ConflictResolved {
            record_id: conflict.record_id.clone(),
            strategy: ConflictStrategy::Manual,
            requeued: requeued.is_some(),
        });
        Ok(requeued)
    }

    /// Store a remote copy received outside a drain (e.g. from a pull).
    /// Returns `false` when the record has unsynced local changes or the copy
    /// is not newer than what is stored.
    pub async fn ingest_remote(&self, remote: RemoteVersion) -> Result<bool> {
        let lock = self.inner.record_lock(&remote.document.id);
        let _held = lock.lock().await;
        self.inner.store.apply_remote(&remote)
    }
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Advisory lock serializing all queue and table mutation of one record.
    fn record_lock(&self, record_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .record_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(record_id).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(record_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    async fn process(self: Arc<Self>, head: PendingChange) -> Step {
        let lock = self.record_lock(&head.record_id);
        let _held = lock.lock().await;

        match self.exchange_change(head.clone()).await {
            Ok(step) => step,
            Err(e) => self.release_after_error(&head, e),
        }
    }

    async fn exchange_change(&self, head: PendingChange) -> Result<Step> {
        let followers = self
            .store
            .absorb_followers(&head, self.batch_limit - 1)?;
        let Some(document) = self.store.read_document(&head.record_id)? else {
            debug!("Record '{}' vanished before sending", head.record_id);
            return Ok(Step::Skipped);
        };

        let outbound = OutboundChange {
            change: head,
            coalesced: followers,
            document,
        };
        if !outbound.coalesced.is_empty() {
            debug!(
                "Coalesced {} change(s) of '{}' into one exchange",
                outbound.coalesced.len() + 1,
                outbound.document.id
            );
        }

        match self.exchange.send(&outbound).await {
            ExchangeOutcome::Ack { remote_version } => {
                let ids = outbound.change_ids();
                self.store
                    .acknowledge(&outbound.document.id, &ids, remote_version)?;
                debug!(
                    "'{}' acknowledged at remote version {}",
                    outbound.document.id, remote_version
                );
                self.emit(SyncEvent::Acknowledged {
                    record_id: outbound.document.id.clone(),
                    change_ids: ids.clone(),
                    remote_version,
                });
                Ok(Step::Acknowledged(ids.len()))
            }
            ExchangeOutcome::Failed(error) => {
                if error.is_auth() {
                    warn!(
                        "Exchange rejected credentials for '{}'; re-authentication required",
                        outbound.document.id
                    );
                }
                self.settle_failure(
                    &outbound.change,
                    &outbound.change_ids(),
                    error.to_string(),
                    error.is_retryable(),
                )
            }
            ExchangeOutcome::Conflict(remote) => self.handle_conflict(&outbound, remote),
        }
    }

    /// Retry with backoff, or fail permanently once the budget is spent or the
    /// error is not worth retrying.
    fn settle_failure(
        &self,
        head: &PendingChange,
        ids: &[Uuid],
        reason: String,
        retryable: bool,
    ) -> Result<Step> {
        let attempt = head.retry_count + 1;

        if !retryable || self.policy.is_exhausted(attempt) {
            let reason = if retryable {
                format!(
                    "gave up after {} attempts: {}",
                    self.policy.max_attempts, reason
                )
            } else {
                reason
            };
            let mut failures = Vec::with_capacity(ids.len());
            for id in ids {
                self.store.mark_failed(*id, &reason)?;
                failures.push(TerminalFailure {
                    change_id: *id,
                    record_id: head.record_id.clone(),
                    reason: reason.clone(),
                });
            }
            for failure in &failures {
                self.emit(SyncEvent::Failed(failure.clone()));
            }
            return Ok(Step::Failed(failures));
        }

        let delay = self.policy.jittered_delay(attempt);
        let next_retry_at = now_millis() + delay.as_millis() as i64;
        self.store
            .schedule_retry(ids, attempt, next_retry_at, Some(&reason))?;
        debug!(
            "Attempt {} for '{}' failed, retrying in {:?}: {}",
            attempt, head.record_id, delay, reason
        );
        self.emit(SyncEvent::RetryScheduled {
            record_id: head.record_id.clone(),
            attempt,
            next_retry_at,
            reason,
        });
        Ok(Step::Retried)
    }

    fn handle_conflict(&self, outbound: &OutboundChange, remote: RemoteVersion) -> Result<Step> {
        let head = &outbound.change;
        let ids = outbound.change_ids();
        let mut local = outbound.document.clone();
        let strategy = self.resolver.strategy_for(&local.entity_type);
        let mut refreshed = 0;

        loop {
            match self.resolver.resolve_with(strategy, &local, &remote) {
                Resolution::Resolved(resolved) => {
                    let attempt = head.retry_count + 1;
                    let diverges = resolved.fields != remote.document.fields
                        || resolved.deleted != remote.document.deleted;

                    let committed = self.store.commit_resolution(ResolutionCommit {
                        record_id: &local.id,
                        resolved: &resolved,
                        based_on: local.version,
                        remote_version: remote.version,
                        settled: &ids,
                        conflict_id: None,
                        requeue: diverges.then_some((head.priority, attempt)),
                    });
                    let requeued = match committed {
                        Err(SyncCoreError::StaleResolution { found, .. })
                            if refreshed < STALE_RESOLUTION_RETRIES =>
                        {
                            refreshed += 1;
                            debug!(
                                "'{}' was edited during the exchange (now version {}); resolving again",
                                local.id, found
                            );
                            let Some(current) = self.store.read_document(&local.id)? else {
                                return Ok(Step::Skipped);
                            };
                            local = current;
                            continue;
                        }
                        other => other?,
                    };
                    info!(
                        "Resolved conflict on '{}' with {}",
                        local.id,
                        strategy.as_str()
                    );
                    self.emit(SyncEvent::ConflictResolved {
                        record_id: local.id.clone(),
                        strategy,
                        requeued: requeued.is_some(),
                    });

                    return match requeued {
                        Some(change) if self.policy.is_exhausted(attempt) => {
                            let reason = format!(
                                "record kept conflicting after {} attempts",
                                self.policy.max_attempts
                            );
                            self.store.mark_failed(change.change_id, &reason)?;
                            let failure = TerminalFailure {
                                change_id: change.change_id,
                                record_id: local.id.clone(),
                                reason,
                            };
                            self.emit(SyncEvent::Failed(failure.clone()));
                            Ok(Step::Failed(vec![failure]))
                        }
                        _ => Ok(Step::Resolved),
                    };
                }
                Resolution::Manual => {
                    if self.store.unresolved_conflicts()? >= self.max_unresolved_conflicts {
                        let until = now_millis() + self.conflict_deferral.as_millis() as i64;
                        self.store.schedule_retry(
                            &ids,
                            head.retry_count,
                            until,
                            Some("unresolved conflict backlog is full"),
                        )?;
                        warn!(
                            "Conflict backlog full; change to '{}' deferred",
                            local.id
                        );
                        self.emit(SyncEvent::ConflictDeferred {
                            record_id: local.id.clone(),
                            until,
                        });
                        return Ok(Step::Deferred);
                    }

                    let conflict = ConflictRecord {
                        conflict_id: Uuid::new_v4(),
                        record_id: local.id.clone(),
                        entity_type: local.entity_type.clone(),
                        change_ids: ids,
                        diffs: ConflictResolver::diff(&local, &remote.document),
                        local,
                        remote,
                        strategy,
                        merged: None,
                        created_at: now_millis(),
                    };
                    self.store.park_conflict(&conflict)?;
                    self.emit(SyncEvent::ConflictParked {
                        conflict_id: conflict.conflict_id,
                        record_id: conflict.record_id,
                    });
                    return Ok(Step::Parked);
                }
            }
        }
    }

    /// A local failure while handling a change. Its claimed changes go back
    /// through the retry budget so they are never stranded in flight; records
    /// that can no longer be decrypted fail permanently.
    fn release_after_error(&self, head: &PendingChange, error: SyncCoreError) -> Step {
        warn!(
            "Handling change {} of '{}' failed: {}",
            head.change_id, head.record_id, error
        );
        let claimed = ChangeFilter {
            state: Some(ChangeState::InFlight),
            record_id: Some(head.record_id.clone()),
            ..ChangeFilter::default()
        };
        let mut ids: Vec<Uuid> = self
            .store
            .list_changes(&claimed)
            .map(|changes| changes.into_iter().map(|c| c.change_id).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            ids.push(head.change_id);
        }

        let retryable = !matches!(error, SyncCoreError::Decryption(_));
        match self.settle_failure(head, &ids, error.to_string(), retryable) {
            Ok(step) => step,
            Err(e) => {
                warn!("Could not release change {}: {}", head.change_id, e);
                Step::Skipped
            }
        }
    }
}
