//! Event-driven drain scheduling.

use super::coordinator::SyncCoordinator;
use crate::now_millis;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const MIN_RETRY_WAIT: Duration = Duration::from_millis(50);

/// Why a drain was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRestored,
    Periodic,
    /// Caller-initiated "sync now".
    Manual,
    /// A backed-off change became due.
    RetryDue,
}

/// Runs drains on connectivity, timer and caller triggers.
///
/// Triggers arriving while a drain runs collapse into one follow-up drain.
pub struct SyncScheduler {
    triggers: mpsc::Sender<SyncTrigger>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the scheduler on the current tokio runtime.
    pub fn spawn(coordinator: SyncCoordinator, interval: Duration) -> Self {
        let (triggers, receiver) = mpsc::channel(1);
        let handle = tokio::spawn(run(coordinator, receiver, interval.max(MIN_INTERVAL)));
        Self { triggers, handle }
    }

    pub fn connectivity_restored(&self) {
        self.trigger(SyncTrigger::ConnectivityRestored);
    }

    pub fn sync_now(&self) {
        self.trigger(SyncTrigger::Manual);
    }

    fn trigger(&self, trigger: SyncTrigger) {
        match self.triggers.try_send(trigger) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Drain already pending; {:?} coalesced", trigger),
            Err(TrySendError::Closed(_)) => warn!("Sync scheduler stopped; {:?} ignored", trigger),
        }
    }

    /// Stop accepting triggers and wait for the current drain to finish.
    pub async fn shutdown(self) {
        let Self { triggers, handle } = self;
        drop(triggers);
        if let Err(e) = handle.await {
            warn!("Sync scheduler task ended abnormally: {}", e);
        }
    }
}

async fn run(
    coordinator: SyncCoordinator,
    mut triggers: mpsc::Receiver<SyncTrigger>,
    interval: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;

    loop {
        let retry_due = async move {
            match retry_at {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let trigger = tokio::select! {
            received = triggers.recv() => match received {
                Some(trigger) => trigger,
                None => break,
            },
            _ = ticker.tick() => SyncTrigger::Periodic,
            _ = retry_due => SyncTrigger::RetryDue,
        };

        debug!("Drain triggered by {:?}", trigger);
        match coordinator.drain().await {
            Ok(report) if !report.is_idle() => info!(
                "{:?} drain: {} acknowledged, {} failed",
                trigger,
                report.acknowledged,
                report.terminal_failures.len()
            ),
            Ok(_) => {}
            Err(e) => warn!("Drain failed: {}", e),
        }

        retry_at = match coordinator.store().next_ready_at() {
            Ok(Some(due_ms)) => {
                let wait = Duration::from_millis((due_ms - now_millis()).max(0) as u64);
                Some(Instant::now() + wait.max(MIN_RETRY_WAIT))
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read next retry time: {}", e);
                None
            }
        };
    }

    debug!("Sync scheduler stopped");
}
