//! Synchronization of the local queue with a remote peer.
//!
//! - [`SyncCoordinator`] drains pending changes through a [`RemoteExchange`]
//!   with bounded concurrency and per-record ordering
//! - Exponential backoff with jitter and a fixed attempt budget
//! - Five conflict strategies, with application-supplied merge rules
//! - [`SyncScheduler`] for connectivity, periodic and "sync now" triggers

pub mod backoff;
pub mod conflict;
pub mod coordinator;
pub mod exchange;
pub mod merge;
pub mod models;
pub mod scheduler;


pub use backoff::RetryPolicy;
pub use conflict::{ConflictResolver, Resolution, StrategyTable};
pub use coordinator::{DrainReport, ManualChoice, SyncCoordinator, SyncEvent, TerminalFailure};
pub use exchange::{InMemoryRemote, RemoteExchange};
pub use merge::{EntityMerger, FieldRule, FieldRulesMerger, MergeError, MergeRegistry};
pub use models::{
    ChangeOp, ChangeState, ConflictRecord, ConflictStrategy, ExchangeOutcome, FieldDiff,
    NewChange, OutboundChange, PendingChange, Priority, QueueStats, RemoteVersion,
    TransportError, TransportErrorKind,
};
pub use scheduler::{SyncScheduler, SyncTrigger};
