//! Sync data models: queued changes, exchange outcomes and conflicts.

use crate::store::RecordDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Delivery tier of a pending change. Lower rank drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => Self::Critical,
            1 => Self::High,
            2 => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Kind of mutation a change represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "create" => Self::Create,
            "delete" => Self::Delete,
            _ => Self::Update,
        }
    }
}

/// Durable state of a queued change.
///
/// Acknowledged changes are removed from the queue, so there is no state for
/// them. A retryable failure goes back to `Queued` with a later
/// `next_retry_at`; a terminal one ends in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Queued,
    InFlight,
    Conflicted,
    Failed,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_flight" => Self::InFlight,
            "conflicted" => Self::Conflicted,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

/// A queued mutation of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Enqueue sequence, strictly increasing.
    pub seq: i64,
    pub change_id: Uuid,
    pub record_id: String,
    pub entity_type: String,
    pub op: ChangeOp,
    pub priority: Priority,
    pub state: ChangeState,
    pub retry_count: u32,
    /// Unix milliseconds before which the change is not eligible.
    pub next_retry_at: i64,
    /// Logical clock value assigned at enqueue time.
    pub logical_ts: u64,
    /// Remote version this change was made against.
    pub base_version: u64,
    pub changed_fields: Vec<String>,
    pub failure_reason: Option<String>,
    pub enqueued_at: i64,
}

/// Caller-supplied description of a change to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    /// Idempotency key; generated when `None`.
    pub change_id: Option<Uuid>,
    pub op: ChangeOp,
    pub priority: Priority,
    pub changed_fields: Vec<String>,
}

impl NewChange {
    pub fn new(op: ChangeOp, priority: Priority) -> Self {
        Self {
            change_id: None,
            op,
            priority,
            changed_fields: Vec::new(),
        }
    }

    pub fn with_fields<I: IntoIterator<Item = String>>(mut self, fields: I) -> Self {
        self.changed_fields = fields.into_iter().collect();
        self
    }

    pub fn with_change_id(mut self, change_id: Uuid) -> Self {
        self.change_id = Some(change_id);
        self
    }
}

/// What the remote exchange is asked to apply: the head change of a record,
/// the changes coalesced behind it, and the record's current local state.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundChange {
    pub change: PendingChange,
    pub coalesced: Vec<PendingChange>,
    pub document: RecordDocument,
}

impl OutboundChange {
    /// Every change id this exchange attempt settles.
    pub fn change_ids(&self) -> Vec<Uuid> {
        std::iter::once(self.change.change_id)
            .chain(self.coalesced.iter().map(|c| c.change_id))
            .collect()
    }

    /// Union of the fields touched by the head and coalesced changes.
    pub fn changed_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = std::iter::once(&self.change)
            .chain(self.coalesced.iter())
            .flat_map(|c| c.changed_fields.iter().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    /// Effective operation of the coalesced batch.
    pub fn op(&self) -> ChangeOp {
        if self.document.deleted {
            ChangeOp::Delete
        } else if self.change.op == ChangeOp::Create {
            ChangeOp::Create
        } else {
            self.coalesced
                .iter()
                .map(|c| c.op)
                .find(|op| *op == ChangeOp::Create)
                .unwrap_or(ChangeOp::Update)
        }
    }

    /// Only the changed fields with their current values, for differential sync.
    /// Fields that were removed map to `Value::Null`.
    pub fn delta(&self) -> BTreeMap<String, Value> {
        self.changed_fields()
            .into_iter()
            .map(|field| {
                let value = self
                    .document
                    .fields
                    .get(&field)
                    .cloned()
                    .unwrap_or(Value::Null);
                (field, value)
            })
            .collect()
    }
}

/// Remote copy of a record as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub version: u64,
    pub document: RecordDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Network,
    Timeout,
    Unavailable,
    /// Credentials missing or expired.
    Unauthorized,
    Forbidden,
    /// The remote refused the change for a reason retrying will not fix.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unauthorized, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Network | TransportErrorKind::Timeout | TransportErrorKind::Unavailable
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Unauthorized | TransportErrorKind::Forbidden
        )
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<TransportError> for crate::SyncCoreError {
    fn from(e: TransportError) -> Self {
        Self::Transport {
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

/// Result of one exchange attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    /// Applied remotely; the record is now at `remote_version`.
    Ack { remote_version: u64 },
    /// The remote copy moved past the change's base version.
    Conflict(RemoteVersion),
    Failed(TransportError),
}

/// Conflict-resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    ClientWins,
    ServerWins,
    LatestTimestamp,
    Merge,
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::LatestTimestamp => "latest_timestamp",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_wins" => Some(Self::ClientWins),
            "server_wins" => Some(Self::ServerWins),
            "latest_timestamp" => Some(Self::LatestTimestamp),
            "merge" => Some(Self::Merge),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One field whose value differs between the local and remote copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local: Option<Value>,
    pub remote: Option<Value>,
    pub local_modified: Option<i64>,
    pub remote_modified: Option<i64>,
}

/// A detected divergence between local and remote copies of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: Uuid,
    pub record_id: String,
    pub entity_type: String,
    /// Queue entries blocked on this conflict.
    pub change_ids: Vec<Uuid>,
    pub local: RecordDocument,
    pub remote: RemoteVersion,
    pub diffs: Vec<FieldDiff>,
    pub strategy: ConflictStrategy,
    /// Set once a resolution was produced.
    pub merged: Option<RecordDocument>,
    pub created_at: i64,
}

/// Counts of queue entries by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub ready: usize,
    pub in_flight: usize,
    pub conflicted: usize,
    pub failed: usize,
    pub unresolved_conflicts: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.in_flight + self.conflicted + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(seq: i64, fields: &[&str], op: ChangeOp) -> PendingChange {
        PendingChange {
            seq,
            change_id: Uuid::new_v4(),
            record_id: "r1".to_string(),
            entity_type: "journal".to_string(),
            op,
            priority: Priority::Medium,
            state: ChangeState::InFlight,
            retry_count: 0,
            next_retry_at: 0,
            logical_ts: seq as u64,
            base_version: 0,
            changed_fields: fields.iter().map(|f| f.to_string()).collect(),
            failure_reason: None,
            enqueued_at: 0,
        }
    }

    #[test]
    fn priority_rank_roundtrip() {
        for p in [Priority::Critical, Priority::High, Priority::Medium, Priority::Low] {
            assert_eq!(Priority::from_rank(p.rank()), p);
            assert_eq!(Priority::parse(p.as_str()), Some(p));
        }
        assert!(Priority::Critical < Priority::Low);
    }

    #[test]
    fn state_and_strategy_strings() {
        for s in [
            ChangeState::Queued,
            ChangeState::InFlight,
            ChangeState::Conflicted,
            ChangeState::Failed,
        ] {
            assert_eq!(ChangeState::parse(s.as_str()), s);
        }
        assert_eq!(
            ConflictStrategy::parse("latest_timestamp"),
            Some(ConflictStrategy::LatestTimestamp)
        );
        assert_eq!(ConflictStrategy::parse("bogus"), None);
    }

    #[test]
    fn delta_contains_only_changed_fields() {
        let mut document = RecordDocument::new("r1", "journal");
        document.fields.insert("notes".to_string(), Value::from("walked"));
        document.fields.insert("mood".to_string(), Value::from(4));
        document.fields.insert("sleep".to_string(), Value::from(7));

        let outbound = OutboundChange {
            change: change(1, &["notes"], ChangeOp::Update),
            coalesced: vec![change(2, &["mood", "notes", "gone"], ChangeOp::Update)],
            document,
        };

        let delta = outbound.delta();
        assert_eq!(delta.len(), 3);
        assert_eq!(delta["notes"], Value::from("walked"));
        assert_eq!(delta["mood"], Value::from(4));
        assert_eq!(delta["gone"], Value::Null);
        assert!(!delta.contains_key("sleep"));
        assert_eq!(outbound.change_ids().len(), 2);
    }

    #[test]
    fn coalesced_create_stays_create() {
        let outbound = OutboundChange {
            change: change(1, &[], ChangeOp::Create),
            coalesced: vec![change(2, &["notes"], ChangeOp::Update)],
            document: RecordDocument::new("r1", "journal"),
        };
        assert_eq!(outbound.op(), ChangeOp::Create);
    }

    #[test]
    fn transport_error_classification() {
        assert!(TransportError::network("offline").is_retryable());
        let auth = TransportError::unauthorized("token expired");
        assert!(!auth.is_retryable());
        assert!(auth.is_auth());
        assert!(!TransportError::new(TransportErrorKind::Rejected, "bad").is_retryable());
    }
}
