//! Conflict resolution between local and remote copies of a record.

use crate::store::RecordDocument;
use crate::sync::merge::MergeRegistry;
use crate::sync::models::{ConflictStrategy, FieldDiff, RemoteVersion};
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Conflict strategy per entity type, with a default for the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyTable {
    default: ConflictStrategy,
    per_entity: HashMap<String, ConflictStrategy>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::new(ConflictStrategy::LatestTimestamp)
    }
}

impl StrategyTable {
    pub fn new(default: ConflictStrategy) -> Self {
        Self {
            default,
            per_entity: HashMap::new(),
        }
    }

    pub fn set(&mut self, entity_type: impl Into<String>, strategy: ConflictStrategy) {
        self.per_entity.insert(entity_type.into(), strategy);
    }

    pub fn with(mut self, entity_type: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.set(entity_type, strategy);
        self
    }

    pub fn for_entity(&self, entity_type: &str) -> ConflictStrategy {
        self.per_entity
            .get(entity_type)
            .copied()
            .unwrap_or(self.default)
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default
    }
}

/// Conflict resolution outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A document to commit. Its version is past both inputs.
    Resolved(RecordDocument),
    /// Needs a caller decision.
    Manual,
}

pub struct ConflictResolver {
    strategies: StrategyTable,
    mergers: MergeRegistry,
}

impl ConflictResolver {
    pub fn new(strategies: StrategyTable, mergers: MergeRegistry) -> Self {
        Self {
            strategies,
            mergers,
        }
    }

    pub fn strategy_for(&self, entity_type: &str) -> ConflictStrategy {
        self.strategies.for_entity(entity_type)
    }

    /// Fields whose values differ between the two copies, sorted by name.
    pub fn diff(local: &RecordDocument, remote: &RecordDocument) -> Vec<FieldDiff> {
        local
            .differing_fields(remote)
            .into_iter()
            .map(|field| FieldDiff {
                local: local.fields.get(&field).cloned(),
                remote: remote.fields.get(&field).cloned(),
                local_modified: local.modified_at(&field),
                remote_modified: remote.modified_at(&field),
                field,
            })
            .collect()
    }

    /// Resolve with the strategy configured for the record's entity type.
    pub fn resolve(&self, local: &RecordDocument, remote: &RemoteVersion) -> Resolution {
        self.resolve_with(self.strategy_for(&local.entity_type), local, remote)
    }

    /// Resolve with an explicit strategy.
    ///
    /// Deterministic: the same inputs always give the same document. A failing
    /// or panicking merger degrades to [`Resolution::Manual`].
    pub fn resolve_with(
        &self,
        strategy: ConflictStrategy,
        local: &RecordDocument,
        remote: &RemoteVersion,
    ) -> Resolution {
        let theirs = &remote.document;
        let resolved = match strategy {
            ConflictStrategy::ClientWins => local.clone(),
            ConflictStrategy::ServerWins => theirs.clone(),
            ConflictStrategy::LatestTimestamp => latest_timestamp(local, theirs),
            ConflictStrategy::Merge => match self.merge(local, theirs) {
                Some(doc) => doc,
                None => return Resolution::Manual,
            },
            ConflictStrategy::Manual => return Resolution::Manual,
        };

        Resolution::Resolved(RecordDocument {
            id: local.id.clone(),
            entity_type: local.entity_type.clone(),
            version: local.version.max(theirs.version) + 1,
            ..resolved
        })
    }

    fn merge(&self, local: &RecordDocument, remote: &RecordDocument) -> Option<RecordDocument> {
        let Some(merger) = self.mergers.get(&local.entity_type) else {
            warn!(
                "No merge rules for '{}'; conflict on '{}' left for manual resolution",
                local.entity_type, local.id
            );
            return None;
        };

        match catch_unwind(AssertUnwindSafe(|| merger.merge(local, remote))) {
            Ok(Ok(doc)) => Some(doc),
            Ok(Err(e)) => {
                warn!("Merge of '{}' failed, falling back to manual: {}", local.id, e);
                None
            }
            Err(_) => {
                warn!("Merge of '{}' panicked, falling back to manual", local.id);
                None
            }
        }
    }
}

/// Field-by-field: the side with the newer modification time wins each
/// field, ties going to local. A delete/edit divergence is settled as a whole
/// by each side's most recent modification.
fn latest_timestamp(local: &RecordDocument, remote: &RecordDocument) -> RecordDocument {
    if local.deleted != remote.deleted {
        return if local.last_modified() >= remote.last_modified() {
            local.clone()
        } else {
            remote.clone()
        };
    }

    let mut resolved = local.clone();
    let names: BTreeSet<&String> = local
        .fields
        .keys()
        .chain(local.modified.keys())
        .chain(remote.fields.keys())
        .chain(remote.modified.keys())
        .collect();

    for name in names {
        let local_ts = local.modified_at(name).unwrap_or(i64::MIN);
        let remote_ts = remote.modified_at(name).unwrap_or(i64::MIN);
        if local_ts >= remote_ts {
            continue;
        }
        match remote.fields.get(name) {
            Some(value) => resolved.fields.insert(name.clone(), value.clone()),
            None => resolved.fields.remove(name),
        };
        if let Some(ts) = remote.modified_at(name) {
            resolved.modified.insert(name.clone(), ts);
        }
    }
    resolved
}
