//! Entity-specific merge logic for the `merge` conflict strategy.
//!
//! The core never defines domain rules itself. Applications register an
//! [`EntityMerger`] per entity type, either hand-written or built from
//! [`FieldRulesMerger`] building blocks.

use crate::store::RecordDocument;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("cannot merge field '{field}': {reason}")]
    Field { field: String, reason: String },

    #[error("cannot merge: {0}")]
    Other(String),
}

/// Combines a local and remote copy of one record into a single document.
///
/// The returned document's `version` is overwritten by the caller.
pub trait EntityMerger: Send + Sync {
    fn merge(&self, local: &RecordDocument, remote: &RecordDocument)
        -> Result<RecordDocument, MergeError>;
}

/// Mergers keyed by entity type.
#[derive(Clone, Default)]
pub struct MergeRegistry {
    mergers: HashMap<String, Arc<dyn EntityMerger>>,
}

impl MergeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: impl Into<String>, merger: Arc<dyn EntityMerger>) {
        self.mergers.insert(entity_type.into(), merger);
    }

    pub fn with(mut self, entity_type: impl Into<String>, merger: Arc<dyn EntityMerger>) -> Self {
        self.register(entity_type, merger);
        self
    }

    pub fn get(&self, entity_type: &str) -> Option<&Arc<dyn EntityMerger>> {
        self.mergers.get(entity_type)
    }
}

impl std::fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entities: Vec<&String> = self.mergers.keys().collect();
        entities.sort();
        f.debug_struct("MergeRegistry")
            .field("entities", &entities)
            .finish()
    }
}

/// How one field is combined when both sides changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    PreferLocal,
    PreferRemote,
    /// The side with the newer modification time wins; ties go to local.
    LatestTimestamp,
    /// A non-empty value beats an empty or missing one; two non-empty values
    /// fall back to `LatestTimestamp`.
    PreferNonEmpty,
    /// Local list items followed by remote items not already present.
    UnionList,
    /// Both texts joined in modification order, oldest first.
    Concatenate { separator: String },
}

/// Field-by-field merger driven by per-field [`FieldRule`]s.
#[derive(Debug, Clone)]
pub struct FieldRulesMerger {
    rules: HashMap<String, FieldRule>,
    fallback: FieldRule,
}

impl Default for FieldRulesMerger {
    fn default() -> Self {
        Self {
            rules: HashMap::new(),
            fallback: FieldRule::LatestTimestamp,
        }
    }
}

impl FieldRulesMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.rules.insert(field.into(), rule);
        self
    }

    /// Rule for fields without an explicit one. Defaults to `LatestTimestamp`.
    pub fn fallback(mut self, rule: FieldRule) -> Self {
        self.fallback = rule;
        self
    }

    fn rule_for(&self, field: &str) -> &FieldRule {
        self.rules.get(field).unwrap_or(&self.fallback)
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// Local wins unless remote is strictly newer.
fn local_is_newer(local_ts: Option<i64>, remote_ts: Option<i64>) -> bool {
    local_ts.unwrap_or(i64::MIN) >= remote_ts.unwrap_or(i64::MIN)
}

fn as_list(field: &str, value: Option<&Value>) -> Result<Vec<Value>, MergeError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(MergeError::Field {
            field: field.to_string(),
            reason: "expected a list".to_string(),
        }),
    }
}

fn as_text<'a>(field: &str, value: Option<&'a Value>) -> Result<&'a str, MergeError> {
    match value {
        None | Some(Value::Null) => Ok(""),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(MergeError::Field {
            field: field.to_string(),
            reason: "expected text".to_string(),
        }),
    }
}

impl FieldRulesMerger {
    fn merge_field(
        &self,
        field: &str,
        local: &RecordDocument,
        remote: &RecordDocument,
    ) -> Result<Option<Value>, MergeError> {
        let l = local.fields.get(field);
        let r = remote.fields.get(field);
        let lt = local.modified_at(field);
        let rt = remote.modified_at(field);

        let latest = || if local_is_newer(lt, rt) { l } else { r };

        let merged = match self.rule_for(field) {
            FieldRule::PreferLocal => l.or(r).cloned(),
            FieldRule::PreferRemote => r.or(l).cloned(),
            FieldRule::LatestTimestamp => latest().cloned(),
            FieldRule::PreferNonEmpty => match (is_empty(l), is_empty(r)) {
                (false, true) => l.cloned(),
                (true, false) => r.cloned(),
                _ => latest().cloned(),
            },
            FieldRule::UnionList => {
                let mut items = as_list(field, l)?;
                for item in as_list(field, r)? {
                    if !items.contains(&item) {
                        items.push(item);
                    }
                }
                Some(Value::Array(items))
            }
            FieldRule::Concatenate { separator } => {
                let lt_text = as_text(field, l)?;
                let rt_text = as_text(field, r)?;
                let text = if lt_text.is_empty() || holds_segments(rt_text, lt_text, separator) {
                    rt_text.to_string()
                } else if rt_text.is_empty() || holds_segments(lt_text, rt_text, separator) {
                    lt_text.to_string()
                } else if local_is_newer(lt, rt) && lt != rt {
                    format!("{}{}{}", rt_text, separator, lt_text)
                } else {
                    format!("{}{}{}", lt_text, separator, rt_text)
                };
                Some(Value::String(text))
            }
        };
        Ok(merged)
    }
}

/// True when `part` appears in `text` as whole `separator`-delimited segments.
fn holds_segments(text: &str, part: &str, separator: &str) -> bool {
    if text == part {
        return true;
    }
    if separator.is_empty() {
        return false;
    }
    text.starts_with(&format!("{}{}", part, separator))
        || text.ends_with(&format!("{}{}", separator, part))
        || text.contains(&format!("{}{}{}", separator, part, separator))
}

impl EntityMerger for FieldRulesMerger {
    fn merge(
        &self,
        local: &RecordDocument,
        remote: &RecordDocument,
    ) -> Result<RecordDocument, MergeError> {
        if local.deleted != remote.deleted {
            return Err(MergeError::Other(
                "one side deleted the record while the other edited it".to_string(),
            ));
        }

        let mut merged = local.clone();
        merged.fields.clear();
        merged.modified.clear();

        let names: BTreeSet<&String> = local
            .fields
            .keys()
            .chain(local.modified.keys())
            .chain(remote.fields.keys())
            .chain(remote.modified.keys())
            .collect();

        for name in names {
            let value = if local.fields.get(name) == remote.fields.get(name) {
                local.fields.get(name).cloned()
            } else {
                self.merge_field(name, local, remote)?
            };
            let stamp = local.modified_at(name).max(remote.modified_at(name));

            if let Some(value) = value {
                merged.fields.insert(name.clone(), value);
            }
            if let Some(stamp) = stamp {
                merged.modified.insert(name.clone(), stamp);
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(pairs: &[(&str, Value, i64)]) -> RecordDocument {
        let mut doc = RecordDocument::new("r1", "journal");
        for (field, value, at) in pairs {
            doc.set(*field, value.clone(), *at);
        }
        doc
    }

    #[test]
    fn concatenates_notes_oldest_first() {
        let merger = FieldRulesMerger::new().rule(
            "notes",
            FieldRule::Concatenate {
                separator: "\n".to_string(),
            },
        );
        let local = doc(&[("notes", json!("took meds"), 200)]);
        let remote = doc(&[("notes", json!("headache"), 100)]);

        let merged = merger.merge(&local, &remote).unwrap();
        assert_eq!(merged.fields["notes"], json!("headache\ntook meds"));
        assert_eq!(merged.modified_at("notes"), Some(200));

        // same inputs, same output
        assert_eq!(merger.merge(&local, &remote).unwrap(), merged);
    }

    #[test]
    fn concatenate_does_not_duplicate_contained_text() {
        let merger = FieldRulesMerger::new().rule(
            "notes",
            FieldRule::Concatenate {
                separator: "; ".to_string(),
            },
        );
        let local = doc(&[("notes", json!("a; b"), 2)]);
        let remote = doc(&[("notes", json!("a"), 1)]);
        assert_eq!(merger.merge(&local, &remote).unwrap().fields["notes"], json!("a; b"));
    }

    #[test]
    fn concatenate_keeps_text_that_is_only_a_substring() {
        let merger = FieldRulesMerger::new().rule(
            "notes",
            FieldRule::Concatenate {
                separator: "\n".to_string(),
            },
        );
        let local = doc(&[("notes", json!("ok"), 1)]);
        let remote = doc(&[("notes", json!("not ok"), 2)]);
        assert_eq!(
            merger.merge(&local, &remote).unwrap().fields["notes"],
            json!("ok\nnot ok")
        );

        let local = doc(&[("notes", json!("pain"), 3)]);
        let remote = doc(&[("notes", json!("back pain\nslept"), 1)]);
        assert_eq!(
            merger.merge(&local, &remote).unwrap().fields["notes"],
            json!("back pain\nslept\npain")
        );
    }

    #[test]
    fn union_lists_and_prefer_non_empty() {
        let merger = FieldRulesMerger::new()
            .rule("tags", FieldRule::UnionList)
            .rule("title", FieldRule::PreferNonEmpty);
        let local = doc(&[("tags", json!(["a", "b"]), 5), ("title", json!(""), 9)]);
        let remote = doc(&[("tags", json!(["b", "c"]), 6), ("title", json!("Flare"), 1)]);

        let merged = merger.merge(&local, &remote).unwrap();
        assert_eq!(merged.fields["tags"], json!(["a", "b", "c"]));
        assert_eq!(merged.fields["title"], json!("Flare"));
    }

    #[test]
    fn fallback_is_latest_timestamp_with_local_ties() {
        let merger = FieldRulesMerger::new();
        let local = doc(&[("mood", json!(2), 10), ("sleep", json!(6), 10)]);
        let remote = doc(&[("mood", json!(4), 20), ("sleep", json!(8), 10)]);

        let merged = merger.merge(&local, &remote).unwrap();
        assert_eq!(merged.fields["mood"], json!(4));
        assert_eq!(merged.fields["sleep"], json!(6));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let merger = FieldRulesMerger::new().rule("tags", FieldRule::UnionList);
        let local = doc(&[("tags", json!("oops"), 1)]);
        let remote = doc(&[("tags", json!(["x"]), 2)]);
        assert!(matches!(
            merger.merge(&local, &remote),
            Err(MergeError::Field { .. })
        ));
    }

    #[test]
    fn delete_versus_edit_is_not_merged() {
        let merger = FieldRulesMerger::new();
        let mut local = doc(&[]);
        local.deleted = true;
        let remote = doc(&[("mood", json!(1), 1)]);
        assert!(merger.merge(&local, &remote).is_err());
    }
}
