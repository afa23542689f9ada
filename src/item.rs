//! The in-memory representation of an annotation record: its id, its payload
//! document, the labels already received, an optional invalidation record,
//! and the set of annotators currently holding it (`spec.md` §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ItemParseError {
    #[error("annotation record missing required field '{0}'")]
    MissingField(&'static str),
    #[error("malformed field '{field}': {source}")]
    Malformed {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The closed set of label values a store document may carry (`spec.md` §6).
/// `Yes`/`No` are valid and count toward `validCount`; `Skip` is recorded but
/// never counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelValue {
    Yes,
    No,
    Skip,
}

impl LabelValue {
    pub fn is_valid(self) -> bool {
        matches!(self, LabelValue::Yes | LabelValue::No)
    }
}

/// One annotator's recorded judgment on an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    #[serde(rename = "annotatorId")]
    pub annotator_id: String,
    pub annotation: LabelValue,
    pub time: DateTime<Utc>,
}

/// Marks an item dead: never to be shown again, to anyone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invalidation {
    #[serde(rename = "annotatorId")]
    pub annotator_id: String,
    pub cause: String,
    pub time: DateTime<Utc>,
}

/// Optional per-item descriptor used to display what the annotator is judging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub name: Option<String>,
    #[serde(default)]
    pub terms: Vec<String>,
    pub description: Option<String>,
}

/// Annotator record, store-only. The dispatcher reads it to lazily create a
/// placeholder on first sight of an id (demo CLI convenience) but never
/// mutates it otherwise — `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotator {
    pub email: Option<String>,
    pub signup: DateTime<Utc>,
    #[serde(rename = "lastLogin")]
    pub last_login: Option<DateTime<Utc>>,
}

/// The in-memory annotation item. `holders` is strictly in-memory (§4.2): it
/// is never serialized, and its presence for an annotator must always agree
/// bidirectionally with the dispatcher's holding table (invariant I2).
#[derive(Debug, Clone)]
pub struct Item {
    pub id: String,
    pub task_name: String,
    pub doc_id: String,
    pub doc: Value,
    pub context: Option<Context>,
    pub created: String,
    pub labels: HashMap<String, Label>,
    pub valid_count: u32,
    pub invalid: Option<Invalidation>,
    pub holders: HashMap<String, DateTime<Utc>>,
}

impl Item {
    /// Build an `Item` from a store record (`spec.md` §6 document shape).
    pub fn from_record(id: String, record: &Value) -> Result<Self, ItemParseError> {
        let task_name = record
            .get("name")
            .and_then(Value::as_str)
            .ok_or(ItemParseError::MissingField("name"))?
            .to_string();
        let doc_id = record
            .get("docId")
            .and_then(Value::as_str)
            .ok_or(ItemParseError::MissingField("docId"))?
            .to_string();
        let doc = record.get("doc").cloned().unwrap_or(Value::Null);
        let created = record
            .get("created")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let context = match record.get("context") {
            Some(v) if !v.is_null() => Some(serde_json::from_value(v.clone()).map_err(|e| {
                ItemParseError::Malformed {
                    field: "context",
                    source: e,
                }
            })?),
            _ => None,
        };

        let mut labels = HashMap::new();
        if let Some(arr) = record.get("annotations").and_then(Value::as_array) {
            for raw in arr {
                let label: Label = serde_json::from_value(raw.clone()).map_err(|e| {
                    ItemParseError::Malformed {
                        field: "annotations",
                        source: e,
                    }
                })?;
                labels.insert(label.annotator_id.clone(), label);
            }
        }

        let valid_count = record
            .get("numValidAnnotations")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or_else(|| labels.values().filter(|l| l.annotation.is_valid()).count() as u32);

        let invalid = match record.get("invalid") {
            Some(v) if !v.is_null() => Some(serde_json::from_value(v.clone()).map_err(|e| {
                ItemParseError::Malformed {
                    field: "invalid",
                    source: e,
                }
            })?),
            _ => None,
        };

        Ok(Item {
            id,
            task_name,
            doc_id,
            doc,
            context,
            created,
            labels,
            valid_count,
            invalid,
            holders: HashMap::new(),
        })
    }

    /// The fields the dispatcher is authoritative over: `validCount`, `labels`
    /// (flattened to an ordered sequence), and `invalid` when set (`spec.md`
    /// §4.2). `holders` never appears here.
    pub fn to_persistable_patch(&self) -> Value {
        let mut labels: Vec<&Label> = self.labels.values().collect();
        labels.sort_by(|a, b| a.time.cmp(&b.time));
        let mut patch = json!({
            "numValidAnnotations": self.valid_count,
            "annotations": labels,
        });
        if let Some(invalid) = &self.invalid {
            patch["invalid"] = json!(invalid);
        }
        patch
    }

    /// Used by the allocation rule: has this annotator already labeled (or
    /// skipped) this item?
    pub fn has_label_from(&self, annotator_id: &str) -> bool {
        self.labels.contains_key(annotator_id)
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.is_some()
    }

    /// True once `validCount` has reached the required replication factor.
    pub fn is_complete(&self, required: u32) -> bool {
        self.valid_count >= required
    }

    /// Record a label. Increments `valid_count` iff the label value is valid
    /// (`yes`/`no`); `skip` is recorded (so `has_label_from` still excludes
    /// the annotator from future allocation) but never counted.
    pub fn record_label(&mut self, annotator_id: String, value: LabelValue, now: DateTime<Utc>) {
        if value.is_valid() {
            self.valid_count += 1;
        }
        self.labels.insert(
            annotator_id.clone(),
            Label {
                annotator_id,
                annotation: value,
                time: now,
            },
        );
    }

    pub fn invalidate(&mut self, annotator_id: String, cause: String, now: DateTime<Utc>) {
        self.invalid = Some(Invalidation {
            annotator_id,
            cause,
            time: now,
        });
    }

    #[cfg(test)]
    pub fn fixture(id: &str, task_name: &str, doc_id: &str) -> Self {
        Item {
            id: id.to_string(),
            task_name: task_name.to_string(),
            doc_id: doc_id.to_string(),
            doc: json!({}),
            context: None,
            created: Utc::now().to_rfc3339(),
            labels: HashMap::new(),
            valid_count: 0,
            invalid: None,
            holders: HashMap::new(),
        }
    }
}
