//! Core domain model for Héra field backfills.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "hera-core";

/// Separator used when several labels are flattened into one display string.
pub const LIST_SEPARATOR: &str = "; ";

pub const LOCATION_LABEL_KEYS: [&str; 3] = ["text", "label", "name"];
pub const URL_LABEL_KEYS: [&str; 3] = ["href", "url", "link"];

/// Persisted resume point for a backfill.
///
/// `last_key` is the largest identifier of the most recently completed page.
/// Counters are cumulative across every run that contributed to the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRecord {
    pub last_key: String,
    pub round: u64,
    pub total_updated: u64,
    pub total_skipped: u64,
    pub last_updated_at: DateTime<Utc>,
}

/// Names of the three fields a backfill touches on each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub id_field: String,
    pub source_field: String,
    pub target_field: String,
}

impl FieldLayout {
    pub fn new(
        id_field: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            id_field: id_field.into(),
            source_field: source_field.into(),
            target_field: target_field.into(),
        }
    }
}

/// Source field value, normalized at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceValue {
    Text(String),
    List(Vec<ListEntry>),
    Unusable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    Text(String),
    /// Structured element; only string-valued sub-fields are kept.
    Record(BTreeMap<String, String>),
    Other,
}

impl SourceValue {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::String(text) => Self::Text(text.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(ListEntry::from_json).collect()),
            _ => Self::Unusable,
        }
    }
}

impl ListEntry {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::String(text) => Self::Text(text.clone()),
            JsonValue::Object(map) => Self::Record(
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect(),
            ),
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document is not an object")]
    NotAnObject,
    #[error("document has no usable `{field}` identifier")]
    MissingIdentifier { field: String },
}

/// Projection of a stored document onto a backfill's field layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub id: String,
    pub source: SourceValue,
    /// Current target value; non-string values read as absent.
    pub target: Option<String>,
}

impl SourceDocument {
    pub fn from_json(value: &JsonValue, layout: &FieldLayout) -> Result<Self, DocumentError> {
        let object = value.as_object().ok_or(DocumentError::NotAnObject)?;
        let id = object
            .get(&layout.id_field)
            .and_then(JsonValue::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DocumentError::MissingIdentifier {
                field: layout.id_field.clone(),
            })?;
        let source = object
            .get(&layout.source_field)
            .map(SourceValue::from_json)
            .unwrap_or(SourceValue::Unusable);
        let target = object
            .get(&layout.target_field)
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        Ok(Self {
            id: id.to_string(),
            source,
            target,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationKind {
    /// Flatten every usable entry into one `"; "`-joined display string.
    JoinLabels,
    /// Keep only the first usable entry.
    FirstNonEmpty,
}

impl DerivationKind {
    pub fn default_label_keys(self) -> Vec<String> {
        let keys: &[&str] = match self {
            Self::JoinLabels => &LOCATION_LABEL_KEYS,
            Self::FirstNonEmpty => &URL_LABEL_KEYS,
        };
        keys.iter().map(|k| k.to_string()).collect()
    }
}

/// Pure transform from a source value to the derived target value.
///
/// Both kinds are idempotent: feeding a derived value back in as a plain
/// string yields the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub kind: DerivationKind,
    /// Candidate sub-fields for structured list entries, in preference order.
    pub label_keys: Vec<String>,
}

impl Derivation {
    pub fn new(kind: DerivationKind) -> Self {
        Self {
            kind,
            label_keys: kind.default_label_keys(),
        }
    }

    pub fn join_labels() -> Self {
        Self::new(DerivationKind::JoinLabels)
    }

    pub fn first_non_empty() -> Self {
        Self::new(DerivationKind::FirstNonEmpty)
    }

    pub fn with_label_keys(mut self, label_keys: Vec<String>) -> Self {
        self.label_keys = label_keys;
        self
    }

    pub fn derive(&self, source: &SourceValue) -> Option<String> {
        match source {
            SourceValue::List(entries) if !entries.is_empty() => {
                let mut labels = entries.iter().filter_map(|entry| self.entry_label(entry));
                match self.kind {
                    DerivationKind::JoinLabels => {
                        let labels = labels.collect::<Vec<_>>();
                        (!labels.is_empty()).then(|| labels.join(LIST_SEPARATOR))
                    }
                    DerivationKind::FirstNonEmpty => labels.next(),
                }
            }
            SourceValue::Text(text) => non_empty_trimmed(text),
            SourceValue::List(_) | SourceValue::Unusable => None,
        }
    }

    fn entry_label(&self, entry: &ListEntry) -> Option<String> {
        match entry {
            ListEntry::Text(text) => non_empty_trimmed(text),
            ListEntry::Record(fields) => self
                .label_keys
                .iter()
                .filter_map(|key| fields.get(key))
                .find_map(|value| non_empty_trimmed(value)),
            ListEntry::Other => None,
        }
    }
}

fn non_empty_trimmed(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// One pending `$set` of the target field, keyed by identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Uncomputable,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Update(WorkItem),
    Skip(SkipReason),
}

pub fn decide(doc: &SourceDocument, derivation: &Derivation) -> Decision {
    match derivation.derive(&doc.source) {
        None => Decision::Skip(SkipReason::Uncomputable),
        Some(value) if doc.target.as_deref() == Some(value.as_str()) => {
            Decision::Skip(SkipReason::Unchanged)
        }
        Some(value) => Decision::Update(WorkItem {
            id: doc.id.clone(),
            value,
        }),
    }
}

/// Transform-stage output for a single page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagePlan {
    pub updates: Vec<WorkItem>,
    pub skipped_uncomputable: u64,
    pub skipped_unchanged: u64,
    /// Skipped identifiers in page order.
    pub skips: Vec<(String, SkipReason)>,
    /// Identifier of the last document in the page, whether or not it needed an update.
    pub last_key: Option<String>,
}

impl PagePlan {
    pub fn build(docs: &[SourceDocument], derivation: &Derivation) -> Self {
        let mut plan = Self {
            last_key: docs.last().map(|doc| doc.id.clone()),
            ..Self::default()
        };
        for doc in docs {
            let reason = match decide(doc, derivation) {
                Decision::Update(item) => {
                    plan.updates.push(item);
                    continue;
                }
                Decision::Skip(reason) => reason,
            };
            match reason {
                SkipReason::Uncomputable => plan.skipped_uncomputable += 1,
                SkipReason::Unchanged => plan.skipped_unchanged += 1,
            }
            plan.skips.push((doc.id.clone(), reason));
        }
        plan
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_uncomputable + self.skipped_unchanged
    }
}

/// Counters accumulated by one run, folded page by page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub rounds: u64,
    pub scanned: u64,
    pub updated: u64,
    pub skipped_uncomputable: u64,
    pub skipped_unchanged: u64,
}

impl RunTotals {
    pub fn skipped(&self) -> u64 {
        self.skipped_uncomputable + self.skipped_unchanged
    }

    pub fn record_page(&mut self, scanned: usize, plan: &PagePlan, modified: u64) {
        self.rounds += 1;
        self.scanned += scanned as u64;
        self.updated += modified;
        self.skipped_uncomputable += plan.skipped_uncomputable;
        self.skipped_unchanged += plan.skipped_unchanged;
    }
}
