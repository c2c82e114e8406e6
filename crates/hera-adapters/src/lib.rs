//! Document-store contracts + MongoDB and in-memory adapters.

use async_trait::async_trait;
use futures::TryStreamExt;
use hera_core::{DocumentError, FieldLayout, SourceDocument, WorkItem};
use hera_storage::{Classify, RetryDisposition};
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR};
use mongodb::options::{Acknowledgment, UpdateOneModel, WriteConcern, WriteModel};
use mongodb::{Client, Collection, IndexModel};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "hera-adapters";

/// One page of the pending-document scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub layout: FieldLayout,
    /// Exclusive lower bound on the identifier.
    pub after: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgement {
    Primary,
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteOptions {
    pub ordered: bool,
    pub ack: Acknowledgement,
}

impl WriteOptions {
    /// Unordered, acknowledged by the primary only.
    pub fn relaxed() -> Self {
        Self {
            ordered: false,
            ack: Acknowledgement::Primary,
        }
    }
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self::relaxed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub matched: u64,
    /// Documents whose stored value actually changed.
    pub modified: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("document store rejected the request: {0}")]
    Rejected(String),
    #[error("stored document is malformed: {0}")]
    Malformed(#[from] DocumentError),
}

impl Classify for StoreError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Unavailable(_) => RetryDisposition::Retryable,
            Self::Rejected(_) | Self::Malformed(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        let transient = err.contains_label(RETRYABLE_WRITE_ERROR)
            || err.contains_label(TRANSIENT_TRANSACTION_ERROR)
            || matches!(
                *err.kind,
                ErrorKind::Io(_)
                    | ErrorKind::ServerSelection { .. }
                    | ErrorKind::ConnectionPoolCleared { .. }
            );
        if transient {
            Self::Unavailable(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}

/// Collection a backfill reads from and writes to.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn describe(&self) -> String;

    /// Pending documents with identifier above `query.after`, ascending, at most `query.limit`.
    async fn find_pending(&self, query: &PageQuery) -> Result<Vec<SourceDocument>, StoreError>;

    async fn bulk_update(
        &self,
        layout: &FieldLayout,
        updates: &[WorkItem],
        options: WriteOptions,
    ) -> Result<BulkWriteOutcome, StoreError>;

    async fn create_index(&self, field: &str) -> Result<(), StoreError>;

    async fn count_pending(&self, layout: &FieldLayout) -> Result<u64, StoreError>;
}

/// Pending predicate evaluated against a JSON document.
pub fn is_pending(document: &JsonValue, layout: &FieldLayout, after: Option<&str>) -> bool {
    let Some(object) = document.as_object() else {
        return false;
    };
    let source_present = object
        .get(&layout.source_field)
        .is_some_and(|v| !v.is_null());
    let id = match object.get(&layout.id_field).and_then(JsonValue::as_str) {
        Some(id) if !id.is_empty() => id,
        _ => return false,
    };
    let target_missing = match object.get(&layout.target_field) {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    let above_bound = after.map_or(true, |after| id > after);
    source_present && target_missing && above_bound
}

/// Same predicate as [`is_pending`], as a MongoDB filter.
pub fn pending_filter(layout: &FieldLayout, after: Option<&str>) -> Document {
    let mut id_condition = doc! { "$type": "string", "$nin": [""] };
    if let Some(after) = after {
        id_condition.insert("$gt", after);
    }

    let mut filter = Document::new();
    filter.insert(
        layout.source_field.as_str(),
        doc! { "$exists": true, "$ne": Bson::Null },
    );
    filter.insert(layout.id_field.as_str(), id_condition);
    filter.insert(
        "$or",
        vec![
            single_field(&layout.target_field, doc! { "$exists": false }),
            single_field(&layout.target_field, Bson::Null),
            single_field(&layout.target_field, ""),
        ],
    );
    filter
}

fn single_field(field: &str, value: impl Into<Bson>) -> Document {
    let mut document = Document::new();
    document.insert(field, value);
    document
}

fn write_concern(ack: Acknowledgement) -> WriteConcern {
    let w = match ack {
        Acknowledgement::Primary => Acknowledgment::Nodes(1),
        Acknowledgement::Majority => Acknowledgment::Majority,
    };
    WriteConcern::builder().w(w).build()
}

pub struct MongoDocumentStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoDocumentStore {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::from_client(client, database, collection))
    }

    pub fn from_client(client: Client, database: &str, collection: &str) -> Self {
        let collection = client.database(database).collection::<Document>(collection);
        Self { client, collection }
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    fn describe(&self) -> String {
        format!("mongodb:{}", self.collection.namespace())
    }

    async fn find_pending(&self, query: &PageQuery) -> Result<Vec<SourceDocument>, StoreError> {
        let layout = &query.layout;
        let mut projection = Document::new();
        for field in [&layout.id_field, &layout.source_field, &layout.target_field] {
            projection.insert(field.as_str(), 1);
        }
        if layout.id_field != "_id" {
            projection.insert("_id", 0);
        }

        let cursor = self
            .collection
            .find(pending_filter(layout, query.after.as_deref()))
            .sort(single_field(&layout.id_field, 1))
            .limit(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .projection(projection)
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;

        documents
            .into_iter()
            .map(|document| {
                let json = Bson::Document(document).into_relaxed_extjson();
                SourceDocument::from_json(&json, layout).map_err(|err| {
                    warn!(
                        namespace = %self.collection.namespace(),
                        error = %err,
                        "stored document does not fit the field layout"
                    );
                    StoreError::from(err)
                })
            })
            .collect()
    }

    async fn bulk_update(
        &self,
        layout: &FieldLayout,
        updates: &[WorkItem],
        options: WriteOptions,
    ) -> Result<BulkWriteOutcome, StoreError> {
        if updates.is_empty() {
            return Ok(BulkWriteOutcome::default());
        }

        let namespace = self.collection.namespace();
        let models = updates
            .iter()
            .map(|item| {
                let model = UpdateOneModel::builder()
                    .namespace(namespace.clone())
                    .filter(single_field(&layout.id_field, item.id.as_str()))
                    .update(doc! { "$set": single_field(&layout.target_field, item.value.as_str()) })
                    .build();
                WriteModel::UpdateOne(model)
            })
            .collect::<Vec<_>>();

        let result = self
            .client
            .bulk_write(models)
            .ordered(options.ordered)
            .write_concern(write_concern(options.ack))
            .await?;

        Ok(BulkWriteOutcome {
            matched: result.matched_count.max(0) as u64,
            modified: result.modified_count.max(0) as u64,
        })
    }

    async fn create_index(&self, field: &str) -> Result<(), StoreError> {
        let model = IndexModel::builder().keys(single_field(field, 1)).build();
        self.collection.create_index(model).await?;
        Ok(())
    }

    async fn count_pending(&self, layout: &FieldLayout) -> Result<u64, StoreError> {
        Ok(self
            .collection
            .count_documents(pending_filter(layout, None))
            .await?)
    }
}

/// Collection held in memory; evaluates the same predicate as the MongoDB filter.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: Vec<JsonValue>,
    indexes: Vec<String>,
    writes: Vec<(usize, WriteOptions)>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(documents: impl IntoIterator<Item = JsonValue>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                documents: documents.into_iter().collect(),
                ..MemoryState::default()
            }),
        }
    }

    pub async fn insert(&self, document: JsonValue) {
        self.state.lock().await.documents.push(document);
    }

    pub async fn documents(&self) -> Vec<JsonValue> {
        self.state.lock().await.documents.clone()
    }

    pub async fn indexes(&self) -> Vec<String> {
        self.state.lock().await.indexes.clone()
    }

    /// Size and options of every bulk write received, in order.
    pub async fn writes(&self) -> Vec<(usize, WriteOptions)> {
        self.state.lock().await.writes.clone()
    }
}

fn id_of<'a>(document: &'a JsonValue, layout: &FieldLayout) -> &'a str {
    document
        .get(&layout.id_field)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn find_pending(&self, query: &PageQuery) -> Result<Vec<SourceDocument>, StoreError> {
        let state = self.state.lock().await;
        let layout = &query.layout;
        let mut pending = state
            .documents
            .iter()
            .filter(|d| is_pending(d, layout, query.after.as_deref()))
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| id_of(a, layout).cmp(id_of(b, layout)));

        pending
            .into_iter()
            .take(query.limit)
            .map(|d| SourceDocument::from_json(d, layout).map_err(StoreError::from))
            .collect()
    }

    async fn bulk_update(
        &self,
        layout: &FieldLayout,
        updates: &[WorkItem],
        options: WriteOptions,
    ) -> Result<BulkWriteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.writes.push((updates.len(), options));

        let mut outcome = BulkWriteOutcome::default();
        for item in updates {
            let Some(object) = state
                .documents
                .iter_mut()
                .find(|d| id_of(d, layout) == item.id)
                .and_then(JsonValue::as_object_mut)
            else {
                continue;
            };
            outcome.matched += 1;
            let current = object.get(&layout.target_field).and_then(JsonValue::as_str);
            if current != Some(item.value.as_str()) {
                object.insert(
                    layout.target_field.clone(),
                    JsonValue::String(item.value.clone()),
                );
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }

    async fn create_index(&self, field: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.indexes.iter().any(|f| f == field) {
            state.indexes.push(field.to_string());
        }
        Ok(())
    }

    async fn count_pending(&self, layout: &FieldLayout) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .iter()
            .filter(|d| is_pending(d, layout, None))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layout() -> FieldLayout {
        FieldLayout::new("jobId", "location", "locations")
    }

    #[test]
    fn pending_predicate_matches_only_unset_targets() {
        let l = layout();
        assert!(is_pending(&json!({ "jobId": "a", "location": "Perth" }), &l, None));
        assert!(is_pending(
            &json!({ "jobId": "a", "location": [], "locations": null }),
            &l,
            None
        ));
        assert!(is_pending(
            &json!({ "jobId": "a", "location": "x", "locations": "" }),
            &l,
            None
        ));
        assert!(!is_pending(
            &json!({ "jobId": "a", "location": "x", "locations": "Perth" }),
            &l,
            None
        ));
        assert!(!is_pending(&json!({ "jobId": "a", "location": null }), &l, None));
        assert!(!is_pending(&json!({ "location": "x" }), &l, None));
        assert!(!is_pending(&json!({ "jobId": "", "location": "x" }), &l, None));
        assert!(!is_pending(&json!({ "jobId": "a", "location": "x" }), &l, Some("a")));
        assert!(is_pending(&json!({ "jobId": "b", "location": "x" }), &l, Some("a")));
    }

    #[test]
    fn non_string_identifiers_are_never_pending() {
        let l = layout();
        assert!(!is_pending(&json!({ "jobId": 7, "location": "Perth" }), &l, None));
        assert!(!is_pending(
            &json!({ "jobId": { "$oid": "65f0c0ffee" }, "location": "Perth" }),
            &l,
            None
        ));

        let id = pending_filter(&l, None)
            .get_document("jobId")
            .expect("id condition")
            .clone();
        assert_eq!(id, doc! { "$type": "string", "$nin": [""] });
    }

    #[test]
    fn mongo_filter_mirrors_predicate() {
        let filter = pending_filter(&layout(), Some("job-0500"));
        assert_eq!(
            filter.get_document("location").expect("source condition"),
            &doc! { "$exists": true, "$ne": Bson::Null }
        );
        let id = filter.get_document("jobId").expect("id condition");
        assert_eq!(id.get_str("$gt").expect("lower bound"), "job-0500");
        assert_eq!(id.get_str("$type").expect("type guard"), "string");
        assert_eq!(filter.get_array("$or").expect("target alternatives").len(), 3);

        let unbounded = pending_filter(&layout(), None);
        assert!(!unbounded
            .get_document("jobId")
            .expect("id condition")
            .contains_key("$gt"));
    }

    #[test]
    fn connectivity_errors_are_retryable() {
        assert_eq!(
            StoreError::Unavailable("reset".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::Rejected("bad filter".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn relaxed_writes_are_unordered_primary_acknowledged() {
        let options = WriteOptions::default();
        assert!(!options.ordered);
        assert_eq!(options.ack, Acknowledgement::Primary);
    }
}
