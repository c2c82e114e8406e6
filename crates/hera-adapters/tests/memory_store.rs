use hera_adapters::{DocumentStore, MemoryDocumentStore, PageQuery, WriteOptions};
use hera_core::{FieldLayout, WorkItem};
use serde_json::json;

fn layout() -> FieldLayout {
    FieldLayout::new("jobId", "location", "locations")
}

fn query(after: Option<&str>, limit: usize) -> PageQuery {
    PageQuery {
        layout: layout(),
        after: after.map(str::to_string),
        limit,
    }
}

#[tokio::test]
async fn pages_come_back_in_ascending_identifier_order() {
    let store = MemoryDocumentStore::from_documents([
        json!({ "jobId": "job-3", "location": "C" }),
        json!({ "jobId": "job-1", "location": "A" }),
        json!({ "jobId": "job-2", "location": "B", "locations": "B" }),
        json!({ "jobId": "job-4", "location": "D" }),
    ]);

    let first = store.find_pending(&query(None, 2)).await.expect("first page");
    let ids = first.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, ["job-1", "job-3"]);

    let second = store
        .find_pending(&query(Some("job-3"), 2))
        .await
        .expect("second page");
    let ids = second.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, ["job-4"]);

    assert!(store
        .find_pending(&query(Some("job-4"), 2))
        .await
        .expect("tail")
        .is_empty());
}

#[tokio::test]
async fn bulk_update_counts_only_real_modifications() {
    let store = MemoryDocumentStore::from_documents([
        json!({ "jobId": "job-1", "location": "A" }),
        json!({ "jobId": "job-2", "location": "B", "locations": "B" }),
    ]);

    let outcome = store
        .bulk_update(
            &layout(),
            &[
                WorkItem { id: "job-1".into(), value: "A".into() },
                WorkItem { id: "job-2".into(), value: "B".into() },
                WorkItem { id: "job-missing".into(), value: "Z".into() },
            ],
            WriteOptions::relaxed(),
        )
        .await
        .expect("bulk update");

    assert_eq!(outcome.matched, 2);
    assert_eq!(outcome.modified, 1);
    assert_eq!(store.count_pending(&layout()).await.expect("count"), 0);
    assert_eq!(store.writes().await, vec![(3, WriteOptions::relaxed())]);
}

#[tokio::test]
async fn index_creation_is_recorded_once() {
    let store = MemoryDocumentStore::new();
    store.create_index("locations").await.expect("index");
    store.create_index("locations").await.expect("index again");
    assert_eq!(store.indexes().await, vec!["locations".to_string()]);
}

#[tokio::test]
async fn numeric_identifiers_are_left_out_of_pages_and_counts() {
    let store = MemoryDocumentStore::from_documents([
        json!({ "jobId": 7, "location": "Perth" }),
        json!({ "jobId": "job-1", "location": "A" }),
    ]);

    let page = store.find_pending(&query(None, 10)).await.expect("page");
    let ids = page.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, ["job-1"]);
    assert_eq!(store.count_pending(&layout()).await.expect("count"), 1);
}
