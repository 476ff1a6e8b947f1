use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use timesift_core::datastore::{self, Datastore, HitStream, LabelRequest, SearchRequest};
use timesift_core::errors::DatastoreError;
use timesift_core::queue::MutationQueue;

use crate::query::{self, QueryMatcher, DATETIME_FIELD};

/// One call made against an [`InMemoryDatastore`], in order.
#[derive(Clone, Debug, PartialEq)]
pub enum DatastoreCall {
    Refresh(String),
    Search(SearchRequest),
    Import { index: String, event_id: String },
    SetLabel(LabelRequest),
    Flush { documents: usize },
}

#[derive(Clone, Debug)]
struct StoredDocument {
    event_type: String,
    source: Map<String, Value>,
}

type Index = BTreeMap<String, StoredDocument>;

#[derive(Default)]
struct Indices {
    /// Current state, what a realtime document GET sees.
    live: BTreeMap<String, Index>,
    /// State as of each index's last refresh, what searches see.
    searchable: BTreeMap<String, Index>,
}

/// Deterministic in-process backend.
///
/// Mirrors the near-real-time behavior of a search cluster: writes land in
/// the live documents immediately after a flush but only become searchable
/// after `refresh`. Every trait call is recorded for assertions.
#[derive(Default)]
pub struct InMemoryDatastore {
    indices: Mutex<Indices>,
    queue: MutationQueue,
    calls: Mutex<Vec<DatastoreCall>>,
    flush_interval: Option<usize>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flush automatically once `interval` documents are pending.
    pub fn with_flush_interval(interval: usize) -> Self {
        Self {
            flush_interval: Some(interval),
            ..Self::default()
        }
    }

    /// Create an empty index if it does not exist yet.
    pub fn create_index(&self, index: &str) {
        self.indices.lock().live.entry(index.to_string()).or_default();
    }

    /// Create or replace a document. It is searchable after the next refresh.
    pub fn insert_document(
        &self,
        index: &str,
        event_type: &str,
        event_id: &str,
        source: Map<String, Value>,
    ) {
        self.indices
            .lock()
            .live
            .entry(index.to_string())
            .or_default()
            .insert(
                event_id.to_string(),
                StoredDocument {
                    event_type: event_type.to_string(),
                    source,
                },
            );
    }

    /// Live body of a document, including flushed but unrefreshed writes.
    pub fn document(&self, index: &str, event_id: &str) -> Option<Map<String, Value>> {
        self.indices
            .lock()
            .live
            .get(index)
            .and_then(|docs| docs.get(event_id))
            .map(|doc| doc.source.clone())
    }

    pub fn calls(&self) -> Vec<DatastoreCall> {
        self.calls.lock().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.count_calls(|call| matches!(call, DatastoreCall::Flush { .. }))
    }

    pub fn refresh_count(&self) -> usize {
        self.count_calls(|call| matches!(call, DatastoreCall::Refresh(_)))
    }

    /// Documents waiting in the mutation queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn count_calls(&self, predicate: impl Fn(&DatastoreCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: DatastoreCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn refresh(&self, index: &str) -> Result<(), DatastoreError> {
        self.record(DatastoreCall::Refresh(index.to_string()));
        let mut indices = self.indices.lock();
        let snapshot = indices
            .live
            .get(index)
            .cloned()
            .ok_or_else(|| DatastoreError::IndexNotFound(index.to_string()))?;
        indices.searchable.insert(index.to_string(), snapshot);
        Ok(())
    }

    #[instrument(skip(self, request), fields(indices = ?request.indices))]
    async fn search_stream(&self, request: &SearchRequest) -> Result<HitStream, DatastoreError> {
        self.record(DatastoreCall::Search(request.clone()));
        let matcher = QueryMatcher::parse(&request.query_string);
        let (start, end) = query::time_range(&request.query_filter);

        let indices = self.indices.lock();
        let mut hits: Vec<Result<Value, DatastoreError>> = Vec::new();
        for index in &request.indices {
            if !indices.live.contains_key(index) {
                return Err(DatastoreError::IndexNotFound(index.clone()));
            }
            let Some(docs) = indices.searchable.get(index) else {
                continue;
            };
            for (event_id, doc) in docs {
                if !matcher.matches(&doc.source) || !in_time_range(&doc.source, start, end) {
                    continue;
                }
                hits.push(Ok(hit(index, event_id, doc, &request.return_fields)));
            }
        }
        debug!(hits = hits.len(), "search complete");
        Ok(Box::pin(stream::iter(hits)))
    }

    async fn import_event(
        &self,
        index: &str,
        event_type: &str,
        event_id: &str,
        event: Map<String, Value>,
    ) -> Result<(), DatastoreError> {
        self.record(DatastoreCall::Import {
            index: index.to_string(),
            event_id: event_id.to_string(),
        });
        let pending = self.queue.enqueue(index, event_type, event_id, event);
        if self.flush_interval.is_some_and(|interval| pending >= interval) {
            self.flush_queued_events().await?;
        }
        Ok(())
    }

    async fn set_label(&self, request: &LabelRequest) -> Result<Map<String, Value>, DatastoreError> {
        self.record(DatastoreCall::SetLabel(request.clone()));
        let stored = self.document(&request.index, &request.event_id).ok_or_else(|| {
            DatastoreError::DocumentNotFound {
                index: request.index.clone(),
                event_id: request.event_id.clone(),
            }
        })?;

        let update = datastore::resolve_label_update(&self.queue, &stored, request)?;
        if request.single_update {
            let mut indices = self.indices.lock();
            if let Some(doc) = indices
                .live
                .get_mut(&request.index)
                .and_then(|docs| docs.get_mut(&request.event_id))
            {
                doc.source.extend(update.clone());
            }
        }
        Ok(update)
    }

    async fn flush_queued_events(&self) -> Result<(), DatastoreError> {
        let updates = self.queue.drain();
        self.record(DatastoreCall::Flush {
            documents: updates.len(),
        });

        let total = updates.len();
        let mut failed = 0;
        let mut indices = self.indices.lock();
        for update in updates {
            match indices
                .live
                .get_mut(&update.index)
                .and_then(|docs| docs.get_mut(&update.event_id))
            {
                Some(doc) => doc.source.extend(update.fields),
                None => failed += 1,
            }
        }
        if failed > 0 {
            return Err(DatastoreError::BulkRejected { failed, total });
        }
        Ok(())
    }
}

fn in_time_range(source: &Map<String, Value>, start: Option<&str>, end: Option<&str>) -> bool {
    if start.is_none() && end.is_none() {
        return true;
    }
    let Some(datetime) = source.get(DATETIME_FIELD).and_then(Value::as_str) else {
        return false;
    };
    start.map_or(true, |s| datetime >= s) && end.map_or(true, |e| datetime <= e)
}

fn hit(index: &str, event_id: &str, doc: &StoredDocument, return_fields: &[String]) -> Value {
    let source: Map<String, Value> = if return_fields.iter().any(|f| f == "*") {
        doc.source.clone()
    } else {
        return_fields
            .iter()
            .filter_map(|field| doc.source.get(field).map(|v| (field.clone(), v.clone())))
            .collect()
    };
    serde_json::json!({
        "_id": event_id,
        "_type": doc.event_type,
        "_index": index,
        "_source": source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use timesift_core::ids::{SketchId, SYSTEM_USER};

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn collect(store: &InMemoryDatastore, request: &SearchRequest) -> Vec<Value> {
        store
            .search_stream(request)
            .await
            .unwrap()
            .map(|hit| hit.unwrap())
            .collect()
            .await
    }

    fn seeded() -> InMemoryDatastore {
        let store = InMemoryDatastore::new();
        store.insert_document("ts_a", "generic_event", "1", fields(json!({"message": "login ok", "user": "ann"})));
        store.insert_document("ts_a", "generic_event", "2", fields(json!({"message": "logout", "user": "bob"})));
        store
    }

    fn label_request(event_id: &str, single_update: bool) -> LabelRequest {
        LabelRequest {
            index: "ts_a".into(),
            event_id: event_id.into(),
            event_type: "generic_event".into(),
            sketch_id: SketchId::from_raw(1),
            user_id: SYSTEM_USER,
            label: "__ts_star".into(),
            toggle: false,
            single_update,
        }
    }

    #[tokio::test]
    async fn documents_are_searchable_only_after_refresh() {
        let store = seeded();
        let request = SearchRequest::new("*", vec!["ts_a".into()]);
        assert!(collect(&store, &request).await.is_empty());

        store.refresh("ts_a").await.unwrap();
        let hits = collect(&store, &request).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["_type"], "generic_event");
        assert_eq!(hits[0]["_index"], "ts_a");
    }

    #[tokio::test]
    async fn hits_project_return_fields() {
        let store = seeded();
        store.refresh("ts_a").await.unwrap();

        let hits = collect(&store, &SearchRequest::new("user:ann", vec!["ts_a".into()])).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["_source"], json!({"message": "login ok"}));

        let mut request = SearchRequest::new("user:ann", vec!["ts_a".into()]);
        request.return_fields = vec!["*".into()];
        let hits = collect(&store, &request).await;
        assert_eq!(hits[0]["_source"]["user"], "ann");
    }

    #[tokio::test]
    async fn time_range_filters_hits() {
        let store = InMemoryDatastore::new();
        store.insert_document("ts_a", "e", "old", fields(json!({"datetime": "2023-01-01T00:00:00"})));
        store.insert_document("ts_a", "e", "new", fields(json!({"datetime": "2024-06-01T00:00:00"})));
        store.refresh("ts_a").await.unwrap();

        let mut request = SearchRequest::new("*", vec!["ts_a".into()]);
        request.query_filter = fields(json!({"time_start": "2024-01-01T00:00:00"}));
        let hits = collect(&store, &request).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["_id"], "new");
    }

    #[tokio::test]
    async fn empty_index_can_be_searched() {
        let store = InMemoryDatastore::new();
        store.create_index("ts_empty");
        store.refresh("ts_empty").await.unwrap();
        assert!(collect(&store, &SearchRequest::new("*", vec!["ts_empty".into()])).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_index_fails() {
        let store = seeded();
        assert!(matches!(
            store.refresh("ts_missing").await,
            Err(DatastoreError::IndexNotFound(_))
        ));
        let result = store.search_stream(&SearchRequest::new("*", vec!["ts_missing".into()])).await;
        assert!(matches!(result, Err(DatastoreError::IndexNotFound(_))));
    }

    #[tokio::test]
    async fn flush_applies_queued_updates() {
        let store = seeded();
        store
            .import_event("ts_a", "generic_event", "1", fields(json!({"domain": "example.com"})))
            .await
            .unwrap();
        assert_eq!(store.pending(), 1);
        assert!(store.document("ts_a", "1").unwrap().get("domain").is_none());

        store.flush_queued_events().await.unwrap();
        assert_eq!(store.pending(), 0);
        assert_eq!(store.document("ts_a", "1").unwrap()["domain"], "example.com");
        assert_eq!(store.flush_count(), 1);
    }

    #[tokio::test]
    async fn flush_interval_triggers_automatic_flush() {
        let store = InMemoryDatastore::with_flush_interval(2);
        store.insert_document("ts_a", "e", "1", Map::new());
        store.insert_document("ts_a", "e", "2", Map::new());

        store.import_event("ts_a", "e", "1", fields(json!({"x": 1}))).await.unwrap();
        assert_eq!(store.flush_count(), 0);
        store.import_event("ts_a", "e", "2", fields(json!({"x": 2}))).await.unwrap();
        assert_eq!(store.flush_count(), 1);
        assert_eq!(store.document("ts_a", "2").unwrap()["x"], 2);
    }

    #[tokio::test]
    async fn flush_reports_missing_documents() {
        let store = seeded();
        store.import_event("ts_a", "e", "ghost", fields(json!({"x": 1}))).await.unwrap();
        store.import_event("ts_a", "e", "1", fields(json!({"x": 1}))).await.unwrap();
        let err = store.flush_queued_events().await.unwrap_err();
        assert!(matches!(err, DatastoreError::BulkRejected { failed: 1, total: 2 }));
        assert_eq!(store.document("ts_a", "1").unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn set_label_single_update_writes_through() {
        let store = seeded();
        let update = store.set_label(&label_request("1", true)).await.unwrap();
        assert_eq!(
            update["timesketch_label"],
            json!([{"name": "__ts_star", "user_id": 0, "sketch_id": 1}])
        );
        assert_eq!(store.document("ts_a", "1").unwrap()["timesketch_label"], update["timesketch_label"]);
        assert_eq!(store.pending(), 0);
    }

    #[tokio::test]
    async fn set_label_without_single_update_leaves_document() {
        let store = seeded();
        store.set_label(&label_request("1", false)).await.unwrap();
        assert!(store.document("ts_a", "1").unwrap().get("timesketch_label").is_none());
    }

    #[tokio::test]
    async fn set_label_on_missing_document_fails() {
        let store = seeded();
        let err = store.set_label(&label_request("nope", false)).await.unwrap_err();
        assert!(matches!(err, DatastoreError::DocumentNotFound { .. }));
    }

    #[tokio::test]
    async fn calls_are_recorded_in_order() {
        let store = seeded();
        store.refresh("ts_a").await.unwrap();
        store.import_event("ts_a", "e", "1", Map::new()).await.unwrap();
        store.flush_queued_events().await.unwrap();
        assert_eq!(
            store.calls(),
            vec![
                DatastoreCall::Refresh("ts_a".into()),
                DatastoreCall::Import { index: "ts_a".into(), event_id: "1".into() },
                DatastoreCall::Flush { documents: 1 },
            ]
        );
        assert_eq!(store.refresh_count(), 1);
    }
}
