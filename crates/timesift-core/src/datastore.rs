use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{Map, Value};

use crate::errors::DatastoreError;
use crate::ids::{SketchId, UserId};
use crate::labels::{self, Label};
use crate::queue::MutationQueue;

/// Field returned by a search when the caller names none.
pub const DEFAULT_RETURN_FIELD: &str = "message";

/// Raw search hits: JSON objects carrying `_id`, `_type`, `_index`, `_source`.
pub type HitStream = Pin<Box<dyn Stream<Item = Result<Value, DatastoreError>> + Send>>;

/// A streaming query against one or more indices.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchRequest {
    pub query_string: String,
    pub query_filter: Map<String, Value>,
    pub indices: Vec<String>,
    pub return_fields: Vec<String>,
}

impl SearchRequest {
    pub fn new(query_string: impl Into<String>, indices: Vec<String>) -> Self {
        Self {
            query_string: query_string.into(),
            query_filter: Map::new(),
            indices,
            return_fields: vec![DEFAULT_RETURN_FIELD.to_string()],
        }
    }
}

/// Arguments of a label change on one document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelRequest {
    pub index: String,
    pub event_id: String,
    pub event_type: String,
    pub sketch_id: SketchId,
    pub user_id: UserId,
    pub label: String,
    pub toggle: bool,
    /// Apply the change immediately instead of returning it for the caller
    /// to enqueue.
    pub single_update: bool,
}

impl LabelRequest {
    pub fn to_label(&self) -> Label {
        Label::new(self.label.clone(), self.user_id, self.sketch_id)
    }
}

/// Search backend consumed by events and analyzers.
///
/// Writes go through `import_event` into a mutation queue owned by the
/// implementation; nothing is guaranteed durable until
/// `flush_queued_events` returns.
#[async_trait]
pub trait Datastore: Send + Sync {
    fn name(&self) -> &str;

    /// Make every write applied so far visible to searches on `index`.
    async fn refresh(&self, index: &str) -> Result<(), DatastoreError>;

    async fn search_stream(&self, request: &SearchRequest) -> Result<HitStream, DatastoreError>;

    /// Enqueue a partial update of one document.
    async fn import_event(
        &self,
        index: &str,
        event_type: &str,
        event_id: &str,
        event: Map<String, Value>,
    ) -> Result<(), DatastoreError>;

    /// Compute the label field of a document after applying `request`.
    /// Returns the partial update; with `single_update` it is also applied.
    async fn set_label(&self, request: &LabelRequest) -> Result<Map<String, Value>, DatastoreError>;

    async fn flush_queued_events(&self) -> Result<(), DatastoreError>;
}

/// Label update for a document given its stored body, preferring a label
/// list still waiting in `queue` over the stored one.
pub fn resolve_label_update(
    queue: &MutationQueue,
    stored: &Map<String, Value>,
    request: &LabelRequest,
) -> Result<Map<String, Value>, DatastoreError> {
    let current = match queue.pending_field(&request.index, &request.event_id, labels::LABEL_FIELD) {
        Some(pending) => {
            let mut body = Map::new();
            body.insert(labels::LABEL_FIELD.to_string(), pending);
            labels::labels_from_source(&body)
        }
        None => labels::labels_from_source(stored),
    }
    .map_err(|e| DatastoreError::MalformedResponse(format!("label field: {e}")))?;

    let updated = labels::apply_label(current, request.to_label(), request.toggle);
    Ok(labels::label_update(&updated))
}
