use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use timesift_core::datastore::{Datastore, LabelRequest};
use timesift_core::ids::{SketchId, SYSTEM_USER};
use timesift_core::labels::{self, COMMENT_LABEL, STAR_LABEL, TAG_FIELD};
use timesift_store::events::CommentRepo;
use timesift_store::sketches::{SearchIndexRepo, SketchRepo};
use timesift_store::Database;

use crate::error::EngineError;

/// Handle over one search-index document.
///
/// Writes are enqueued on the datastore and only become durable when its
/// queue is flushed. `source` is the document body as of the hit and never
/// reflects writes made through this handle.
pub struct Event {
    event_id: String,
    event_type: String,
    index_name: String,
    source: Map<String, Value>,
    sketch_id: Option<SketchId>,
    /// Last tag list this handle enqueued.
    written_tags: Vec<String>,
    datastore: Arc<dyn Datastore>,
    db: Database,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("event_id", &self.event_id)
            .field("event_type", &self.event_type)
            .field("index_name", &self.index_name)
            .field("sketch_id", &self.sketch_id)
            .finish_non_exhaustive()
    }
}

impl Event {
    /// Build an event from a raw search hit carrying `_id`, `_type`,
    /// `_index` and `_source`.
    pub fn from_hit(
        hit: Value,
        datastore: Arc<dyn Datastore>,
        db: Database,
        sketch_id: Option<SketchId>,
    ) -> Result<Self, EngineError> {
        let Value::Object(mut hit) = hit else {
            return Err(EngineError::Construction { missing: "_id" });
        };
        let event_id = take_key(&mut hit, "_id")?;
        let event_type = take_key(&mut hit, "_type")?;
        let index_name = take_key(&mut hit, "_index")?;
        let source = match hit.remove("_source") {
            Some(Value::Object(source)) => source,
            _ => return Err(EngineError::Construction { missing: "_source" }),
        };

        Ok(Self {
            event_id,
            event_type,
            index_name,
            source,
            sketch_id,
            written_tags: Vec::new(),
            datastore,
            db,
        })
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn source(&self) -> &Map<String, Value> {
        &self.source
    }

    pub fn sketch_id(&self) -> Option<SketchId> {
        self.sketch_id
    }

    /// Stored value of `field`, if the search returned it.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.source.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.source.get(field).and_then(Value::as_str)
    }

    /// Enqueue a partial update of this document.
    pub async fn add_attributes(&mut self, attributes: Map<String, Value>) -> Result<(), EngineError> {
        self.update(attributes).await
    }

    /// Apply a sketch-scoped label as the system user.
    pub async fn add_label(&mut self, label: &str, toggle: bool) -> Result<(), EngineError> {
        let sketch_id = self.require_sketch("add_label")?;
        let request = LabelRequest {
            index: self.index_name.clone(),
            event_id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            sketch_id,
            user_id: SYSTEM_USER,
            label: label.to_string(),
            toggle,
            single_update: false,
        };
        let update = self.datastore.set_label(&request).await?;
        self.update(update).await
    }

    /// Write the union of the snapshot's tags and `tags`.
    ///
    /// Tags enqueued by earlier calls on this handle are kept in the union,
    /// since each write replaces the pending `tag` field.
    pub async fn add_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<(), EngineError> {
        let merged = labels::merge_tags(self.source.get(TAG_FIELD), tags);
        let merged = labels::merge_tags(Some(&Value::from(merged)), self.written_tags.as_slice());
        let mut update = Map::new();
        update.insert(TAG_FIELD.to_string(), Value::from(merged.clone()));
        self.update(update).await?;
        self.written_tags = merged;
        Ok(())
    }

    pub async fn add_star(&mut self) -> Result<(), EngineError> {
        self.add_label(STAR_LABEL, false).await
    }

    /// Store a comment on this document and mark it with the comment label.
    ///
    /// The comment is committed before the label is requested; a failing
    /// label write leaves the comment in place.
    pub async fn add_comment(&mut self, comment: &str) -> Result<(), EngineError> {
        let sketch_id = self.require_sketch("add_comment")?;
        let sketch = SketchRepo::new(self.db.clone()).get(sketch_id)?;
        let searchindex = SearchIndexRepo::new(self.db.clone()).get_by_index_name(&self.index_name)?;
        let row = CommentRepo::new(self.db.clone()).add_to_document(
            sketch.id,
            searchindex.id,
            &self.event_id,
            None,
            comment,
        )?;
        debug!(event_id = %self.event_id, comment_id = %row.id, "comment stored");

        self.add_label(COMMENT_LABEL, false).await
    }

    async fn update(&self, fields: Map<String, Value>) -> Result<(), EngineError> {
        self.datastore
            .import_event(&self.index_name, &self.event_type, &self.event_id, fields)
            .await?;
        Ok(())
    }

    fn require_sketch(&self, operation: &str) -> Result<SketchId, EngineError> {
        self.sketch_id
            .ok_or_else(|| EngineError::Precondition(format!("{operation} requires a sketch_id")))
    }
}

fn take_key(hit: &mut Map<String, Value>, key: &'static str) -> Result<String, EngineError> {
    match hit.remove(key) {
        Some(Value::String(value)) => Ok(value),
        Some(Value::Number(value)) => Ok(value.to_string()),
        _ => Err(EngineError::Construction { missing: key }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fields, Fixture, INDEX};
    use serde_json::json;
    use timesift_core::DatastoreError;
    use timesift_store::events::EventRepo;

    fn hit(id: &str, source: Value) -> Value {
        json!({"_id": id, "_type": "generic_event", "_index": INDEX, "_source": source})
    }

    #[test]
    fn from_hit_requires_every_key() {
        let fx = Fixture::new();
        for missing in ["_id", "_type", "_index", "_source"] {
            let mut raw = hit("1", json!({}));
            raw.as_object_mut().unwrap().remove(missing);
            let err = fx.event_from(raw).unwrap_err();
            match err {
                EngineError::Construction { missing: named } => assert_eq!(named, missing),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn from_hit_reads_identity() {
        let fx = Fixture::new();
        let event = fx.event_from(hit("1", json!({"message": "hello"}))).unwrap();
        assert_eq!(event.event_id(), "1");
        assert_eq!(event.event_type(), "generic_event");
        assert_eq!(event.index_name(), INDEX);
        assert_eq!(event.get_str("message"), Some("hello"));
        assert_eq!(event.sketch_id(), Some(fx.sketch_id));
    }

    #[tokio::test]
    async fn add_attributes_enqueues_without_writing() {
        let fx = Fixture::new();
        fx.insert("1", json!({"message": "m"}));
        let mut event = fx.event_from(hit("1", json!({"message": "m"}))).unwrap();

        event.add_attributes(fields(json!({"domain": "example.com"}))).await.unwrap();
        assert_eq!(fx.datastore.pending(), 1);
        assert!(fx.datastore.document(INDEX, "1").unwrap().get("domain").is_none());

        fx.datastore.flush_queued_events().await.unwrap();
        assert_eq!(fx.datastore.document(INDEX, "1").unwrap()["domain"], "example.com");
    }

    #[tokio::test]
    async fn add_tags_writes_sorted_union() {
        let fx = Fixture::new();
        fx.insert("1", json!({"tag": ["a", "b"]}));
        let mut event = fx.event_from(hit("1", json!({"tag": ["a", "b"]}))).unwrap();

        event.add_tags(&["b", "c"]).await.unwrap();
        fx.datastore.flush_queued_events().await.unwrap();
        assert_eq!(fx.datastore.document(INDEX, "1").unwrap()["tag"], json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn source_stays_a_snapshot_after_writes() {
        let fx = Fixture::new();
        fx.insert("1", json!({"message": "m"}));
        let mut event = fx.event_from(hit("1", json!({"message": "m"}))).unwrap();

        event.add_attributes(fields(json!({"domain": "x"}))).await.unwrap();
        event.add_tags(&["seen"]).await.unwrap();
        event.add_star().await.unwrap();
        assert_eq!(fx.datastore.pending(), 1);
        assert_eq!(event.source(), &fields(json!({"message": "m"})));
        assert!(event.get("domain").is_none());

        fx.datastore.flush_queued_events().await.unwrap();
        assert_eq!(event.source(), &fields(json!({"message": "m"})));
    }

    #[tokio::test]
    async fn repeated_add_tags_on_one_handle_accumulate() {
        let fx = Fixture::new();
        fx.insert("1", json!({}));
        let mut event = fx.event_from(hit("1", json!({}))).unwrap();

        event.add_tags(&["x"]).await.unwrap();
        event.add_tags(&["y"]).await.unwrap();
        fx.datastore.flush_queued_events().await.unwrap();
        assert_eq!(fx.datastore.document(INDEX, "1").unwrap()["tag"], json!(["x", "y"]));
    }

    #[tokio::test]
    async fn toggled_label_goes_present_absent_present() {
        let fx = Fixture::new();
        fx.insert("1", json!({}));
        let star = json!([{"name": "__ts_star", "user_id": 0, "sketch_id": fx.sketch_id.get()}]);

        for expected in [star.clone(), json!([]), star] {
            let mut event = fx.event_from(hit("1", json!({}))).unwrap();
            event.add_label("__ts_star", true).await.unwrap();
            fx.datastore.flush_queued_events().await.unwrap();
            assert_eq!(fx.datastore.document(INDEX, "1").unwrap()["timesketch_label"], expected);
        }
    }

    #[tokio::test]
    async fn toggle_twice_before_flush_cancels_out() {
        let fx = Fixture::new();
        fx.insert("1", json!({}));
        let mut event = fx.event_from(hit("1", json!({}))).unwrap();
        event.add_label("suspicious", true).await.unwrap();
        event.add_label("suspicious", true).await.unwrap();
        fx.datastore.flush_queued_events().await.unwrap();
        assert_eq!(fx.datastore.document(INDEX, "1").unwrap()["timesketch_label"], json!([]));
    }

    #[tokio::test]
    async fn add_star_is_idempotent() {
        let fx = Fixture::new();
        fx.insert("1", json!({}));
        for _ in 0..2 {
            let mut event = fx.event_from(hit("1", json!({}))).unwrap();
            event.add_star().await.unwrap();
            fx.datastore.flush_queued_events().await.unwrap();
        }
        let labels = fx.datastore.document(INDEX, "1").unwrap()["timesketch_label"].clone();
        assert_eq!(labels.as_array().unwrap().len(), 1);
        assert_eq!(labels[0]["name"], "__ts_star");
    }

    #[tokio::test]
    async fn sketch_scoped_ops_require_sketch() {
        let fx = Fixture::new();
        fx.insert("1", json!({}));
        let mut event = Event::from_hit(
            hit("1", json!({})),
            fx.datastore.clone(),
            fx.db.clone(),
            None,
        )
        .unwrap();

        assert!(matches!(event.add_label("x", false).await, Err(EngineError::Precondition(_))));
        assert!(matches!(event.add_star().await, Err(EngineError::Precondition(_))));
        assert!(matches!(event.add_comment("c").await, Err(EngineError::Precondition(_))));
        assert_eq!(fx.datastore.pending(), 0);
    }

    #[tokio::test]
    async fn add_comment_creates_event_row_and_label() {
        let fx = Fixture::new();
        fx.insert("1", json!({}));
        let events = EventRepo::new(fx.db.clone());
        assert!(events.find(fx.sketch_id, fx.searchindex_id, "1").unwrap().is_none());

        let mut event = fx.event_from(hit("1", json!({}))).unwrap();
        event.add_comment("beaconing every 60s").await.unwrap();
        fx.datastore.flush_queued_events().await.unwrap();

        let row = events.find(fx.sketch_id, fx.searchindex_id, "1").unwrap().unwrap();
        let comments = CommentRepo::new(fx.db.clone()).list(row.id).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].comment, "beaconing every 60s");
        assert!(comments[0].user_id.is_none());

        let labels = &fx.datastore.document(INDEX, "1").unwrap()["timesketch_label"];
        assert_eq!(labels[0]["name"], "__ts_comment");
    }

    #[tokio::test]
    async fn comment_survives_failed_label() {
        let fx = Fixture::new();
        // Not in the datastore, so the label lookup fails after the commit.
        let mut event = fx.event_from(hit("ghost", json!({}))).unwrap();
        let err = event.add_comment("orphan").await.unwrap_err();
        assert!(matches!(err, EngineError::Datastore(DatastoreError::DocumentNotFound { .. })));

        let row = EventRepo::new(fx.db.clone())
            .find(fx.sketch_id, fx.searchindex_id, "ghost")
            .unwrap()
            .unwrap();
        assert_eq!(CommentRepo::new(fx.db.clone()).list(row.id).unwrap().len(), 1);
    }
}
