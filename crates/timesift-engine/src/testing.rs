use std::sync::Arc;

use serde_json::{Map, Value};

use timesift_core::ids::{SearchIndexId, SketchId};
use timesift_search::InMemoryDatastore;
use timesift_store::sketches::{SearchIndexRepo, SketchRepo, TimelineRepo};
use timesift_store::Database;

use crate::analyzer::{Analyzer, AnalyzerContext, AnalyzerDescriptor, AnalyzerInstance, FlushPolicy};
use crate::error::EngineError;
use crate::event::Event;
use crate::sketch::ViewQueryGate;

pub const INDEX: &str = "ts_test";

pub fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// A sketch with one active timeline over [`INDEX`], backed by an in-memory
/// datastore holding that index.
pub struct Fixture {
    pub db: Database,
    pub datastore: Arc<InMemoryDatastore>,
    pub sketch_id: SketchId,
    pub searchindex_id: SearchIndexId,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Database::in_memory().unwrap();
        let sketch = SketchRepo::new(db.clone()).create("fixture", "").unwrap();
        let index = SearchIndexRepo::new(db.clone()).create("Test timeline", INDEX).unwrap();
        TimelineRepo::new(db.clone())
            .attach(sketch.id, index.id, "Test timeline")
            .unwrap();
        let datastore = Arc::new(InMemoryDatastore::new());
        datastore.create_index(INDEX);

        Self {
            db,
            datastore,
            sketch_id: sketch.id,
            searchindex_id: index.id,
        }
    }

    pub fn insert(&self, event_id: &str, source: Value) {
        self.datastore
            .insert_document(INDEX, "generic_event", event_id, fields(source));
    }

    pub fn event_from(&self, hit: Value) -> Result<Event, EngineError> {
        Event::from_hit(hit, self.datastore.clone(), self.db.clone(), Some(self.sketch_id))
    }

    /// Context over [`INDEX`] bound to the fixture sketch.
    pub fn context(&self, descriptor: &AnalyzerDescriptor) -> AnalyzerContext {
        AnalyzerContext::new(
            descriptor,
            INDEX,
            Some(self.sketch_id),
            self.datastore.clone(),
            self.db.clone(),
            ViewQueryGate::Literal,
        )
        .unwrap()
    }

    pub async fn run(
        &self,
        descriptor: &AnalyzerDescriptor,
        analyzer: impl Analyzer + 'static,
    ) -> Result<String, EngineError> {
        AnalyzerInstance::new(Box::new(analyzer), self.context(descriptor), FlushPolicy::OnSuccess)
            .run_wrapper()
            .await
    }
}
