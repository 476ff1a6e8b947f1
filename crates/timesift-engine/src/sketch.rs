use serde_json::{Map, Value};
use tracing::{info, instrument};

use timesift_core::ids::SketchId;
use timesift_store::sketches::{SketchRepo, TimelineRepo};
use timesift_store::views::{self, NewView, ViewRepo, ViewRow};
use timesift_store::Database;

use crate::error::EngineError;

/// Which combinations of query string and DSL `add_view` accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ViewQueryGate {
    /// A non-empty query string is required and a DSL is refused.
    #[default]
    Literal,
    /// Exactly one of a non-empty query string or a DSL.
    Corrected,
}

impl ViewQueryGate {
    pub fn check(self, query_string: Option<&str>, query_dsl: Option<&Value>) -> Result<(), EngineError> {
        let has_string = query_string.is_some_and(|q| !q.is_empty());
        let has_dsl = query_dsl.is_some_and(is_truthy);
        let accepted = match self {
            Self::Literal => has_string && !has_dsl,
            Self::Corrected => has_string != has_dsl,
        };
        if accepted {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "view needs a query string or a query DSL ({self:?} gate, string: {has_string}, dsl: {has_dsl})"
            )))
        }
    }
}

/// Whether a JSON value counts as present: null, `false`, zero and empty
/// strings, arrays and objects do not.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Handle over a sketch record.
#[derive(Clone, Debug)]
pub struct Sketch {
    id: SketchId,
    name: String,
    db: Database,
    gate: ViewQueryGate,
}

impl Sketch {
    /// Bind to an existing sketch.
    pub fn load(db: Database, id: SketchId, gate: ViewQueryGate) -> Result<Self, EngineError> {
        let row = SketchRepo::new(db.clone()).get(id)?;
        Ok(Self {
            id,
            name: row.name,
            db,
            gate,
        })
    }

    pub fn id(&self) -> SketchId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index names of the sketch's active timelines, read fresh on each call.
    pub fn all_indices(&self) -> Result<Vec<String>, EngineError> {
        Ok(TimelineRepo::new(self.db.clone()).active_index_names(self.id)?)
    }

    /// Save a view on the sketch. The view has no owner and no search
    /// template, and is committed before this returns.
    #[instrument(skip(self, query_dsl, query_filter), fields(sketch_id = %self.id))]
    pub fn add_view(
        &self,
        name: &str,
        query_string: Option<&str>,
        query_dsl: Option<Value>,
        query_filter: Option<Map<String, Value>>,
    ) -> Result<ViewRow, EngineError> {
        self.gate.check(query_string, query_dsl.as_ref())?;
        let query_filter = views::validate_filter(query_filter.unwrap_or_default())
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let view = ViewRepo::new(self.db.clone()).create(NewView {
            query_string: query_string.map(str::to_string),
            query_dsl,
            query_filter,
            ..NewView::new(self.id, name)
        })?;
        info!(view_id = %view.id, name, "view saved");
        Ok(view)
    }
}
