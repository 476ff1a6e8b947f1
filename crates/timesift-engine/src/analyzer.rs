use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use timesift_core::config::DatastoreConfig;
use timesift_core::datastore::{Datastore, SearchRequest, DEFAULT_RETURN_FIELD};
use timesift_core::ids::SketchId;
use timesift_search::ElasticsearchDatastore;
use timesift_store::Database;

use crate::error::EngineError;
use crate::event::Event;
use crate::sketch::{Sketch, ViewQueryGate};

/// Keyword arguments of one analyzer instance.
pub type AnalyzerArgs = Map<String, Value>;

/// Lazy sequence of events produced by [`AnalyzerContext::event_stream`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, EngineError>> + Send>>;

/// Instantiation arguments an analyzer declares.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum AnalyzerKwargs {
    /// One instance with no extra arguments.
    #[default]
    None,
    Single(AnalyzerArgs),
    /// One independent instance per argument map.
    Multiple(Vec<AnalyzerArgs>),
}

impl AnalyzerKwargs {
    /// Argument maps of the instances to create, in declaration order.
    pub fn instances(&self) -> Vec<AnalyzerArgs> {
        match self {
            Self::None => vec![AnalyzerArgs::new()],
            Self::Single(args) => vec![args.clone()],
            Self::Multiple(all) => all.clone(),
        }
    }
}

/// Registration metadata of an analyzer.
#[derive(Clone, Debug)]
pub struct AnalyzerDescriptor {
    pub name: String,
    pub display_name: String,
    /// Instances need a sketch to run.
    pub is_sketch_analyzer: bool,
    pub kwargs: AnalyzerKwargs,
}

impl AnalyzerDescriptor {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            is_sketch_analyzer: false,
            kwargs: AnalyzerKwargs::None,
        }
    }

    pub fn sketch_analyzer(mut self) -> Self {
        self.is_sketch_analyzer = true;
        self
    }

    pub fn with_kwargs(mut self, kwargs: AnalyzerKwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn get_kwargs(&self) -> &AnalyzerKwargs {
        &self.kwargs
    }
}

/// When [`AnalyzerInstance::run_wrapper`] flushes the mutation queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush only after `run` succeeds; writes queued by a failed run are
    /// left unflushed.
    #[default]
    OnSuccess,
    /// Flush after every run, then report the run's own outcome.
    Always,
}

#[derive(Clone, Debug, Default)]
pub struct AnalyzerConfig {
    pub datastore: DatastoreConfig,
    pub flush_policy: FlushPolicy,
    pub view_gate: ViewQueryGate,
}

/// Arguments of [`AnalyzerContext::event_stream`]. Unset fields fall back to
/// an empty filter, the `message` field and the bound index.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub query_string: String,
    pub query_filter: Map<String, Value>,
    pub return_fields: Vec<String>,
    pub indices: Vec<String>,
}

impl EventQuery {
    pub fn new(query_string: impl Into<String>) -> Self {
        Self {
            query_string: query_string.into(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, query_filter: Map<String, Value>) -> Self {
        self.query_filter = query_filter;
        self
    }

    pub fn return_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.return_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn indices<I, S>(mut self, indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices = indices.into_iter().map(Into::into).collect();
        self
    }
}

/// Everything an analyzer instance runs against: its bound index, the
/// optional sketch, and its own datastore connection.
pub struct AnalyzerContext {
    name: String,
    index_name: String,
    sketch_id: Option<SketchId>,
    sketch: Option<Sketch>,
    datastore: Arc<dyn Datastore>,
    db: Database,
}

impl AnalyzerContext {
    /// Bind an instance to `datastore`. A configured sketch is loaded
    /// immediately.
    pub fn new(
        descriptor: &AnalyzerDescriptor,
        index_name: &str,
        sketch_id: Option<SketchId>,
        datastore: Arc<dyn Datastore>,
        db: Database,
        view_gate: ViewQueryGate,
    ) -> Result<Self, EngineError> {
        if descriptor.is_sketch_analyzer && sketch_id.is_none() {
            return Err(EngineError::Precondition(format!(
                "{} is a sketch analyzer and needs a sketch_id",
                descriptor.name
            )));
        }
        let sketch = sketch_id
            .map(|id| Sketch::load(db.clone(), id, view_gate))
            .transpose()?;

        Ok(Self {
            name: descriptor.name.clone(),
            index_name: index_name.to_string(),
            sketch_id,
            sketch,
            datastore,
            db,
        })
    }

    /// Same as [`new`](Self::new) with an Elasticsearch connection built
    /// from `config`.
    pub fn connect(
        descriptor: &AnalyzerDescriptor,
        index_name: &str,
        sketch_id: Option<SketchId>,
        db: Database,
        config: &AnalyzerConfig,
    ) -> Result<Self, EngineError> {
        let datastore = Arc::new(ElasticsearchDatastore::new(&config.datastore)?);
        Self::new(descriptor, index_name, sketch_id, datastore, db, config.view_gate)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn sketch_id(&self) -> Option<SketchId> {
        self.sketch_id
    }

    pub fn sketch(&self) -> Option<&Sketch> {
        self.sketch.as_ref()
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Refresh every target index, then stream the matching events.
    ///
    /// Writes flushed before this call are visible; writes still queued are
    /// not. The stream is forward-only and cannot be restarted.
    #[instrument(skip(self, query), fields(analyzer = %self.name, query = %query.query_string))]
    pub async fn event_stream(&self, query: EventQuery) -> Result<EventStream, EngineError> {
        let indices = if query.indices.is_empty() {
            vec![self.index_name.clone()]
        } else {
            query.indices
        };
        let return_fields = if query.return_fields.is_empty() {
            vec![DEFAULT_RETURN_FIELD.to_string()]
        } else {
            query.return_fields
        };

        for index in &indices {
            self.datastore.refresh(index).await?;
        }

        let request = SearchRequest {
            query_string: query.query_string,
            query_filter: query.query_filter,
            indices,
            return_fields,
        };
        let hits = self.datastore.search_stream(&request).await?;

        let datastore = Arc::clone(&self.datastore);
        let db = self.db.clone();
        let sketch_id = self.sketch_id;
        let events = hits.map(move |hit| {
            Event::from_hit(hit?, Arc::clone(&datastore), db.clone(), sketch_id)
        });
        Ok(Box::pin(events))
    }
}

/// A unit of analysis over one index.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Inspect and annotate events, returning a human-readable summary.
    async fn run(&self, ctx: &AnalyzerContext) -> Result<String, EngineError> {
        Err(EngineError::NotImplemented(format!(
            "analyzer {} has no run implementation",
            ctx.name()
        )))
    }
}

/// An analyzer bound to its context, run at most once.
pub struct AnalyzerInstance {
    analyzer: Box<dyn Analyzer>,
    context: AnalyzerContext,
    flush_policy: FlushPolicy,
}

impl AnalyzerInstance {
    pub fn new(analyzer: Box<dyn Analyzer>, context: AnalyzerContext, flush_policy: FlushPolicy) -> Self {
        Self {
            analyzer,
            context,
            flush_policy,
        }
    }

    pub fn context(&self) -> &AnalyzerContext {
        &self.context
    }

    /// Run the analyzer and flush its queued writes.
    ///
    /// Under [`FlushPolicy::OnSuccess`] the queue is flushed exactly once
    /// after `run` returns `Ok`, and not at all after an error. A failing
    /// flush after a successful run is reported in place of the result.
    #[instrument(skip(self), fields(analyzer = %self.context.name, index = %self.context.index_name))]
    pub async fn run_wrapper(self) -> Result<String, EngineError> {
        let outcome = self.analyzer.run(&self.context).await;

        let should_flush = outcome.is_ok() || self.flush_policy == FlushPolicy::Always;
        if !should_flush {
            if let Err(e) = &outcome {
                warn!(error = %e, kind = e.error_kind(), "analyzer failed, queued writes not flushed");
            }
            return outcome;
        }

        let flushed = self.context.datastore.flush_queued_events().await;
        match (outcome, flushed) {
            (Ok(result), Ok(())) => {
                info!(result = %result, "analyzer finished");
                Ok(result)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), flushed) => {
                if let Err(flush_error) = flushed {
                    warn!(error = %flush_error, "flush after failed run also failed");
                }
                warn!(error = %e, kind = e.error_kind(), "analyzer failed");
                Err(e)
            }
        }
    }
}
