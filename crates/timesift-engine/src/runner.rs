use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use timesift_core::config::DatastoreConfig;
use timesift_core::datastore::Datastore;
use timesift_core::errors::DatastoreError;
use timesift_core::ids::{AnalysisId, SketchId};
use timesift_search::ElasticsearchDatastore;
use timesift_store::analyses::{AnalysisRepo, AnalysisStatus};
use timesift_store::{Database, StoreError};

use crate::analyzer::{AnalyzerArgs, AnalyzerConfig, AnalyzerContext, AnalyzerDescriptor, AnalyzerInstance};
use crate::error::EngineError;
use crate::registry::{AnalyzerFactory, AnalyzerRegistry};

/// Opens the datastore connection of one analyzer instance.
pub type DatastoreConnector =
    Arc<dyn Fn(&DatastoreConfig) -> Result<Arc<dyn Datastore>, DatastoreError> + Send + Sync>;

pub fn elasticsearch_connector() -> DatastoreConnector {
    Arc::new(
        |config: &DatastoreConfig| -> Result<Arc<dyn Datastore>, DatastoreError> {
            Ok(Arc::new(ElasticsearchDatastore::new(config)?))
        },
    )
}

/// Result of one analyzer instance.
#[derive(Debug)]
pub struct InstanceOutcome {
    pub analyzer: String,
    pub args: AnalyzerArgs,
    pub analysis_id: Option<AnalysisId>,
    pub result: Result<String, EngineError>,
}

/// Runs every declared instance of an analyzer concurrently, each with its
/// own datastore connection, recording sketch-bound runs as analyses.
pub struct AnalysisRunner {
    registry: Arc<AnalyzerRegistry>,
    db: Database,
    config: AnalyzerConfig,
    connector: DatastoreConnector,
}

impl AnalysisRunner {
    pub fn new(registry: Arc<AnalyzerRegistry>, db: Database, config: AnalyzerConfig) -> Self {
        Self {
            registry,
            db,
            config,
            connector: elasticsearch_connector(),
        }
    }

    pub fn with_connector(mut self, connector: DatastoreConnector) -> Self {
        self.connector = connector;
        self
    }

    /// Run all instances of `name` against `index_name`.
    ///
    /// Instance failures are reported in their outcome; only lookup and
    /// bookkeeping failures fail the whole call. Outcomes keep the order in
    /// which the analyzer declared its instances.
    #[instrument(skip(self))]
    pub async fn run(
        &self,
        name: &str,
        index_name: &str,
        sketch_id: Option<SketchId>,
    ) -> Result<Vec<InstanceOutcome>, EngineError> {
        let (descriptor, factory) = match (self.registry.descriptor(name), self.registry.factory(name)) {
            (Some(descriptor), Some(factory)) => (descriptor.clone(), factory),
            _ => return Err(EngineError::UnknownAnalyzer(name.to_string())),
        };
        if descriptor.is_sketch_analyzer && sketch_id.is_none() {
            return Err(EngineError::Precondition(format!(
                "{name} is a sketch analyzer and needs a sketch_id"
            )));
        }

        let instances = descriptor.get_kwargs().instances();
        info!(instances = instances.len(), "starting analyzer instances");

        let analyses = AnalysisRepo::new(self.db.clone());
        let mut jobs = Vec::with_capacity(instances.len());
        for args in instances {
            let analysis_id = match sketch_id {
                Some(sketch_id) => match analyses.create(sketch_id, name, index_name, &args) {
                    Ok(row) => Some(row.id),
                    Err(e) => {
                        abandon(&analyses, &jobs, &e);
                        return Err(e.into());
                    }
                },
                None => None,
            };
            jobs.push(InstanceJob {
                descriptor: descriptor.clone(),
                factory: Arc::clone(&factory),
                args,
                index_name: index_name.to_string(),
                sketch_id,
                analysis_id,
                db: self.db.clone(),
                config: self.config.clone(),
                connector: Arc::clone(&self.connector),
            });
        }

        let mut tasks = JoinSet::new();
        for (position, job) in jobs.into_iter().enumerate() {
            tasks.spawn(async move { (position, job.execute().await) });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut join_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(error = %e, "analyzer task did not complete");
                    join_error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        if let Some(e) = join_error {
            return Err(EngineError::Task(e));
        }
        outcomes.sort_by_key(|(position, _)| *position);

        let failed = outcomes.iter().filter(|(_, o)| o.result.is_err()).count();
        info!(total = outcomes.len(), failed, "analyzer instances finished");
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

/// Mark the records of jobs that will never run as failed.
fn abandon(analyses: &AnalysisRepo, jobs: &[InstanceJob], cause: &StoreError) {
    let reason = format!("not started: {cause}");
    for id in jobs.iter().filter_map(|job| job.analysis_id) {
        if let Err(e) = analyses.update_status(id, AnalysisStatus::Error, Some(&reason)) {
            warn!(analysis_id = %id, error = %e, "failed to record abandoned analysis");
        }
    }
}

struct InstanceJob {
    descriptor: AnalyzerDescriptor,
    factory: AnalyzerFactory,
    args: AnalyzerArgs,
    index_name: String,
    sketch_id: Option<SketchId>,
    analysis_id: Option<AnalysisId>,
    db: Database,
    config: AnalyzerConfig,
    connector: DatastoreConnector,
}

impl InstanceJob {
    async fn execute(self) -> InstanceOutcome {
        let result = self.run_instance().await;

        if let Some(id) = self.analysis_id {
            let (status, text) = match &result {
                Ok(summary) => (AnalysisStatus::Done, summary.clone()),
                Err(e) => (AnalysisStatus::Error, e.to_string()),
            };
            if let Err(e) = AnalysisRepo::new(self.db.clone()).update_status(id, status, Some(&text)) {
                warn!(analysis_id = %id, error = %e, "failed to record analysis result");
            }
        }

        InstanceOutcome {
            analyzer: self.descriptor.name,
            args: self.args,
            analysis_id: self.analysis_id,
            result,
        }
    }

    async fn run_instance(&self) -> Result<String, EngineError> {
        let analyzer = (self.factory)(&self.args)?;
        let datastore = (self.connector)(&self.config.datastore)?;
        let context = AnalyzerContext::new(
            &self.descriptor,
            &self.index_name,
            self.sketch_id,
            datastore,
            self.db.clone(),
            self.config.view_gate,
        )?;
        if let Some(id) = self.analysis_id {
            AnalysisRepo::new(self.db.clone()).update_status(id, AnalysisStatus::Started, None)?;
        }
        AnalyzerInstance::new(analyzer, context, self.config.flush_policy)
            .run_wrapper()
            .await
    }
}
