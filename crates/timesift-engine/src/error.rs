use timesift_core::{ConfigError, DatastoreError};
use timesift_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed event: missing {missing}")]
    Construction { missing: &'static str },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown analyzer: {0}")]
    UnknownAnalyzer(String),

    #[error("analyzer task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Short classification string for logging and analysis records.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Construction { .. } => "construction",
            Self::Precondition(_) => "precondition",
            Self::Validation(_) => "validation",
            Self::NotImplemented(_) => "not_implemented",
            Self::Datastore(_) => "datastore",
            Self::Store(_) => "store",
            Self::Config(_) | Self::UnknownAnalyzer(_) => "config",
            Self::Task(_) => "task",
        }
    }
}
