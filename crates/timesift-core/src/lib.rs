pub mod config;
pub mod datastore;
pub mod errors;
pub mod ids;
pub mod labels;
pub mod queue;

pub use config::{ConfigError, DatastoreConfig};
pub use datastore::{Datastore, HitStream, LabelRequest, SearchRequest};
pub use errors::DatastoreError;
pub use queue::MutationQueue;
