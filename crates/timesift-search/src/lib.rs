pub mod elasticsearch;
pub mod memory;
mod query;

pub use elasticsearch::ElasticsearchDatastore;
pub use memory::{DatastoreCall, InMemoryDatastore};
