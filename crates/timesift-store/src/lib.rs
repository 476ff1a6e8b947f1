pub mod analyses;
pub mod database;
pub mod error;
pub mod events;
pub mod row_helpers;
pub mod schema;
pub mod sketches;
pub mod views;

pub use database::Database;
pub use error::StoreError;
