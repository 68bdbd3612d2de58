pub mod config;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod query;
pub mod reader;
pub mod schema;
pub mod store;
pub mod validation;

pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use pipeline::{BulkLoader, CancellationToken, LoadOptions, LoadSummary};
pub use store::{GraphStore, MemoryStore};
