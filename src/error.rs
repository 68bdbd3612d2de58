use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Load aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoaderError {
    /// Configuration problems only take down the generator unit they belong to.
    pub fn is_configuration(&self) -> bool {
        matches!(self, LoaderError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;
