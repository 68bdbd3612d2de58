//! Graph Store Interface
//!
//! The loader talks to the store only through these traits. A session is shared
//! by every writer thread; each write transaction stays on the thread that
//! opened it.

pub mod memory;

pub use memory::MemoryStore;

use crate::query::{InsertQuery, MatchInsertQuery, ThingPattern, ValueType};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity loss or transaction contention; the same write may succeed later
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query rejected: {0}")]
    Rejected(String),

    #[error("store failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait GraphStore: Send + Sync {
    fn database_exists(&self, database: &str) -> StoreResult<bool>;

    fn create_database(&self, database: &str) -> StoreResult<()>;

    fn delete_database(&self, database: &str) -> StoreResult<()>;

    /// Apply a `define` block to the database schema
    fn define_schema(&self, database: &str, schema: &str) -> StoreResult<()>;

    /// Value type of an attribute type, `None` when the label is not an attribute type
    fn attribute_value_type(&self, database: &str, label: &str) -> StoreResult<Option<ValueType>>;

    fn session(&self, database: &str) -> StoreResult<Arc<dyn Session>>;
}

pub trait Session: Send + Sync {
    fn write_transaction(&self) -> StoreResult<Box<dyn WriteTransaction + '_>>;
}

/// Dropping a transaction without committing discards its writes
pub trait WriteTransaction {
    /// Returns the number of inserted answers (always 1 for a direct insert)
    fn insert(&mut self, query: &InsertQuery) -> StoreResult<usize>;

    /// Runs the insert once per match answer and returns the answer count
    fn match_insert(&mut self, query: &MatchInsertQuery) -> StoreResult<usize>;

    /// Number of answers of a match, counting at most `limit`
    fn count_matches(&mut self, patterns: &[ThingPattern], limit: usize) -> StoreResult<usize>;

    fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::Rejected("bad type".into()).is_transient());
        assert!(!StoreError::Internal("disk".into()).is_transient());
    }
}
