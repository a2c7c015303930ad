//! Store error types.

use thiserror::Error;

/// Errors from the durable message store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A cache population is already in progress
    #[error("Cache population already in progress")]
    PopulationInProgress,

    /// No cache population is in progress
    #[error("No cache population in progress")]
    PopulationNotStarted,
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
