use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A JSON payload column failed to (de)serialize.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored enum column holds a value this build does not know.
    #[error("corrupt column value: {0}")]
    CorruptColumn(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
