//! Error types for the storage layer.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB error.
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected.
    #[error("Data corruption detected: {0}")]
    Corruption(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
