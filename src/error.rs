//! Error types for the tristore storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Format or invariant violation detected while writing
    /// (zero byte width, out-of-order key, out-of-range probe).
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// On-disk bytes that cannot be decoded (bad magic, checksum, truncation).
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The layout or cursor cannot perform the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Memory ceiling reached with every block pinned, too many open
    /// mappings, or file id space used up.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl StorageError {
    /// True for the resource-exhaustion class (callers may free pins and retry).
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, StorageError::ResourceExhausted(_))
    }
}
