//! Error types for the firmware store

use thiserror::Error;

/// Firmware store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Saving the image would exceed the configured capacity
    #[error("Storage full: {needed} bytes needed, {available} available")]
    StorageFull {
        /// Size of the image being saved
        needed: u64,
        /// Bytes left under the capacity
        available: u64,
    },

    /// The image could not be written
    #[error("Failed to write {path}: {source}")]
    StorageWriteError {
        /// File being written
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// No stored image matches
    #[error("No stored image {0}")]
    NotFound(String),

    /// Stored bytes do not match their recorded length or checksum
    #[error("Stored image {0} is corrupt")]
    Corrupt(String),

    /// Name or version unusable as a file name
    #[error("Invalid image name: {0:?}")]
    InvalidName(String),

    /// Metadata sidecar could not be parsed or written
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
