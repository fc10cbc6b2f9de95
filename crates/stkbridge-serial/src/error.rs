//! Error types for the serial link

use thiserror::Error;

/// Serial link errors
#[derive(Debug, Error)]
pub enum SerialError {
    /// The port could not be opened
    #[error("Failed to open {device}: {source}")]
    Open {
        /// Device path
        device: String,
        /// Underlying error
        source: serialport::Error,
    },

    /// Serial port error
    #[error("Serial port error: {0}")]
    Port(#[from] serialport::Error),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for serial link operations
pub type Result<T> = std::result::Result<T, SerialError>;
