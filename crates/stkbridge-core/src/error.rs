//! Error types for stkbridge-core
//!
//! This module provides a no_std compatible error type shared by the
//! transport and the programming session. Every variant is `Copy` so a
//! failure can be stored inside a progress snapshot without allocation.

use core::fmt;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Protocol errors
    /// The peer never answered the synchronization exchange
    HandshakeTimeout,
    /// A response frame did not arrive within its bounded wait
    FrameTimeout {
        /// Opcode of the command awaiting a response
        opcode: u8,
    },
    /// The peer answered NOSYNC: it lost track of framing
    NotInSync {
        /// Opcode of the rejected command
        opcode: u8,
    },
    /// The peer answered with a byte that is neither INSYNC, OK nor NOSYNC
    UnexpectedResponse {
        /// Opcode of the command awaiting a response
        opcode: u8,
        /// Byte the protocol required at this point
        expected: u8,
        /// Byte actually received
        found: u8,
    },
    /// Read-back of the programmed region does not match what was written
    ChecksumMismatch {
        /// CRC-32 of the pages written
        expected: u32,
        /// CRC-32 of the pages read back
        actual: u32,
    },
    /// The peer reports a different device signature than configured
    SignatureMismatch {
        /// Configured signature
        expected: [u8; 3],
        /// Signature reported by the peer
        found: [u8; 3],
    },

    // Session errors
    /// A programming session is already active on the serial link
    Busy,
    /// The upload was cancelled or ended before all bytes arrived
    UploadAborted,
    /// More bytes arrived than the upload declared
    UploadOverrun,
    /// The upload declared zero bytes
    EmptyImage,
    /// The image does not fit in the peer's application flash
    ImageTooLarge {
        /// Declared image size in bytes
        size: usize,
        /// Application flash size in bytes
        capacity: usize,
    },
    /// Operation requires a page-aligned address and exactly one page of data
    InvalidAlignment,
    /// Operation is not valid in the current session state
    InvalidState,
    /// Configuration values are out of range
    InvalidConfig,

    // Link errors
    /// The underlying serial link failed
    LinkError,
}

impl Error {
    /// Whether this error came out of a bounded wait on the peer
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandshakeTimeout | Self::FrameTimeout { .. })
    }

    /// Errors a single synchronization attempt may produce without the link
    /// itself being broken
    pub fn is_sync_failure(&self) -> bool {
        matches!(
            self,
            Self::FrameTimeout { .. } | Self::NotInSync { .. } | Self::UnexpectedResponse { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeTimeout => write!(f, "bootloader did not answer the handshake"),
            Self::FrameTimeout { opcode } => {
                write!(f, "timed out waiting for response to command 0x{:02X}", opcode)
            }
            Self::NotInSync { opcode } => {
                write!(f, "peer lost sync on command 0x{:02X}", opcode)
            }
            Self::UnexpectedResponse {
                opcode,
                expected,
                found,
            } => write!(
                f,
                "unexpected response 0x{:02X} to command 0x{:02X} (expected 0x{:02X})",
                found, opcode, expected
            ),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "verify failed: wrote CRC 0x{:08X}, read back 0x{:08X}",
                expected, actual
            ),
            Self::SignatureMismatch { expected, found } => write!(
                f,
                "device signature {:02X}{:02X}{:02X} does not match expected {:02X}{:02X}{:02X}",
                found[0], found[1], found[2], expected[0], expected[1], expected[2]
            ),
            Self::Busy => write!(f, "programming session already active"),
            Self::UploadAborted => write!(f, "upload aborted"),
            Self::UploadOverrun => write!(f, "upload exceeded its declared size"),
            Self::EmptyImage => write!(f, "firmware image is empty"),
            Self::ImageTooLarge { size, capacity } => write!(
                f,
                "firmware image of {} bytes exceeds {} bytes of flash",
                size, capacity
            ),
            Self::InvalidAlignment => write!(f, "page write is not page aligned"),
            Self::InvalidState => write!(f, "operation not valid in current state"),
            Self::InvalidConfig => write!(f, "invalid configuration"),
            Self::LinkError => write!(f, "serial link error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
