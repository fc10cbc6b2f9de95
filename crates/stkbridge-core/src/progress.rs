//! Progress reporting
//!
//! The session owns a single [`ProgressReporter`]. Every state transition
//! and every completed page replaces its [`ProgressSnapshot`] as a whole
//! value, then hands the new snapshot to the registered observer. Readers
//! therefore only ever see fully formed snapshots.

use crate::error::Error;
use core::fmt::Write;

/// Longest error message kept in a snapshot
pub const ERROR_MESSAGE_CAPACITY: usize = 96;

/// Programming session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ProgrammingState {
    /// No session running
    #[default]
    Idle,
    /// Resetting the peer and waiting for its bootloader handshake
    Connecting,
    /// Writing pages
    Uploading,
    /// Reading the programmed region back
    Verifying,
    /// Image written and verified, peer restarted
    Complete,
    /// Session failed; see the snapshot's error
    Error,
}

impl ProgrammingState {
    /// States that own the serial link
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Uploading | Self::Verifying)
    }

    /// States a session can only leave through a new start or a reset
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Upper-case name, as reported by the status endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Uploading => "UPLOADING",
            Self::Verifying => "VERIFYING",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }
}

impl core::fmt::Display for ProgrammingState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of session progress
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ProgressSnapshot {
    /// Session state
    pub state: ProgrammingState,
    /// Declared image size
    pub bytes_total: usize,
    /// Image bytes written to the peer
    pub bytes_written: usize,
    /// `bytes_written` as a percentage of `bytes_total`
    pub percent_complete: f32,
    /// Human readable failure, empty unless `state` is `Error`
    pub error_message: heapless::String<ERROR_MESSAGE_CAPACITY>,
    /// Failure that moved the session to `Error`
    #[cfg_attr(feature = "serde", serde(skip))]
    pub error: Option<Error>,
}

impl ProgressSnapshot {
    /// Build a snapshot, deriving the percentage and error message
    pub fn new(
        state: ProgrammingState,
        bytes_total: usize,
        bytes_written: usize,
        error: Option<Error>,
    ) -> Self {
        let bytes_written = bytes_written.min(bytes_total);
        let percent_complete = if state == ProgrammingState::Complete {
            100.0
        } else if bytes_total == 0 {
            0.0
        } else {
            (bytes_written as f64 * 100.0 / bytes_total as f64) as f32
        };

        let mut error_message = heapless::String::new();
        if let Some(e) = error {
            // Overlong messages are truncated by the fixed capacity
            let _ = write!(error_message, "{}", e);
        }

        Self {
            state,
            bytes_total,
            bytes_written,
            percent_complete,
            error_message,
            error,
        }
    }
}

/// Receives every new snapshot as it is published
pub trait ProgressObserver {
    /// Called after the current snapshot was replaced
    fn on_update(&mut self, snapshot: &ProgressSnapshot);
}

/// An observer that ignores updates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_update(&mut self, _snapshot: &ProgressSnapshot) {}
}

impl<F: FnMut(&ProgressSnapshot)> ProgressObserver for F {
    fn on_update(&mut self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

/// Holds the latest snapshot and pushes replacements to an observer
#[derive(Debug)]
pub struct ProgressReporter<O: ProgressObserver = NoProgress> {
    snapshot: ProgressSnapshot,
    observer: O,
}

impl<O: ProgressObserver> ProgressReporter<O> {
    /// Create a reporter starting from an idle snapshot
    pub fn new(observer: O) -> Self {
        Self {
            snapshot: ProgressSnapshot::default(),
            observer,
        }
    }

    /// The latest snapshot
    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Replace the snapshot and notify the observer
    pub fn publish(&mut self, snapshot: ProgressSnapshot) {
        self.snapshot = snapshot;
        self.observer.on_update(&self.snapshot);
    }

    /// Borrow the observer
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Mutably borrow the observer
    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_percent_and_clamp() {
        let s = ProgressSnapshot::new(ProgrammingState::Uploading, 2048, 512, None);
        assert_eq!(s.percent_complete, 25.0);

        let s = ProgressSnapshot::new(ProgrammingState::Uploading, 300, 384, None);
        assert_eq!(s.bytes_written, 300);
        assert_eq!(s.percent_complete, 100.0);

        let s = ProgressSnapshot::new(ProgrammingState::Idle, 0, 0, None);
        assert_eq!(s.percent_complete, 0.0);
    }

    #[test]
    fn test_error_message_filled() {
        let s = ProgressSnapshot::new(
            ProgrammingState::Error,
            100,
            0,
            Some(Error::HandshakeTimeout),
        );
        assert_eq!(s.error, Some(Error::HandshakeTimeout));
        assert_eq!(
            s.error_message.as_str(),
            "bootloader did not answer the handshake"
        );
    }

    #[test]
    fn test_closure_observer_sees_each_publish() {
        let mut seen = Vec::new();
        {
            let mut reporter = ProgressReporter::new(|s: &ProgressSnapshot| seen.push(s.state));
            reporter.publish(ProgressSnapshot::new(ProgrammingState::Connecting, 10, 0, None));
            reporter.publish(ProgressSnapshot::new(ProgrammingState::Uploading, 10, 0, None));
            assert_eq!(reporter.snapshot().state, ProgrammingState::Uploading);
        }
        assert_eq!(
            seen,
            [ProgrammingState::Connecting, ProgrammingState::Uploading]
        );
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ProgrammingState::Verifying.as_str(), "VERIFYING");
        assert!(ProgrammingState::Uploading.is_active());
        assert!(!ProgrammingState::Error.is_active());
        assert!(ProgrammingState::Error.is_terminal());
    }
}
