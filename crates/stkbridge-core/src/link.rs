//! Peer link capability
//!
//! The session never touches hardware directly. Everything it needs from
//! the outside world - moving bytes over the serial line, driving the
//! peer's reset lines and reading a monotonic clock - goes through
//! [`PeerLink`], so the whole state machine can run against a simulated
//! peer.

use crate::error::Result;
use bitflags::bitflags;

bitflags! {
    /// Control lines wired to the peer
    ///
    /// A set bit means the line is driven to its active level (low for
    /// both lines on an Arduino style board).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlLines: u8 {
        /// The peer's RESET input
        const RESET = 1 << 0;
        /// DTR, which auto-reset boards couple into RESET
        const DTR   = 1 << 1;
    }
}

impl Default for ControlLines {
    fn default() -> Self {
        ControlLines::empty()
    }
}

/// Byte link plus reset lines to the peer
///
/// All methods must return promptly. `read_available` is a poll: it hands
/// back whatever has already arrived and never waits for more.
pub trait PeerLink {
    /// Queue bytes for transmission to the peer
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Copy already received bytes into `buf`, returning how many were copied
    ///
    /// Returns 0 when nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drive the given lines active and release all others
    fn set_lines(&mut self, asserted: ControlLines) -> Result<()>;

    /// Drop any received bytes not yet read
    fn discard_input(&mut self) -> Result<()>;

    /// Monotonic time in milliseconds
    fn now_ms(&mut self) -> u64;

    /// Called between polls while waiting on the peer
    ///
    /// Implementations may yield for a moment; they must not block for
    /// longer than a millisecond or so.
    fn idle(&mut self) {}
}

impl<L: PeerLink + ?Sized> PeerLink for &mut L {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_available(buf)
    }

    fn set_lines(&mut self, asserted: ControlLines) -> Result<()> {
        (**self).set_lines(asserted)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }

    fn now_ms(&mut self) -> u64 {
        (**self).now_ms()
    }

    fn idle(&mut self) {
        (**self).idle()
    }
}

#[cfg(feature = "std")]
impl<L: PeerLink + ?Sized> PeerLink for std::boxed::Box<L> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_available(buf)
    }

    fn set_lines(&mut self, asserted: ControlLines) -> Result<()> {
        (**self).set_lines(asserted)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }

    fn now_ms(&mut self) -> u64 {
        (**self).now_ms()
    }

    fn idle(&mut self) {
        (**self).idle()
    }
}
