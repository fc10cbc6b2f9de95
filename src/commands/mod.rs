//! CLI command implementations
//!
//! Commands that talk to the peer take an already opened link, so they run
//! the same against a serial port and the simulated peer.

pub mod flash;
pub mod images;
mod list;
pub mod peer;

pub use list::list_ports;
