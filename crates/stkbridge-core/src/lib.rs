//! stkbridge-core - Core library for the firmware flashing bridge
//!
//! This crate contains everything needed to reprogram a serially attached
//! microcontroller through its STK500 bootloader while the host keeps
//! servicing other work from the same control loop. It is `no_std`
//! compatible and performs no I/O of its own: the serial link and the
//! peer's reset lines are reached through the [`link::PeerLink`] trait.
//!
//! # Layout
//!
//! - [`protocol`] - STK500v1 opcodes and response bytes
//! - [`transport`] - framing, bounded waits and page operations
//! - [`ingest`] - arbitrarily chunked upload bytes reassembled into pages
//! - [`progress`] - progress snapshots and observers
//! - [`session`] - the programming state machine
//!
//! # Features
//!
//! - `std` - Enable standard library support (`std::error::Error`, serde)
//! - `serde` - Serialize snapshots and configuration
//!
//! # Example
//!
//! ```ignore
//! use stkbridge_core::config::SessionConfig;
//! use stkbridge_core::session::ProgrammingSession;
//!
//! let mut session = ProgrammingSession::new(link, SessionConfig::default())?;
//! session.start(image.len())?;
//! let mut offset = 0;
//! while !session.state().is_terminal() {
//!     if offset < image.len() {
//!         offset += session.feed(&image[offset..])?;
//!         if offset == image.len() {
//!             session.end_upload()?;
//!         }
//!     }
//!     session.poll();
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod config;
pub mod error;
pub mod ingest;
pub mod link;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use progress::{ProgrammingState, ProgressSnapshot};
pub use session::ProgrammingSession;
