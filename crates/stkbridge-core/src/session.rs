//! Programming session state machine
//!
//! ```text
//! IDLE --start--> CONNECTING --handshake ok--> UPLOADING --all pages--> VERIFYING --match--> COMPLETE
//!                      |                          |                         |
//!                      +------ failure -----------+------ failure ----------+---> ERROR
//! ```
//!
//! The session shares a cooperative control loop with other work, so it
//! never blocks for long: [`ProgrammingSession::poll`] performs at most one
//! bounded exchange with the peer (one sync, one page write or one page
//! read) and at most one state transition per call. Upload bytes are
//! pushed in with [`ProgrammingSession::feed`] as they arrive and written
//! page by page, so the image never needs to be held in full.
//!
//! Page 0 holds the reset vector. For images longer than one page it is
//! written as an erased page first and with its real contents last, so a
//! peer interrupted half way has no application to start and stays in
//! its bootloader. Once page writes may have started, every failure parks
//! the peer there, erasing page 0 again if its real contents were already
//! written. A new [`ProgrammingSession::start`] is required to try again.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::ingest::{PageBuffer, UploadIngest};
use crate::link::PeerLink;
use crate::progress::{
    NoProgress, ProgrammingState, ProgressObserver, ProgressReporter, ProgressSnapshot,
};
use crate::protocol::MAX_PAGE_SIZE;
use crate::transport::Stk500Transport;
use crc32fast::Hasher;

/// Sub-steps of CONNECTING
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectStep {
    /// RESET and DTR asserted
    ResetHeld { since: u64 },
    /// RESET released, DTR still asserted
    ResetReleased { since: u64 },
    /// All lines released, bootloader starting up
    Booting { since: u64 },
    /// Probing with GET_SYNC
    Syncing { attempt: u8, since: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting(ConnectStep),
    Uploading {
        next_address: u32,
        last_exchange_ms: u64,
    },
    Verifying {
        next_address: u32,
    },
    Complete,
    Error,
}

impl Phase {
    fn state(&self) -> ProgrammingState {
        match self {
            Phase::Idle => ProgrammingState::Idle,
            Phase::Connecting(_) => ProgrammingState::Connecting,
            Phase::Uploading { .. } => ProgrammingState::Uploading,
            Phase::Verifying { .. } => ProgrammingState::Verifying,
            Phase::Complete => ProgrammingState::Complete,
            Phase::Error => ProgrammingState::Error,
        }
    }
}

/// Contents of an erased flash page
const ERASED_PAGE: [u8; MAX_PAGE_SIZE] = [0xFF; MAX_PAGE_SIZE];

fn elapsed(now: u64, since: u64, window_ms: u32) -> bool {
    now.saturating_sub(since) >= window_ms as u64
}

/// Drives one peer through handshake, page writes, verification and restart
///
/// There is one session per serial link. While it is active, the link is
/// unavailable for anything else: [`start`](Self::start),
/// [`reset`](Self::reset), [`relay`](Self::relay) and
/// [`link_mut`](Self::link_mut) all fail with [`Error::Busy`].
pub struct ProgrammingSession<L: PeerLink, O: ProgressObserver = NoProgress> {
    transport: Stk500Transport<L>,
    config: SessionConfig,
    phase: Phase,
    ingest: Option<UploadIngest>,
    /// CRC-32 of every page written, padding included
    written_crc: Hasher,
    /// CRC-32 of the region read back during verification
    readback_crc: Hasher,
    pages_written: usize,
    bytes_total: usize,
    bytes_written: usize,
    last_feed_ms: u64,
    error: Option<Error>,
    /// Real page 0, held back until every other page is on the peer
    boot_page: Option<PageBuffer>,
    /// The peer holds the new page 0, so a failure must erase it again
    boot_page_written: bool,
    park_pending: bool,
    reporter: ProgressReporter<O>,
}

impl<L: PeerLink> ProgrammingSession<L, NoProgress> {
    /// Create an idle session without a progress observer
    pub fn new(link: L, config: SessionConfig) -> Result<Self> {
        Self::with_observer(link, config, NoProgress)
    }
}

impl<L: PeerLink, O: ProgressObserver> ProgrammingSession<L, O> {
    /// Create an idle session that pushes every snapshot to `observer`
    pub fn with_observer(link: L, config: SessionConfig, observer: O) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport: Stk500Transport::new(link, &config),
            config,
            phase: Phase::Idle,
            ingest: None,
            written_crc: Hasher::new(),
            readback_crc: Hasher::new(),
            pages_written: 0,
            bytes_total: 0,
            bytes_written: 0,
            last_feed_ms: 0,
            error: None,
            boot_page: None,
            boot_page_written: false,
            park_pending: false,
            reporter: ProgressReporter::new(observer),
        })
    }

    /// Current state
    pub fn state(&self) -> ProgrammingState {
        self.phase.state()
    }

    /// Whether the session currently owns the serial link
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Latest progress snapshot
    pub fn progress(&self) -> &ProgressSnapshot {
        self.reporter.snapshot()
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of pages written by the current or last session
    pub fn pages_written(&self) -> usize {
        self.pages_written
    }

    /// Borrow the link
    pub fn link(&self) -> &L {
        self.transport.link()
    }

    /// Mutably borrow the link, unless a session owns it
    pub fn link_mut(&mut self) -> Result<&mut L> {
        if self.is_active() {
            return Err(Error::Busy);
        }
        Ok(self.transport.link_mut())
    }

    /// Borrow the progress observer
    pub fn observer(&self) -> &O {
        self.reporter.observer()
    }

    /// Mutably borrow the progress observer
    pub fn observer_mut(&mut self) -> &mut O {
        self.reporter.observer_mut()
    }

    /// Consume the session and return the link
    pub fn into_link(self) -> L {
        self.transport.into_inner()
    }

    // ---- Commands ----

    /// Begin programming an image of `total` bytes
    ///
    /// Starts the reset sequence; bytes may be fed right away. Fails with
    /// [`Error::Busy`] and leaves the running session untouched if one is
    /// active.
    pub fn start(&mut self, total: usize) -> Result<()> {
        if self.is_active() {
            log::warn!("session: Start rejected, {} in progress", self.state());
            return Err(Error::Busy);
        }
        if total == 0 {
            return Err(Error::EmptyImage);
        }
        let capacity = self.config.target.flash_size;
        if total > capacity {
            return Err(Error::ImageTooLarge {
                size: total,
                capacity,
            });
        }

        self.ingest = Some(UploadIngest::begin(total));
        self.written_crc = Hasher::new();
        self.readback_crc = Hasher::new();
        self.pages_written = 0;
        self.bytes_total = total;
        self.bytes_written = 0;
        self.error = None;
        self.boot_page = None;
        self.boot_page_written = false;
        self.park_pending = false;

        let now = self.transport.now_ms();
        self.last_feed_ms = now;
        log::info!("session: Programming {} byte image", total);

        if let Err(e) = self.transport.assert_reset() {
            self.fail(e);
            return Err(e);
        }
        self.enter(Phase::Connecting(ConnectStep::ResetHeld { since: now }));
        Ok(())
    }

    /// Push upload bytes into the session
    ///
    /// Returns how many bytes were accepted; the rest should be offered
    /// again after a later [`poll`](Self::poll).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<usize> {
        let now = self.transport.now_ms();
        let result = match self.ingest.as_mut() {
            Some(ingest) => ingest.chunk(bytes),
            None => return Err(self.no_upload_error()),
        };

        match result {
            Ok(taken) => {
                if taken > 0 {
                    self.last_feed_ms = now;
                }
                Ok(taken)
            }
            Err(e) => {
                self.fail(e);
                Err(e)
            }
        }
    }

    /// Mark the upload finished
    ///
    /// Fails the session with [`Error::UploadAborted`] if fewer bytes than
    /// declared were fed.
    pub fn end_upload(&mut self) -> Result<()> {
        let result = match self.ingest.as_mut() {
            Some(ingest) => ingest.end(),
            None => return Err(self.no_upload_error()),
        };

        if let Err(e) = result {
            self.fail(e);
            return Err(e);
        }
        Ok(())
    }

    /// Cancel the session
    ///
    /// Forces `ERROR` with [`Error::UploadAborted`] from any non-terminal
    /// state. No further pages are written; if writes had started, the next
    /// [`poll`](Self::poll) parks the peer in its bootloader.
    pub fn abort(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        log::warn!("session: Abort requested in {}", self.state());
        self.fail(Error::UploadAborted);
    }

    /// Return a finished or failed session to `IDLE`
    ///
    /// Runs the peer's reset sequence without entering programming mode.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(Error::Busy);
        }

        // A failure not yet parked still gets its page 0 erased
        self.poll_parking();
        self.transport.pulse_reset()?;

        self.ingest = None;
        self.pages_written = 0;
        self.bytes_total = 0;
        self.bytes_written = 0;
        self.error = None;
        self.enter(Phase::Idle);
        Ok(())
    }

    /// Forward unrelated traffic to the peer while no session is active
    pub fn relay(&mut self, data: &[u8]) -> Result<()> {
        if self.is_active() {
            return Err(Error::Busy);
        }
        self.transport.relay(data)
    }

    /// Advance the session by at most one step
    pub fn poll(&mut self) -> ProgrammingState {
        let phase = self.phase;
        match phase {
            Phase::Connecting(step) => self.poll_connecting(step),
            Phase::Uploading {
                next_address,
                last_exchange_ms,
            } => self.poll_uploading(next_address, last_exchange_ms),
            Phase::Verifying { next_address } => self.poll_verifying(next_address),
            Phase::Idle | Phase::Complete | Phase::Error => self.poll_parking(),
        }
        self.state()
    }

    // ---- Steps ----

    fn poll_connecting(&mut self, step: ConnectStep) {
        let timing = self.config.timing;
        let now = self.transport.now_ms();

        let next = match step {
            ConnectStep::ResetHeld { since } => {
                if !elapsed(now, since, timing.reset_pulse_ms) {
                    return;
                }
                self.transport
                    .release_reset()
                    .map(|_| ConnectStep::ResetReleased { since: now })
            }
            ConnectStep::ResetReleased { since } => {
                if !elapsed(now, since, timing.dtr_release_ms) {
                    return;
                }
                self.transport
                    .release_lines()
                    .map(|_| ConnectStep::Booting { since: now })
            }
            ConnectStep::Booting { since } => {
                if !elapsed(now, since, timing.bootloader_ready_ms) {
                    return;
                }
                log::debug!("session: Bootloader window elapsed, syncing");
                self.transport
                    .link_mut()
                    .discard_input()
                    .map(|_| ConnectStep::Syncing {
                        attempt: 0,
                        since: now,
                    })
            }
            ConnectStep::Syncing { attempt, since } => {
                return self.poll_handshake(attempt, since, now);
            }
        };

        match next {
            Ok(step) => self.phase = Phase::Connecting(step),
            Err(e) => self.fail(e),
        }
    }

    fn poll_handshake(&mut self, attempt: u8, since: u64, now: u64) {
        let timing = self.config.timing;
        if attempt >= timing.handshake_attempts || elapsed(now, since, timing.handshake_timeout_ms)
        {
            log::error!("session: No answer to {} sync attempts", attempt);
            return self.fail(Error::HandshakeTimeout);
        }

        match self.transport.sync() {
            Ok(()) => {}
            Err(e) if e.is_sync_failure() => {
                log::debug!("session: Sync attempt {} failed: {}", attempt + 1, e);
                if let Err(e) = self.transport.link_mut().discard_input() {
                    return self.fail(e);
                }
                self.phase = Phase::Connecting(ConnectStep::Syncing {
                    attempt: attempt + 1,
                    since,
                });
                return;
            }
            Err(e) => return self.fail(e),
        }

        if let Err(e) = self.enter_progmode() {
            return self.fail(e);
        }

        let now = self.transport.now_ms();
        self.enter(Phase::Uploading {
            next_address: 0,
            last_exchange_ms: now,
        });
    }

    fn enter_progmode(&mut self) -> Result<()> {
        self.transport.enter_progmode()?;
        if let Some(signature) = self.config.target.signature {
            self.transport.check_signature(signature)?;
        }
        Ok(())
    }

    fn poll_uploading(&mut self, next_address: u32, last_exchange_ms: u64) {
        let timing = self.config.timing;
        let page_size = self.config.target.page_size;
        let now = self.transport.now_ms();

        let page = match self.ingest.as_mut() {
            Some(ingest) => ingest.next_page(page_size, next_address),
            None => return self.fail(Error::UploadAborted),
        };

        if let Some(page) = page {
            self.written_crc.update(page.data());

            if page.address == 0 && self.bytes_total > page_size {
                if let Err(e) = self.transport.flash_page(0, &ERASED_PAGE[..page_size]) {
                    return self.fail(e);
                }
                log::debug!("session: Page 0 erased, holding it back until last");
                self.boot_page = Some(page);
                self.phase = Phase::Uploading {
                    next_address: page_size as u32,
                    last_exchange_ms: now,
                };
                return;
            }

            if let Err(e) = self.transport.flash_page(page.address, page.data()) {
                return self.fail(e);
            }
            self.boot_page_written |= page.address == 0;
            self.pages_written += 1;
            self.bytes_written = (self.bytes_written + page_size).min(self.bytes_total);
            log::debug!(
                "session: Page {} at 0x{:04X} written ({}/{} bytes)",
                self.pages_written,
                page.address,
                self.bytes_written,
                self.bytes_total
            );

            self.phase = Phase::Uploading {
                next_address: next_address + page_size as u32,
                last_exchange_ms: now,
            };
            self.publish();
            return;
        }

        if self.ingest.as_ref().is_some_and(|i| i.is_drained()) {
            if let Some(page) = self.boot_page.take() {
                return self.write_boot_page(page);
            }
            self.readback_crc = Hasher::new();
            self.enter(Phase::Verifying { next_address: 0 });
            return;
        }

        if elapsed(now, self.last_feed_ms, timing.upload_idle_timeout_ms) {
            log::warn!(
                "session: No upload data for {} ms",
                now.saturating_sub(self.last_feed_ms)
            );
            return self.fail(Error::UploadAborted);
        }

        // The bootloader gives up after about a second of silence
        if elapsed(now, last_exchange_ms, timing.keepalive_ms) {
            if let Err(e) = self.transport.sync() {
                return self.fail(e);
            }
            log::trace!("session: Keep-alive sync");
            let now = self.transport.now_ms();
            self.phase = Phase::Uploading {
                next_address,
                last_exchange_ms: now,
            };
        }
    }

    fn write_boot_page(&mut self, page: PageBuffer) {
        if let Err(e) = self.transport.flash_page(0, page.data()) {
            return self.fail(e);
        }
        self.boot_page_written = true;
        self.pages_written += 1;
        self.bytes_written = (self.bytes_written + page.data().len()).min(self.bytes_total);
        log::debug!("session: Page 0 written last");

        let now = self.transport.now_ms();
        if let Phase::Uploading { next_address, .. } = self.phase {
            self.phase = Phase::Uploading {
                next_address,
                last_exchange_ms: now,
            };
        }
        self.publish();
    }

    fn poll_verifying(&mut self, next_address: u32) {
        let page_size = self.config.target.page_size;
        let region = self.pages_written * page_size;

        if (next_address as usize) < region {
            let mut buf = [0u8; MAX_PAGE_SIZE];
            let page = &mut buf[..page_size];
            if let Err(e) = self.transport.read_page(next_address, page) {
                return self.fail(e);
            }
            self.readback_crc.update(page);
            self.phase = Phase::Verifying {
                next_address: next_address + page_size as u32,
            };
            return;
        }

        let expected = self.written_crc.clone().finalize();
        let actual = self.readback_crc.clone().finalize();
        if expected != actual {
            return self.fail(Error::ChecksumMismatch { expected, actual });
        }

        log::info!(
            "session: Verified {} bytes (CRC 0x{:08X})",
            region,
            expected
        );
        self.ingest = None;
        self.boot_page_written = false;
        self.enter(Phase::Complete);

        if let Err(e) = self.transport.exit_programming_mode() {
            log::warn!("session: Failed to leave programming mode: {}", e);
        }
    }

    fn poll_parking(&mut self) {
        if !self.park_pending {
            return;
        }
        self.park_pending = false;

        if self.boot_page_written {
            self.boot_page_written = false;
            let erased = &ERASED_PAGE[..self.config.target.page_size];
            match self.transport.flash_page(0, erased) {
                Ok(()) => log::info!("session: Page 0 erased, peer has no application"),
                Err(e) => log::error!("session: Failed to erase page 0: {}", e),
            }
        }
        if let Err(e) = self.transport.park_in_bootloader() {
            log::error!("session: Failed to park peer: {}", e);
        }
    }

    // ---- Bookkeeping ----

    fn no_upload_error(&self) -> Error {
        match self.state() {
            ProgrammingState::Error => Error::UploadAborted,
            _ => Error::InvalidState,
        }
    }

    fn fail(&mut self, error: Error) {
        let from = self.phase;
        match from {
            Phase::Connecting(_) => {
                if let Err(e) = self.transport.release_lines() {
                    log::warn!("session: Failed to release reset lines: {}", e);
                }
            }
            Phase::Uploading { .. } | Phase::Verifying { .. } => self.park_pending = true,
            Phase::Idle | Phase::Complete | Phase::Error => {}
        }

        if let Some(ingest) = self.ingest.as_mut() {
            ingest.abort();
        }
        self.ingest = None;
        self.boot_page = None;
        self.error = Some(error);
        log::error!("session: Failed in {}: {}", from.state(), error);
        self.enter(Phase::Error);
    }

    fn enter(&mut self, phase: Phase) {
        let from = self.phase.state();
        let to = phase.state();
        self.phase = phase;
        if from != to {
            log::info!("session: {} -> {}", from, to);
        }
        self.publish();
    }

    fn publish(&mut self) {
        let snapshot = ProgressSnapshot::new(
            self.state(),
            self.bytes_total,
            self.bytes_written,
            self.error,
        );
        self.reporter.publish(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ControlLines;

    /// A peer that never answers
    #[derive(Default)]
    struct SilentLink {
        clock: u64,
        written: usize,
    }

    impl PeerLink for SilentLink {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.written += data.len();
            Ok(())
        }

        fn read_available(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn set_lines(&mut self, _asserted: ControlLines) -> Result<()> {
            Ok(())
        }

        fn discard_input(&mut self) -> Result<()> {
            Ok(())
        }

        fn now_ms(&mut self) -> u64 {
            self.clock += 1;
            self.clock
        }
    }

    fn session() -> ProgrammingSession<SilentLink> {
        ProgrammingSession::new(SilentLink::default(), SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_start_validates_size() {
        let mut s = session();
        assert_eq!(s.start(0), Err(Error::EmptyImage));
        assert_eq!(
            s.start(40_000),
            Err(Error::ImageTooLarge {
                size: 40_000,
                capacity: 32_256
            })
        );
        assert_eq!(s.state(), ProgrammingState::Idle);
    }

    #[test]
    fn test_second_start_is_busy() {
        let mut s = session();
        s.start(1024).unwrap();
        assert_eq!(s.state(), ProgrammingState::Connecting);
        assert_eq!(s.start(512), Err(Error::Busy));
        assert_eq!(s.state(), ProgrammingState::Connecting);
        assert_eq!(s.progress().bytes_total, 1024);
        assert_eq!(s.reset(), Err(Error::Busy));
        assert_eq!(s.relay(b"{}"), Err(Error::Busy));
        assert!(s.link_mut().is_err());
    }

    #[test]
    fn test_silent_peer_handshake_timeout() {
        let mut s = session();
        s.start(256).unwrap();
        for _ in 0..10_000 {
            if s.poll().is_terminal() {
                break;
            }
        }
        assert_eq!(s.state(), ProgrammingState::Error);
        assert_eq!(s.progress().error, Some(Error::HandshakeTimeout));
        assert_eq!(s.pages_written(), 0);
        assert_eq!(s.progress().bytes_written, 0);
    }

    #[test]
    fn test_abort_from_idle_and_recover() {
        let mut s = session();
        s.abort();
        assert_eq!(s.state(), ProgrammingState::Error);
        assert_eq!(s.progress().error, Some(Error::UploadAborted));

        s.reset().unwrap();
        assert_eq!(s.state(), ProgrammingState::Idle);
        assert!(s.start(128).is_ok());
    }

    #[test]
    fn test_feed_without_upload() {
        let mut s = session();
        assert_eq!(s.feed(&[1, 2, 3]), Err(Error::InvalidState));
    }
}
