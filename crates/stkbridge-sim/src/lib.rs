//! stkbridge-sim - Simulated STK500 bootloader peer
//!
//! [`SimulatedPeer`] implements [`PeerLink`] and behaves like a small AVR
//! board running Optiboot: the reset lines move it between its
//! application and its bootloader, and in the bootloader it answers
//! STK500v1 frames against an in-memory flash. Faults can be injected to
//! exercise the failure paths without hardware.

use std::collections::VecDeque;
use std::time::Instant;

use stkbridge_core::error::Result;
use stkbridge_core::link::{ControlLines, PeerLink};
use stkbridge_core::protocol::*;

/// Configuration for the simulated peer
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Flash page size
    pub page_size: usize,
    /// Application flash size
    pub flash_size: usize,
    /// Signature returned by READ_SIGN
    pub signature: [u8; 3],
    /// Virtual milliseconds that pass on every clock read
    pub tick_ms: u64,
    /// The bootloader starts the application after this much silence
    pub bootloader_timeout_ms: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            page_size: 128,
            flash_size: 32 * 1024 - 512,
            signature: SIGNATURE_ATMEGA328P,
            tick_ms: 1,
            bootloader_timeout_ms: Some(1000),
        }
    }
}

/// Misbehaviour to inject
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Never answer anything
    pub silent: bool,
    /// Ignore this many GET_SYNC frames before answering
    pub ignore_syncs: usize,
    /// Flip this flash byte when the page holding it is written
    pub corrupt_byte: Option<usize>,
    /// Go silent once this many pages were written
    pub fail_after_pages: Option<usize>,
}

/// What the simulated MCU is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Running its application firmware
    Application,
    /// RESET held active
    HeldInReset,
    /// Bootloader waiting for a handshake
    Bootloader,
    /// Bootloader after ENTER_PROGMODE
    Programming,
}

/// In-memory AVR board with an STK500v1 bootloader
pub struct SimulatedPeer {
    config: SimConfig,
    faults: Faults,
    flash: Vec<u8>,
    mode: PeerMode,
    lines: ControlLines,
    clock: u64,
    wall: Option<Instant>,
    last_activity: u64,
    /// Host bytes not yet parsed into a frame
    rx: Vec<u8>,
    /// Bytes waiting for the host
    tx: VecDeque<u8>,
    address: usize,
    page_writes: usize,
    reset_count: usize,
    relayed: Vec<u8>,
}

impl SimulatedPeer {
    /// Create a peer with erased flash, running its application
    pub fn new(config: SimConfig) -> Self {
        let flash = vec![0xFF; config.flash_size];
        Self {
            config,
            faults: Faults::default(),
            flash,
            mode: PeerMode::Application,
            lines: ControlLines::empty(),
            clock: 0,
            wall: None,
            last_activity: 0,
            rx: Vec::new(),
            tx: VecDeque::new(),
            address: 0,
            page_writes: 0,
            reset_count: 0,
            relayed: Vec::new(),
        }
    }

    /// Create a peer with default configuration
    pub fn new_default() -> Self {
        Self::new(SimConfig::default())
    }

    /// Preload flash with an existing firmware image
    pub fn with_firmware(mut self, image: &[u8]) -> Self {
        let len = image.len().min(self.flash.len());
        self.flash[..len].copy_from_slice(&image[..len]);
        self
    }

    /// Inject faults
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Follow the host's wall clock instead of a virtual one
    pub fn real_time(mut self) -> Self {
        self.wall = Some(Instant::now());
        self
    }

    /// Flash contents
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Number of PROG_PAGE frames accepted
    pub fn page_writes(&self) -> usize {
        self.page_writes
    }

    /// Number of times the peer came out of reset
    pub fn reset_count(&self) -> usize {
        self.reset_count
    }

    /// Current mode
    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    /// Bytes the application received from the host
    pub fn relayed(&self) -> &[u8] {
        &self.relayed
    }

    /// Currently asserted lines
    pub fn lines(&self) -> ControlLines {
        self.lines
    }

    /// Mutable access to the injected faults
    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    /// Move the virtual clock forward
    pub fn advance(&mut self, ms: u64) {
        self.clock += ms;
        self.check_watchdog();
    }

    fn check_watchdog(&mut self) {
        let Some(timeout) = self.config.bootloader_timeout_ms else {
            return;
        };
        let waiting = matches!(self.mode, PeerMode::Bootloader | PeerMode::Programming);
        if !waiting || self.clock.saturating_sub(self.last_activity) <= timeout {
            return;
        }

        if self.has_application() {
            log::debug!("sim: Bootloader timed out, starting application");
            self.mode = PeerMode::Application;
            self.rx.clear();
        } else {
            // Erased flash runs straight back into the boot section
            log::debug!("sim: Bootloader timed out, no application");
            self.mode = PeerMode::Bootloader;
            self.last_activity = self.clock;
        }
    }

    /// Whether the reset vector holds anything but erased flash
    pub fn has_application(&self) -> bool {
        self.flash.iter().take(2).any(|&b| b != 0xFF)
    }

    fn frame_len(&self) -> Option<usize> {
        let opcode = *self.rx.first()?;
        let len = match opcode {
            CMND_GET_PARAMETER => 3,
            CMND_LOAD_ADDRESS => 4,
            CMND_READ_PAGE => 5,
            CMND_PROG_PAGE => {
                if self.rx.len() < 3 {
                    return None;
                }
                5 + u16::from_be_bytes([self.rx[1], self.rx[2]]) as usize
            }
            _ => 2,
        };
        Some(len)
    }

    fn process(&mut self) {
        while let Some(len) = self.frame_len() {
            if self.rx.len() < len {
                break;
            }
            let frame: Vec<u8> = self.rx.drain(..len).collect();
            self.handle(&frame);
        }
    }

    fn reply(&mut self, data: &[u8]) {
        self.tx.push_back(RESP_INSYNC);
        self.tx.extend(data.iter().copied());
        self.tx.push_back(RESP_OK);
    }

    fn handle(&mut self, frame: &[u8]) {
        if self.faults.silent {
            return;
        }
        if frame.last() != Some(&CRC_EOP) {
            log::debug!("sim: Frame without EOP: {:02X?}", frame);
            self.tx.push_back(RESP_NOSYNC);
            return;
        }
        self.last_activity = self.clock;

        match frame[0] {
            CMND_GET_SYNC => {
                if self.faults.ignore_syncs > 0 {
                    self.faults.ignore_syncs -= 1;
                    return;
                }
                self.reply(&[]);
            }
            CMND_GET_PARAMETER => {
                let value = match frame[1] {
                    PARM_HW_VER => 0x03,
                    PARM_SW_MAJOR => 0x08,
                    PARM_SW_MINOR => 0x00,
                    _ => 0x03,
                };
                self.reply(&[value]);
            }
            CMND_ENTER_PROGMODE => {
                self.mode = PeerMode::Programming;
                self.reply(&[]);
            }
            CMND_LEAVE_PROGMODE => {
                self.reply(&[]);
                self.mode = PeerMode::Application;
            }
            CMND_LOAD_ADDRESS => {
                self.address = decode_word_address([frame[1], frame[2]]) as usize;
                self.reply(&[]);
            }
            CMND_READ_SIGN => {
                let signature = self.config.signature;
                self.reply(&signature);
            }
            CMND_PROG_PAGE => self.program_page(&frame[4..frame.len() - 1]),
            CMND_READ_PAGE => {
                let size = u16::from_be_bytes([frame[1], frame[2]]) as usize;
                let end = self.address + size;
                if end > self.flash.len() {
                    self.tx.push_back(RESP_INSYNC);
                    self.tx.push_back(RESP_FAILED);
                    return;
                }
                let data = self.flash[self.address..end].to_vec();
                self.reply(&data);
            }
            _ => self.reply(&[]),
        }
    }

    fn program_page(&mut self, data: &[u8]) {
        if let Some(limit) = self.faults.fail_after_pages {
            if self.page_writes >= limit {
                log::debug!("sim: Dropping off the line after {} pages", limit);
                self.faults.silent = true;
                return;
            }
        }

        let start = self.address;
        let end = start + data.len();
        if data.len() != self.config.page_size || end > self.flash.len() {
            self.tx.push_back(RESP_INSYNC);
            self.tx.push_back(RESP_FAILED);
            return;
        }

        self.flash[start..end].copy_from_slice(data);
        if let Some(index) = self.faults.corrupt_byte {
            if (start..end).contains(&index) {
                self.flash[index] ^= 0xFF;
            }
        }
        self.page_writes += 1;
        self.reply(&[]);
    }
}

impl PeerLink for SimulatedPeer {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.mode {
            PeerMode::HeldInReset => {}
            PeerMode::Application => self.relayed.extend_from_slice(data),
            PeerMode::Bootloader | PeerMode::Programming => {
                self.rx.extend_from_slice(data);
                self.process();
            }
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_lines(&mut self, asserted: ControlLines) -> Result<()> {
        let was_held = self.lines.contains(ControlLines::RESET);
        self.lines = asserted;

        if asserted.contains(ControlLines::RESET) {
            self.mode = PeerMode::HeldInReset;
            self.rx.clear();
            self.tx.clear();
        } else if was_held {
            log::trace!("sim: Out of reset, bootloader running");
            self.mode = PeerMode::Bootloader;
            self.reset_count += 1;
            self.last_activity = self.clock;
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.tx.clear();
        Ok(())
    }

    fn now_ms(&mut self) -> u64 {
        match self.wall {
            Some(start) => self.clock = start.elapsed().as_millis() as u64,
            None => self.clock += self.config.tick_ms,
        }
        self.check_watchdog();
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot(peer: &mut SimulatedPeer) {
        peer.set_lines(ControlLines::RESET | ControlLines::DTR).unwrap();
        peer.set_lines(ControlLines::empty()).unwrap();
    }

    fn read_all(peer: &mut SimulatedPeer) -> Vec<u8> {
        let mut buf = [0u8; 512];
        let n = peer.read_available(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn test_reset_enters_bootloader() {
        let mut peer = SimulatedPeer::new_default();
        assert_eq!(peer.mode(), PeerMode::Application);
        boot(&mut peer);
        assert_eq!(peer.mode(), PeerMode::Bootloader);
        assert_eq!(peer.reset_count(), 1);

        peer.write(&[CMND_GET_SYNC, CRC_EOP]).unwrap();
        assert_eq!(read_all(&mut peer), vec![RESP_INSYNC, RESP_OK]);
    }

    #[test]
    fn test_bootloader_times_out() {
        let mut peer = SimulatedPeer::new_default().with_firmware(&[0x0C, 0x94, 0x34, 0x00]);
        boot(&mut peer);
        peer.advance(1500);
        assert_eq!(peer.mode(), PeerMode::Application);

        peer.write(b"ping").unwrap();
        assert_eq!(peer.relayed(), b"ping");
    }

    #[test]
    fn test_erased_flash_stays_in_bootloader() {
        let mut peer = SimulatedPeer::new_default();
        assert!(!peer.has_application());
        boot(&mut peer);
        peer.advance(5000);
        assert_eq!(peer.mode(), PeerMode::Bootloader);

        peer.write(&[CMND_GET_SYNC, CRC_EOP]).unwrap();
        assert_eq!(read_all(&mut peer), vec![RESP_INSYNC, RESP_OK]);
    }

    #[test]
    fn test_missing_eop_is_nosync() {
        let mut peer = SimulatedPeer::new_default();
        boot(&mut peer);
        peer.write(&[CMND_GET_SYNC, 0x00]).unwrap();
        assert_eq!(read_all(&mut peer), vec![RESP_NOSYNC]);
    }

    #[test]
    fn test_program_and_read_page() {
        let mut peer = SimulatedPeer::new_default();
        boot(&mut peer);

        let addr = encode_word_address(256);
        peer.write(&[CMND_LOAD_ADDRESS, addr[0], addr[1], CRC_EOP])
            .unwrap();

        let mut frame = vec![CMND_PROG_PAGE, 0x00, 0x80, MEMTYPE_FLASH];
        frame.extend(std::iter::repeat(0xA5).take(128));
        frame.push(CRC_EOP);
        // Arrives in two pieces
        peer.write(&frame[..40]).unwrap();
        peer.write(&frame[40..]).unwrap();

        assert_eq!(peer.page_writes(), 1);
        assert!(peer.flash()[256..384].iter().all(|&b| b == 0xA5));
        assert_eq!(peer.flash()[255], 0xFF);
        assert_eq!(
            read_all(&mut peer),
            vec![RESP_INSYNC, RESP_OK, RESP_INSYNC, RESP_OK]
        );
    }
}
