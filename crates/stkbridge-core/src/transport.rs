//! STK500v1 transport
//!
//! [`Stk500Transport`] frames commands, parses the `INSYNC ... OK` response
//! envelope and bounds every wait. It never retries: a timeout or a bad
//! response byte is reported to the caller, which owns any retry policy.
//!
//! Waits are short polls of [`PeerLink::read_available`] with
//! [`PeerLink::idle`] in between, capped by the configured windows.

use crate::config::{SessionConfig, TimingConfig};
use crate::error::{Error, Result};
use crate::link::{ControlLines, PeerLink};
use crate::protocol::*;
use heapless::Vec;

/// STK500v1 codec over a [`PeerLink`]
pub struct Stk500Transport<L: PeerLink> {
    link: L,
    timing: TimingConfig,
    opcodes: Opcodes,
    page_size: usize,
    /// Opcode of the exchange in flight, for error reporting
    last_opcode: u8,
}

impl<L: PeerLink> Stk500Transport<L> {
    /// Create a transport over `link` using the timing, geometry and
    /// opcodes in `config`
    pub fn new(link: L, config: &SessionConfig) -> Self {
        Self {
            link,
            timing: config.timing,
            opcodes: config.opcodes,
            page_size: config.target.page_size,
            last_opcode: 0,
        }
    }

    /// Borrow the underlying link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutably borrow the underlying link
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Consume the transport and return the link
    pub fn into_inner(self) -> L {
        self.link
    }

    /// Page size this transport writes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current link time in milliseconds
    pub fn now_ms(&mut self) -> u64 {
        self.link.now_ms()
    }

    // ---- Framing ----

    /// Send one command frame: opcode, payload, CRC_EOP
    pub fn send_command(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let mut frame: Vec<u8, MAX_FRAME_SIZE> = Vec::new();
        frame.push(opcode).map_err(|_| Error::InvalidAlignment)?;
        frame
            .extend_from_slice(payload)
            .map_err(|_| Error::InvalidAlignment)?;
        frame.push(CRC_EOP).map_err(|_| Error::InvalidAlignment)?;

        self.last_opcode = opcode;
        log::trace!("stk500: -> {:02X?}", &frame[..frame.len().min(8)]);
        self.link.write(&frame)
    }

    /// Wait up to `timeout_ms` for a single response byte equal to `expected`
    pub fn wait_for_response(&mut self, expected: u8, timeout_ms: u32) -> Result<()> {
        let opcode = self.last_opcode;
        let found = self
            .read_byte(timeout_ms)?
            .ok_or(Error::FrameTimeout { opcode })?;

        if found == expected {
            return Ok(());
        }

        log::debug!(
            "stk500: command 0x{:02X} got 0x{:02X}, expected 0x{:02X}",
            opcode,
            found,
            expected
        );
        if found == RESP_NOSYNC {
            Err(Error::NotInSync { opcode })
        } else {
            Err(Error::UnexpectedResponse {
                opcode,
                expected,
                found,
            })
        }
    }

    /// Send a command and read its `INSYNC, data..., OK` response
    ///
    /// `response` is filled with the data bytes between the envelope.
    pub fn exchange(
        &mut self,
        opcode: u8,
        payload: &[u8],
        response: &mut [u8],
        timeout_ms: u32,
    ) -> Result<()> {
        self.send_command(opcode, payload)?;
        self.wait_for_response(RESP_INSYNC, timeout_ms)?;
        if !response.is_empty() {
            self.read_exact(response, timeout_ms)?;
        }
        self.wait_for_response(RESP_OK, timeout_ms)
    }

    fn read_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>> {
        let mut byte = [0u8];
        let start = self.link.now_ms();
        loop {
            if self.link.read_available(&mut byte)? == 1 {
                return Ok(Some(byte[0]));
            }
            if self.link.now_ms().saturating_sub(start) >= timeout_ms as u64 {
                return Ok(None);
            }
            self.link.idle();
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<()> {
        let opcode = self.last_opcode;
        let start = self.link.now_ms();
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.link.read_available(&mut buf[filled..])?;
            filled += n;
            if n == 0 {
                if self.link.now_ms().saturating_sub(start) >= timeout_ms as u64 {
                    return Err(Error::FrameTimeout { opcode });
                }
                self.link.idle();
            }
        }
        Ok(())
    }

    /// Poll the link for `ms` milliseconds without sending anything
    pub fn wait_ms(&mut self, ms: u32) {
        let start = self.link.now_ms();
        while self.link.now_ms().saturating_sub(start) < ms as u64 {
            self.link.idle();
        }
    }

    // ---- Reset lines ----

    /// Drive DTR and RESET active: first step of the reset sequence
    pub fn assert_reset(&mut self) -> Result<()> {
        self.link.set_lines(ControlLines::RESET | ControlLines::DTR)
    }

    /// Release RESET while DTR stays asserted
    pub fn release_reset(&mut self) -> Result<()> {
        self.link.set_lines(ControlLines::DTR)
    }

    /// Release every control line
    pub fn release_lines(&mut self) -> Result<()> {
        self.link.set_lines(ControlLines::empty())
    }

    /// Run the complete reset sequence
    ///
    /// Pulses RESET with DTR held, then releases DTR. Afterwards the peer
    /// sits in its bootloader waiting for a handshake.
    pub fn pulse_reset(&mut self) -> Result<()> {
        self.assert_reset()?;
        self.wait_ms(self.timing.reset_pulse_ms);
        self.release_reset()?;
        self.wait_ms(self.timing.dtr_release_ms);
        self.release_lines()?;
        self.link.discard_input()
    }

    /// Reset the peer and leave it idling in its bootloader
    ///
    /// Used after any failure once page writes may have started, so the
    /// peer never runs a partially written image.
    pub fn park_in_bootloader(&mut self) -> Result<()> {
        log::info!("stk500: Parking peer in bootloader");
        self.pulse_reset()
    }

    // ---- Bootloader commands ----

    /// One GET_SYNC exchange, bounded by the sync window
    pub fn sync(&mut self) -> Result<()> {
        let timeout = self.timing.sync_timeout_ms;
        self.exchange(self.opcodes.get_sync, &[], &mut [], timeout)
    }

    /// ENTER_PROGMODE exchange
    pub fn enter_progmode(&mut self) -> Result<()> {
        let timeout = self.timing.frame_timeout_ms;
        self.exchange(self.opcodes.enter_progmode, &[], &mut [], timeout)
    }

    /// Read one bootloader parameter
    pub fn get_parameter(&mut self, parameter: u8) -> Result<u8> {
        let timeout = self.timing.frame_timeout_ms;
        let mut value = [0u8];
        self.exchange(self.opcodes.get_parameter, &[parameter], &mut value, timeout)?;
        Ok(value[0])
    }

    /// Read the three device signature bytes
    pub fn read_signature(&mut self) -> Result<[u8; 3]> {
        let timeout = self.timing.frame_timeout_ms;
        let mut signature = [0u8; 3];
        self.exchange(self.opcodes.read_sign, &[], &mut signature, timeout)?;
        Ok(signature)
    }

    /// Read the signature and compare it with `expected`
    pub fn check_signature(&mut self, expected: [u8; 3]) -> Result<()> {
        let found = self.read_signature()?;
        if found != expected {
            return Err(Error::SignatureMismatch { expected, found });
        }
        log::debug!("stk500: Signature {:02X?} OK", found);
        Ok(())
    }

    /// Reset the peer, wait for its bootloader and enter programming mode
    ///
    /// This is the blocking form of the handshake, bounded by the
    /// configured windows. Fails with [`Error::HandshakeTimeout`] if the
    /// bootloader never answers.
    pub fn enter_programming_mode(&mut self) -> Result<()> {
        self.pulse_reset()?;
        self.wait_ms(self.timing.bootloader_ready_ms);
        self.link.discard_input()?;

        let opcode = self.opcodes.get_sync;
        let window = self.timing.handshake_timeout_ms;
        match self.exchange(opcode, &[], &mut [], window) {
            Ok(()) => {}
            Err(e) if e.is_sync_failure() => {
                log::warn!("stk500: No handshake from bootloader ({})", e);
                return Err(Error::HandshakeTimeout);
            }
            Err(e) => return Err(e),
        }

        self.enter_progmode()?;
        log::info!("stk500: Entered programming mode");
        Ok(())
    }

    /// LEAVE_PROGMODE, then reset the peer into the new application
    pub fn exit_programming_mode(&mut self) -> Result<()> {
        let timeout = self.timing.frame_timeout_ms;
        self.exchange(self.opcodes.leave_progmode, &[], &mut [], timeout)?;
        self.pulse_reset()?;
        log::info!("stk500: Left programming mode");
        Ok(())
    }

    fn load_address(&mut self, address: u32) -> Result<()> {
        if address as usize >= MAX_FLASH_ADDRESS {
            return Err(Error::InvalidAlignment);
        }
        let timeout = self.timing.frame_timeout_ms;
        let payload = encode_word_address(address);
        self.exchange(self.opcodes.load_address, &payload, &mut [], timeout)
    }

    /// Write exactly one page at a page-aligned byte address
    pub fn flash_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size || address as usize % self.page_size != 0 {
            return Err(Error::InvalidAlignment);
        }

        self.load_address(address)?;

        let mut payload: Vec<u8, MAX_FRAME_SIZE> = Vec::new();
        payload
            .extend_from_slice(&encode_block_header(data.len()))
            .map_err(|_| Error::InvalidAlignment)?;
        payload
            .extend_from_slice(data)
            .map_err(|_| Error::InvalidAlignment)?;

        let timeout = self.timing.frame_timeout_ms;
        self.exchange(self.opcodes.prog_page, &payload, &mut [], timeout)?;
        log::trace!("stk500: Wrote page at 0x{:04X}", address);
        Ok(())
    }

    /// Read one page at a page-aligned byte address into `buf`
    pub fn read_page(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size || address as usize % self.page_size != 0 {
            return Err(Error::InvalidAlignment);
        }

        self.load_address(address)?;
        let timeout = self.timing.frame_timeout_ms;
        let header = encode_block_header(buf.len());
        self.exchange(self.opcodes.read_page, &header, buf, timeout)
    }

    /// Read back `length` bytes from address 0 and compare their CRC-32
    ///
    /// `length` is rounded up to whole pages. Returns
    /// [`Error::ChecksumMismatch`] on any difference.
    pub fn verify_flash(&mut self, length: usize, expected_crc: u32) -> Result<()> {
        let mut hasher = crc32fast::Hasher::new();
        let mut page = [0u8; MAX_PAGE_SIZE];
        let page_size = self.page_size;

        let mut address = 0usize;
        while address < length {
            self.read_page(address as u32, &mut page[..page_size])?;
            hasher.update(&page[..page_size]);
            address += page_size;
        }

        let actual = hasher.finalize();
        if actual != expected_crc {
            log::error!(
                "stk500: Verify failed, expected CRC 0x{:08X}, read 0x{:08X}",
                expected_crc,
                actual
            );
            return Err(Error::ChecksumMismatch {
                expected: expected_crc,
                actual,
            });
        }
        Ok(())
    }

    /// Forward raw bytes to the peer's application
    pub fn relay(&mut self, data: &[u8]) -> Result<()> {
        self.link.write(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    /// Link that replays canned peer output and records what was sent
    #[derive(Default)]
    struct ScriptedLink {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        lines: Vec<ControlLines>,
        clock: u64,
    }

    impl ScriptedLink {
        fn replying(bytes: &[u8]) -> Self {
            Self {
                rx: bytes.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl PeerLink for ScriptedLink {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.tx.extend_from_slice(data);
            Ok(())
        }

        fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn set_lines(&mut self, asserted: ControlLines) -> Result<()> {
            self.lines.push(asserted);
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

    fn transport(link: ScriptedLink) -> Stk500Transport<ScriptedLink> {
        Stk500Transport::new(link, &SessionConfig::default())
    }

    #[test]
    fn test_sync_frames_and_parses() {
        let mut t = transport(ScriptedLink::replying(&[RESP_INSYNC, RESP_OK]));
        t.sync().unwrap();
        assert_eq!(t.link().tx, [CMND_GET_SYNC, CRC_EOP]);
    }

    #[test]
    fn test_silent_peer_times_out() {
        let mut t = transport(ScriptedLink::default());
        assert_eq!(
            t.sync(),
            Err(Error::FrameTimeout {
                opcode: CMND_GET_SYNC
            })
        );
    }

    #[test]
    fn test_nosync_is_reported() {
        let mut t = transport(ScriptedLink::replying(&[RESP_NOSYNC]));
        assert_eq!(
            t.enter_progmode(),
            Err(Error::NotInSync {
                opcode: CMND_ENTER_PROGMODE
            })
        );
    }

    #[test]
    fn test_read_signature() {
        let mut t = transport(ScriptedLink::replying(&[
            RESP_INSYNC,
            0x1E,
            0x95,
            0x0F,
            RESP_OK,
        ]));
        assert_eq!(t.read_signature().unwrap(), SIGNATURE_ATMEGA328P);
    }

    #[test]
    fn test_signature_mismatch() {
        let mut t = transport(ScriptedLink::replying(&[
            RESP_INSYNC,
            0x1E,
            0x95,
            0x14,
            RESP_OK,
        ]));
        assert_eq!(
            t.check_signature(SIGNATURE_ATMEGA328P),
            Err(Error::SignatureMismatch {
                expected: SIGNATURE_ATMEGA328P,
                found: [0x1E, 0x95, 0x14],
            })
        );
    }

    #[test]
    fn test_flash_page_frames() {
        let mut t = transport(ScriptedLink::replying(&[
            RESP_INSYNC,
            RESP_OK,
            RESP_INSYNC,
            RESP_OK,
        ]));
        let page = [0xA5u8; 128];
        t.flash_page(0x100, &page).unwrap();

        let tx = &t.link().tx;
        assert_eq!(&tx[..4], &[CMND_LOAD_ADDRESS, 0x80, 0x00, CRC_EOP]);
        assert_eq!(&tx[4..8], &[CMND_PROG_PAGE, 0x00, 0x80, MEMTYPE_FLASH]);
        assert_eq!(&tx[8..136], &page[..]);
        assert_eq!(tx[136], CRC_EOP);
        assert_eq!(tx.len(), 137);
    }

    #[test]
    fn test_flash_page_rejects_partial_page() {
        let mut t = transport(ScriptedLink::default());
        assert_eq!(t.flash_page(0, &[0u8; 64]), Err(Error::InvalidAlignment));
        assert_eq!(t.flash_page(64, &[0u8; 128]), Err(Error::InvalidAlignment));
        assert!(t.link().tx.is_empty());
    }

    #[test]
    fn test_address_beyond_word_reach() {
        let mut t = transport(ScriptedLink::default());
        let page = [0u8; 128];
        assert_eq!(
            t.flash_page(MAX_FLASH_ADDRESS as u32, &page),
            Err(Error::InvalidAlignment)
        );
        assert!(t.link().tx.is_empty());
    }

    #[test]
    fn test_unexpected_byte() {
        let mut t = transport(ScriptedLink::replying(&[RESP_INSYNC, RESP_FAILED]));
        assert_eq!(
            t.sync(),
            Err(Error::UnexpectedResponse {
                opcode: CMND_GET_SYNC,
                expected: RESP_OK,
                found: RESP_FAILED,
            })
        );
    }

    #[test]
    fn test_pulse_reset_sequence() {
        let mut t = transport(ScriptedLink::default());
        t.pulse_reset().unwrap();
        assert_eq!(
            t.link().lines,
            [
                ControlLines::RESET | ControlLines::DTR,
                ControlLines::DTR,
                ControlLines::empty(),
            ]
        );
    }

    #[test]
    fn test_handshake_timeout() {
        let mut t = transport(ScriptedLink::default());
        assert_eq!(t.enter_programming_mode(), Err(Error::HandshakeTimeout));
    }
}
