//! stkbridge-serial - Serial port link to the peer
//!
//! [`SerialLink`] implements [`PeerLink`] on top of the `serialport`
//! crate. RESET is driven through RTS and DTR through DTR, matching the
//! usual USB-serial adapter wiring of Arduino style boards.

pub mod error;

pub use error::{Result, SerialError};

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use stkbridge_core::link::{ControlLines, PeerLink};

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub device: String,
    /// Baud rate of the bootloader
    pub baud: u32,
    /// Lines are active high (wired through an inverting transistor)
    pub invert_lines: bool,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud: 57600,
            invert_lines: false,
        }
    }
}

/// Port levels for a set of asserted control lines, as (RTS, DTR)
///
/// `serialport` levels are logical: `true` drives the line active (low on
/// the wire) on a plain adapter.
fn line_levels(asserted: ControlLines, invert: bool) -> (bool, bool) {
    let rts = asserted.contains(ControlLines::RESET);
    let dtr = asserted.contains(ControlLines::DTR);
    (rts != invert, dtr != invert)
}

/// Open serial port wired to the peer
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    device: String,
    invert_lines: bool,
    epoch: Instant,
}

impl SerialLink {
    /// Open the port described by `options`, 8N1 without flow control
    pub fn open(options: &SerialOptions) -> Result<Self> {
        let port = serialport::new(&options.device, options.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|source| SerialError::Open {
                device: options.device.clone(),
                source,
            })?;

        log::info!(
            "Opened serial port {} at {} baud",
            options.device,
            options.baud
        );

        let mut link = Self {
            port,
            device: options.device.clone(),
            invert_lines: options.invert_lines,
            epoch: Instant::now(),
        };
        link.apply_lines(ControlLines::empty())?;
        Ok(link)
    }

    /// Device path this link was opened on
    pub fn device(&self) -> &str {
        &self.device
    }

    fn apply_lines(&mut self, asserted: ControlLines) -> Result<()> {
        let (rts, dtr) = line_levels(asserted, self.invert_lines);
        self.port.write_request_to_send(rts)?;
        self.port.write_data_terminal_ready(dtr)?;
        Ok(())
    }

    fn link_error(&self, err: SerialError) -> stkbridge_core::Error {
        log::error!("{}: {}", self.device, err);
        stkbridge_core::Error::LinkError
    }
}

impl PeerLink for SerialLink {
    fn write(&mut self, data: &[u8]) -> stkbridge_core::Result<()> {
        let result = self.port.write_all(data).and_then(|_| self.port.flush());
        result.map_err(|e| self.link_error(e.into()))
    }

    fn read_available(&mut self, buf: &mut [u8]) -> stkbridge_core::Result<usize> {
        let pending = match self.port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => return Err(self.link_error(e.into())),
        };
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }

        let len = pending.min(buf.len());
        match self.port.read(&mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(self.link_error(e.into())),
        }
    }

    fn set_lines(&mut self, asserted: ControlLines) -> stkbridge_core::Result<()> {
        log::trace!("{}: lines {:?}", self.device, asserted);
        self.apply_lines(asserted).map_err(|e| self.link_error(e))
    }

    fn discard_input(&mut self) -> stkbridge_core::Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| self.link_error(e.into()))
    }

    fn now_ms(&mut self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn idle(&mut self) {
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// Names of the serial ports present on this machine
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
