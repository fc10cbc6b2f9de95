//! STK500 version 1 protocol constants and types
//!
//! This is the dialect spoken by Optiboot and the stock Arduino bootloaders.
//! Every command frame ends with [`CRC_EOP`]; every response is wrapped in
//! [`RESP_INSYNC`] ... [`RESP_OK`].

pub mod stk500;

pub use stk500::*;

/// Largest page size the codec can buffer
pub const MAX_PAGE_SIZE: usize = 256;

/// Largest command frame: opcode, 3 header bytes, one page, terminator
pub const MAX_FRAME_SIZE: usize = MAX_PAGE_SIZE + 8;

/// Command opcodes used by the bridge
///
/// The defaults are the STK500v1 values. They are kept as data so a board
/// whose bootloader deviates can be described in configuration instead of
/// patching the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Opcodes {
    /// Synchronization probe
    pub get_sync: u8,
    /// Read a bootloader parameter
    pub get_parameter: u8,
    /// Enter programming mode
    pub enter_progmode: u8,
    /// Leave programming mode and start the application
    pub leave_progmode: u8,
    /// Set the word address for the next page operation
    pub load_address: u8,
    /// Write one page
    pub prog_page: u8,
    /// Read one page
    pub read_page: u8,
    /// Read the three signature bytes
    pub read_sign: u8,
}

impl Default for Opcodes {
    fn default() -> Self {
        Self {
            get_sync: CMND_GET_SYNC,
            get_parameter: CMND_GET_PARAMETER,
            enter_progmode: CMND_ENTER_PROGMODE,
            leave_progmode: CMND_LEAVE_PROGMODE,
            load_address: CMND_LOAD_ADDRESS,
            prog_page: CMND_PROG_PAGE,
            read_page: CMND_READ_PAGE,
            read_sign: CMND_READ_SIGN,
        }
    }
}

/// Encode the size header used by PROG_PAGE and READ_PAGE (big endian)
pub fn encode_block_header(len: usize) -> [u8; 3] {
    [(len >> 8) as u8, len as u8, MEMTYPE_FLASH]
}

/// Flash bytes reachable through a 16-bit LOAD_ADDRESS word address
pub const MAX_FLASH_ADDRESS: usize = 0x20000;

/// Encode a byte address as the little-endian word address LOAD_ADDRESS takes
pub fn encode_word_address(byte_address: u32) -> [u8; 2] {
    let word = (byte_address >> 1) as u16;
    word.to_le_bytes()
}

/// Decode a LOAD_ADDRESS payload back to a byte address
pub fn decode_word_address(payload: [u8; 2]) -> u32 {
    (u16::from_le_bytes(payload) as u32) << 1
}
