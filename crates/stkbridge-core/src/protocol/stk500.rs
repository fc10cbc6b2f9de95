//! STK500v1 command and response bytes

/// Response: command framing understood
pub const RESP_INSYNC: u8 = 0x14;
/// Response: command completed
pub const RESP_OK: u8 = 0x10;
/// Response: command failed
pub const RESP_FAILED: u8 = 0x11;
/// Response: frame terminator missing, peer is out of sync
pub const RESP_NOSYNC: u8 = 0x15;

/// Frame terminator appended to every command
pub const CRC_EOP: u8 = 0x20;

/// Synchronization probe
pub const CMND_GET_SYNC: u8 = 0x30;
/// Read a bootloader parameter
pub const CMND_GET_PARAMETER: u8 = 0x41;
/// Set device programming parameters
pub const CMND_SET_DEVICE: u8 = 0x42;
/// Enter programming mode
pub const CMND_ENTER_PROGMODE: u8 = 0x50;
/// Leave programming mode
pub const CMND_LEAVE_PROGMODE: u8 = 0x51;
/// Load word address
pub const CMND_LOAD_ADDRESS: u8 = 0x55;
/// Program a page
pub const CMND_PROG_PAGE: u8 = 0x64;
/// Read a page
pub const CMND_READ_PAGE: u8 = 0x74;
/// Read the device signature
pub const CMND_READ_SIGN: u8 = 0x75;

/// Memory type selector for flash in page commands
pub const MEMTYPE_FLASH: u8 = b'F';
/// Memory type selector for EEPROM in page commands
pub const MEMTYPE_EEPROM: u8 = b'E';

/// GET_PARAMETER: hardware version
pub const PARM_HW_VER: u8 = 0x80;
/// GET_PARAMETER: software major version
pub const PARM_SW_MAJOR: u8 = 0x81;
/// GET_PARAMETER: software minor version
pub const PARM_SW_MINOR: u8 = 0x82;

/// ATmega328P signature bytes
pub const SIGNATURE_ATMEGA328P: [u8; 3] = [0x1E, 0x95, 0x0F];
