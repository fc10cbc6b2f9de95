//! Session configuration
//!
//! The peer's timing and geometry are hardware specific, so none of them
//! are baked into the codec. Defaults describe an Arduino Nano class board
//! (ATmega328P behind Optiboot at 57600 baud).

use crate::error::{Error, Result};
use crate::protocol::{Opcodes, MAX_FLASH_ADDRESS, MAX_PAGE_SIZE, SIGNATURE_ATMEGA328P};

/// Timing windows for the reset sequence and every bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimingConfig {
    /// How long RESET (and DTR) are held asserted
    pub reset_pulse_ms: u32,
    /// Delay between releasing RESET and releasing DTR
    pub dtr_release_ms: u32,
    /// Time the bootloader needs after reset before it listens
    pub bootloader_ready_ms: u32,
    /// Bounded wait for one GET_SYNC answer
    pub sync_timeout_ms: u32,
    /// Maximum GET_SYNC exchanges per handshake
    pub handshake_attempts: u8,
    /// Overall handshake window, across all attempts
    pub handshake_timeout_ms: u32,
    /// Bounded wait for any other response frame
    pub frame_timeout_ms: u32,
    /// Interval between keep-alive syncs while waiting for upload bytes
    pub keepalive_ms: u32,
    /// Upload considered dead after this long without new bytes
    pub upload_idle_timeout_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reset_pulse_ms: 100,
            dtr_release_ms: 50,
            bootloader_ready_ms: 100,
            sync_timeout_ms: 200,
            handshake_attempts: 5,
            handshake_timeout_ms: 2000,
            frame_timeout_ms: 500,
            keepalive_ms: 250,
            upload_idle_timeout_ms: 10_000,
        }
    }
}

/// Peer device geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TargetConfig {
    /// Bootloader page size in bytes
    pub page_size: usize,
    /// Application flash available below the bootloader
    pub flash_size: usize,
    /// Expected device signature, checked after entering programming mode
    pub signature: Option<[u8; 3]>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            page_size: 128,
            flash_size: 32 * 1024 - 512,
            signature: Some(SIGNATURE_ATMEGA328P),
        }
    }
}

/// Everything a [`ProgrammingSession`](crate::session::ProgrammingSession) needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Timing windows
    pub timing: TimingConfig,
    /// Device geometry
    pub target: TargetConfig,
    /// Protocol opcodes
    pub opcodes: Opcodes,
}

impl SessionConfig {
    /// Check that the configuration can drive the codec
    pub fn validate(&self) -> Result<()> {
        let page = self.target.page_size;
        if page == 0 || page > MAX_PAGE_SIZE || !page.is_power_of_two() {
            log::error!("config: page size {} is not a power of two <= {}", page, MAX_PAGE_SIZE);
            return Err(Error::InvalidConfig);
        }
        if self.target.flash_size < page || self.target.flash_size % page != 0 {
            log::error!(
                "config: flash size {} is not a multiple of the page size",
                self.target.flash_size
            );
            return Err(Error::InvalidConfig);
        }
        if self.target.flash_size > MAX_FLASH_ADDRESS {
            log::error!(
                "config: flash size {} is beyond LOAD_ADDRESS reach ({} bytes)",
                self.target.flash_size,
                MAX_FLASH_ADDRESS
            );
            return Err(Error::InvalidConfig);
        }
        if self.timing.handshake_attempts == 0 {
            log::error!("config: handshake_attempts must be at least 1");
            return Err(Error::InvalidConfig);
        }

        let t = &self.timing;
        let waits = [
            ("sync_timeout_ms", t.sync_timeout_ms),
            ("handshake_timeout_ms", t.handshake_timeout_ms),
            ("frame_timeout_ms", t.frame_timeout_ms),
            ("keepalive_ms", t.keepalive_ms),
            ("upload_idle_timeout_ms", t.upload_idle_timeout_ms),
        ];
        if let Some((name, _)) = waits.iter().find(|(_, ms)| *ms == 0) {
            log::error!("config: {} must not be zero", name);
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_odd_page_size() {
        let mut config = SessionConfig::default();
        config.target.page_size = 100;
        assert_eq!(config.validate(), Err(Error::InvalidConfig));

        config.target.page_size = 512;
        assert_eq!(config.validate(), Err(Error::InvalidConfig));
    }

    #[test]
    fn test_rejects_zero_waits() {
        let zeroed: [fn(&mut TimingConfig); 5] = [
            |t| t.sync_timeout_ms = 0,
            |t| t.handshake_timeout_ms = 0,
            |t| t.frame_timeout_ms = 0,
            |t| t.keepalive_ms = 0,
            |t| t.upload_idle_timeout_ms = 0,
        ];
        for zero in zeroed {
            let mut config = SessionConfig::default();
            zero(&mut config.timing);
            assert_eq!(config.validate(), Err(Error::InvalidConfig));
        }

        // The reset sequence may be instantaneous
        let mut config = SessionConfig::default();
        config.timing.dtr_release_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_flash_beyond_word_addressing() {
        let mut config = SessionConfig::default();
        config.target.flash_size = 0x20000;
        assert!(config.validate().is_ok());

        config.target.flash_size = 0x20000 + 256;
        assert_eq!(config.validate(), Err(Error::InvalidConfig));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = SessionConfig::default();
        config.timing.handshake_attempts = 0;
        assert_eq!(config.validate(), Err(Error::InvalidConfig));
    }
}
