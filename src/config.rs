//! Bridge configuration file
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB0"
//! baud = 57600
//!
//! [timing]
//! bootloader_ready_ms = 300
//!
//! [target]
//! page_size = 128
//! flash_size = 32256
//! signature = [0x1E, 0x95, 0x0F]
//!
//! [protocol.opcodes]
//! prog_page = 0x64
//!
//! [store]
//! path = "firmware"
//! capacity_bytes = 1048576
//!
//! [server]
//! listen = "0.0.0.0:8080"
//! ```
//!
//! Every field has a default, so an empty file (or none at all) describes
//! an Arduino Nano on `/dev/ttyUSB0`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stkbridge_core::config::{SessionConfig, TargetConfig, TimingConfig};
use stkbridge_core::protocol::Opcodes;
use stkbridge_serial::SerialOptions;
use thiserror::Error;

/// File looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "stkbridge.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values the session cannot work with
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] stkbridge_core::Error),
}

/// `[protocol]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bootloader opcodes
    pub opcodes: Opcodes,
}

/// `[store]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding stored images
    pub path: PathBuf,
    /// Cap on the total size of stored images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_bytes: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("firmware"),
            capacity_bytes: None,
        }
    }
}

/// `[server]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address of the HTTP server
    pub listen: String,
    /// Store every successfully flashed upload
    pub persist: bool,
    /// Store name used for persisted uploads
    pub persist_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            persist: false,
            persist_name: "upload".to_string(),
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialOptions,
    pub timing: TimingConfig,
    pub target: TargetConfig,
    pub protocol: ProtocolConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl BridgeConfig {
    /// Load `path`, or [`DEFAULT_CONFIG_FILE`] if present, or the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    log::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.session_config().validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The part of the configuration the programming session uses
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timing: self.timing,
            target: self.target,
            opcodes: self.protocol.opcodes,
        }
    }
}
