//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stkbridge")]
#[command(author, version, about = "Network firmware uploads onto an STK500 bootloader", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (TOML)
    /// Defaults to ./stkbridge.toml when present
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Serial port override shared across commands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct PortArgs {
    /// Serial device of the peer, or "sim" for a simulated peer
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rate of the bootloader
    #[arg(short, long)]
    pub baud: Option<u32>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP bridge
    Serve {
        #[command(flatten)]
        port: PortArgs,

        /// Listen address, e.g. 0.0.0.0:8080
        #[arg(short, long)]
        listen: Option<String>,

        /// Store every successfully flashed upload
        #[arg(long)]
        persist: bool,
    },

    /// Program an image file into the peer
    Flash {
        #[command(flatten)]
        port: PortArgs,

        /// Image file (raw binary or Intel HEX)
        input: PathBuf,

        /// Also keep the image in the store under this name
        #[arg(long)]
        save: Option<String>,
    },

    /// Program the latest stored version of an image
    FlashStored {
        #[command(flatten)]
        port: PortArgs,

        /// Stored image name
        name: String,

        /// Specific version instead of the latest
        #[arg(long = "image-version")]
        version: Option<u32>,
    },

    /// Check that the peer's bootloader answers and read its signature
    Probe {
        #[command(flatten)]
        port: PortArgs,
    },

    /// Run the peer's reset sequence
    Reset {
        #[command(flatten)]
        port: PortArgs,
    },

    /// Add an image file to the store
    Store {
        /// Image file (raw binary or Intel HEX)
        input: PathBuf,

        /// Name to store it under
        #[arg(short, long)]
        name: String,
    },

    /// Manage stored images
    #[command(subcommand)]
    Images(ImagesCommands),

    /// List serial ports
    Ports,

    /// Print the effective configuration
    ShowConfig,
}

#[derive(Subcommand)]
pub enum ImagesCommands {
    /// List stored images
    List,

    /// Delete a stored version
    Remove {
        /// Image name
        name: String,

        /// Version to delete
        version: u32,
    },
}
