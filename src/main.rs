//! stkbridge - Network firmware uploads onto an STK500 bootloader
//!
//! Bridges firmware images arriving over HTTP (or from the command line)
//! onto a microcontroller attached to a serial port, reprogramming it
//! through its resident STK500v1 bootloader.
//!
//! # Architecture
//!
//! The programming state machine lives in `stkbridge-core` and never
//! blocks: it is advanced one exchange at a time by whoever owns it.
//! - **CLI commands** own a session directly and poll it in a loop
//! - **`serve`** hands the session to a dedicated control loop thread,
//!   which HTTP handlers drive through a command channel
//!
//! The peer is reached through a `PeerLink`, either a real serial port
//! or, for `--port sim`, an in-process simulated bootloader.

mod cli;
mod commands;
mod config;
mod image;
mod link;
mod server;

use clap::Parser;
use cli::{Cli, Commands, ImagesCommands, PortArgs};
use config::BridgeConfig;
use stkbridge_store::FirmwareStore;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let mut config = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve {
            port,
            listen,
            persist,
        } => {
            apply_port_args(&mut config, &port);
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            config.server.persist |= persist;

            let store = match open_store(&config) {
                Ok(store) => Some(store),
                Err(e) => {
                    log::warn!("Firmware store unavailable: {}", e);
                    None
                }
            };
            let link = link::open_link(&config.serial, &config.target)?;

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::serve(&config, link, store))
        }
        Commands::Flash { port, input, save } => {
            apply_port_args(&mut config, &port);
            let data = image::load_image(&input)?;
            log::info!("Loaded {} bytes from {}", data.len(), input.display());

            if let Some(name) = save {
                let stored = open_store(&config)?.store(&name, &data)?;
                println!("Stored {} version {}", stored.name, stored.version);
            }

            let link = link::open_link(&config.serial, &config.target)?;
            commands::flash::run_flash(link, &config.session_config(), &data)
        }
        Commands::FlashStored {
            port,
            name,
            version,
        } => {
            apply_port_args(&mut config, &port);
            let store = open_store(&config)?;
            let (image, data) = match version {
                Some(version) => store.load_version(&name, version)?,
                None => store.load(&name)?,
            };
            println!(
                "Flashing {} version {} ({} bytes)",
                image.name, image.version, image.length
            );

            let link = link::open_link(&config.serial, &config.target)?;
            commands::flash::run_flash(link, &config.session_config(), &data)
        }
        Commands::Probe { port } => {
            apply_port_args(&mut config, &port);
            let link = link::open_link(&config.serial, &config.target)?;
            commands::peer::run_probe(link, &config.session_config())
        }
        Commands::Reset { port } => {
            apply_port_args(&mut config, &port);
            let link = link::open_link(&config.serial, &config.target)?;
            commands::peer::run_reset(link, &config.session_config())
        }
        Commands::Store { input, name } => {
            commands::images::run_store(&open_store(&config)?, &input, &name)
        }
        Commands::Images(subcmd) => {
            let store = open_store(&config)?;
            match subcmd {
                ImagesCommands::List => commands::images::run_list(&store),
                ImagesCommands::Remove { name, version } => {
                    commands::images::run_remove(&store, &name, version)
                }
            }
        }
        Commands::Ports => commands::list_ports(),
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn apply_port_args(config: &mut BridgeConfig, port: &PortArgs) {
    if let Some(device) = &port.port {
        config.serial.device = device.clone();
    }
    if let Some(baud) = port.baud {
        config.serial.baud = baud;
    }
}

fn open_store(config: &BridgeConfig) -> Result<FirmwareStore, stkbridge_store::StoreError> {
    FirmwareStore::open(&config.store.path, config.store.capacity_bytes)
}
