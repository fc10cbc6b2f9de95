//! Probe and reset commands

use stkbridge_core::config::SessionConfig;
use stkbridge_core::link::PeerLink;
use stkbridge_core::protocol::{PARM_HW_VER, PARM_SW_MAJOR, PARM_SW_MINOR};
use stkbridge_core::transport::Stk500Transport;
use stkbridge_core::ProgrammingSession;

/// Bootloader identity read by [`run_probe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeInfo {
    pub hardware_version: u8,
    pub software_version: (u8, u8),
    pub signature: [u8; 3],
}

/// Enter programming mode, identify the bootloader and restart the peer
pub fn probe<L: PeerLink>(link: L, config: &SessionConfig) -> stkbridge_core::Result<ProbeInfo> {
    let mut transport = Stk500Transport::new(link, config);
    transport.enter_programming_mode()?;

    let info = ProbeInfo {
        hardware_version: transport.get_parameter(PARM_HW_VER)?,
        software_version: (
            transport.get_parameter(PARM_SW_MAJOR)?,
            transport.get_parameter(PARM_SW_MINOR)?,
        ),
        signature: transport.read_signature()?,
    };

    transport.exit_programming_mode()?;
    Ok(info)
}

/// Run the probe command
pub fn run_probe<L: PeerLink>(
    link: L,
    config: &SessionConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let info = probe(link, config)?;

    println!("Found STK500 bootloader:");
    println!("  Hardware:  0x{:02X}", info.hardware_version);
    println!(
        "  Software:  {}.{}",
        info.software_version.0, info.software_version.1
    );
    println!(
        "  Signature: {:02X} {:02X} {:02X}",
        info.signature[0], info.signature[1], info.signature[2]
    );

    if let Some(expected) = config.target.signature {
        if expected != info.signature {
            println!(
                "Warning: configured target expects {:02X} {:02X} {:02X}",
                expected[0], expected[1], expected[2]
            );
        }
    }
    Ok(())
}

/// Run the reset command
pub fn run_reset<L: PeerLink>(
    link: L,
    config: &SessionConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = ProgrammingSession::new(link, *config)?;
    session.reset()?;
    println!("Peer reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stkbridge_sim::{PeerMode, SimulatedPeer};

    #[test]
    fn test_probe_simulated_peer() {
        let mut peer = SimulatedPeer::new_default();
        let info = probe(&mut peer, &SessionConfig::default()).unwrap();

        assert_eq!(info.signature, [0x1E, 0x95, 0x0F]);
        assert_eq!(info.software_version, (8, 0));
        // Left programming mode and restarted
        assert_eq!(peer.reset_count(), 2);
        assert_ne!(peer.mode(), PeerMode::Programming);
    }

    #[test]
    fn test_reset_simulated_peer() {
        let mut peer = SimulatedPeer::new_default();
        run_reset(&mut peer, &SessionConfig::default()).unwrap();
        assert_eq!(peer.reset_count(), 1);
        assert_eq!(peer.mode(), PeerMode::Bootloader);
    }
}
