//! Opening the peer link named in the configuration

use stkbridge_core::config::TargetConfig;
use stkbridge_core::link::PeerLink;
use stkbridge_core::protocol::SIGNATURE_ATMEGA328P;
use stkbridge_serial::{SerialLink, SerialOptions};
use stkbridge_sim::{SimConfig, SimulatedPeer};

/// Device name that selects the simulated peer
pub const SIM_DEVICE: &str = "sim";

/// A peer link that can be handed to the control loop thread
pub type BoxedLink = Box<dyn PeerLink + Send>;

/// Open the serial port, or a simulated peer for [`SIM_DEVICE`]
pub fn open_link(
    serial: &SerialOptions,
    target: &TargetConfig,
) -> Result<BoxedLink, Box<dyn std::error::Error>> {
    if serial.device == SIM_DEVICE {
        log::warn!("Using a simulated peer, nothing will be programmed");
        let peer = SimulatedPeer::new(SimConfig {
            page_size: target.page_size,
            flash_size: target.flash_size,
            signature: target.signature.unwrap_or(SIGNATURE_ATMEGA328P),
            ..Default::default()
        });
        return Ok(Box::new(peer.real_time()));
    }

    Ok(Box::new(SerialLink::open(serial)?))
}
