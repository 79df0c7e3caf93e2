use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::dialect::{MavAutopilot, MavMessage, MavType, HEARTBEAT_DATA};
use crate::mav::Link;
use crate::VehicleError;

/// Identity of the autopilot at the far end of a link.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub system_id: u8,
    pub component_id: u8,
    pub mavtype: MavType,
    pub autopilot: MavAutopilot,
}

/// Ground stations and autopilot-less components (companion computers,
/// gimbals, cameras) share the bus but are not the vehicle.
pub(crate) fn is_vehicle_heartbeat(hb: &HEARTBEAT_DATA) -> bool {
    hb.mavtype != MavType::MAV_TYPE_GCS && hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID
}

/// Block until a vehicle heartbeat arrives on `link`.
pub fn await_handshake(link: &mut dyn Link, timeout: Duration) -> Result<Peer, VehicleError> {
    let start = Instant::now();
    loop {
        let left = timeout.saturating_sub(start.elapsed());
        if left.is_zero() {
            return Err(VehicleError::Timeout(format!("no heartbeat within {:?}", timeout)));
        }
        match link.recv(left)? {
            Some((hdr, MavMessage::HEARTBEAT(hb))) if is_vehicle_heartbeat(&hb) => {
                let peer = Peer {
                    system_id: hdr.system_id,
                    component_id: hdr.component_id,
                    mavtype: hb.mavtype,
                    autopilot: hb.autopilot,
                };
                info!(
                    sys = peer.system_id,
                    comp = peer.component_id,
                    mavtype = ?peer.mavtype,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "handshake: heartbeat seen"
                );
                return Ok(peer);
            }
            Some((hdr, _)) => debug!(sys = hdr.system_id, "handshake: waiting for vehicle heartbeat"),
            None => {}
        }
    }
}
