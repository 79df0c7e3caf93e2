use std::collections::BTreeSet;

use crate::mav::Endpoint;
use crate::{ProtocolConfig, VehicleConfig, VehicleError};

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), VehicleError> {
    if cond { Ok(()) } else { Err(VehicleError::Config(msg())) }
}

pub fn check_protocol(p: &ProtocolConfig) -> Result<(), VehicleError> {
    let timeouts = [
        ("handshake_timeout_ms", p.handshake_timeout_ms),
        ("item_timeout_ms", p.item_timeout_ms),
        ("ack_timeout_ms", p.ack_timeout_ms),
        ("download_timeout_ms", p.download_timeout_ms),
        ("reader_poll_ms", p.reader_poll_ms),
        ("reader_join_timeout_ms", p.reader_join_timeout_ms),
        ("gcs_heartbeat_interval_ms", p.gcs_heartbeat_interval_ms),
        ("direct_query_timeout_ms", p.direct_query_timeout_ms),
        ("stale_threshold_ms", p.stale_threshold_ms),
        ("command_timeout_ms", p.command_timeout_ms),
        ("arm_timeout_ms", p.arm_timeout_ms),
    ];
    for (name, v) in timeouts {
        ensure(v > 0, || format!("protocol.{} must be > 0", name))?;
    }
    ensure(p.download_retries > 0, || "protocol.download_retries must be > 0".into())?;
    ensure(p.data_stream_rate_hz > 0, || "protocol.data_stream_rate_hz must be > 0".into())?;
    // the reader holds the link for one poll; keep that short
    ensure(p.reader_poll_ms <= 2000, || "protocol.reader_poll_ms too large; set <= 2000".into())?;
    ensure(p.gcs_system_id > 0, || "protocol.gcs_system_id must be 1..=255".into())
}

pub fn check_vehicles(vehicles: &[VehicleConfig]) -> Result<(), VehicleError> {
    ensure(!vehicles.is_empty(), || "no [[vehicles]] configured".into())?;
    let mut seen = BTreeSet::new();
    for v in vehicles {
        if !seen.insert(v.id) {
            return Err(VehicleError::DuplicateVehicle(v.id));
        }
        v.endpoint.parse::<Endpoint>()?;
        ensure(v.baud > 0, || format!("vehicle {}: baud must be > 0", v.id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(id: u32, endpoint: &str) -> VehicleConfig {
        VehicleConfig { id, endpoint: endpoint.into(), baud: 57600 }
    }

    #[test]
    fn defaults_pass() {
        assert!(check_protocol(&ProtocolConfig::default()).is_ok());
    }

    #[test]
    fn zero_timeout_fails() {
        let p = ProtocolConfig { item_timeout_ms: 0, ..Default::default() };
        let err = check_protocol(&p).unwrap_err();
        assert!(err.to_string().contains("item_timeout_ms"));
    }

    #[test]
    fn vehicle_list_checks() {
        assert!(check_vehicles(&[vehicle(1, "udpin:0.0.0.0:14550"), vehicle(2, "serial:/dev/ttyUSB0")]).is_ok());
        assert!(matches!(
            check_vehicles(&[vehicle(1, "udp:0.0.0.0:14550"), vehicle(1, "udp:0.0.0.0:14560")]),
            Err(VehicleError::DuplicateVehicle(1))
        ));
        assert!(matches!(check_vehicles(&[vehicle(1, "tcp:x:1")]), Err(VehicleError::Endpoint(_))));
        assert!(check_vehicles(&[]).is_err());
    }
}
