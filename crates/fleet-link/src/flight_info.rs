//! Normalized status records, from the cache or from a direct query.

use std::time::{Duration, Instant};

use fleet_proto::{FlightInfo, Freshness};
use time::OffsetDateTime;
use tracing::debug;

use crate::dialect::{MavDataStream, MavMessage, GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA};
use crate::handshake::is_vehicle_heartbeat;
use crate::mav::LinkSession;
use crate::modes::{is_armed, mode_string};
use crate::telemetry::{BatteryStatus, TelemetrySnapshot};
use crate::{ProtocolConfig, VehicleError};

const HEADING_UNKNOWN: u16 = u16::MAX;

fn note_battery(msg: &MavMessage, battery: &mut Option<BatteryStatus>) {
    if let MavMessage::SYS_STATUS(s) = msg {
        *battery = Some(BatteryStatus::from_sys_status(s));
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn now_unix_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn normalize(
    vehicle_id: u32,
    hb: &HEARTBEAT_DATA,
    pos: &GLOBAL_POSITION_INT_DATA,
    battery: Option<&BatteryStatus>,
) -> FlightInfo {
    let vx = pos.vx as f64 / 100.0;
    let vy = pos.vy as f64 / 100.0;
    let vz = pos.vz as f64 / 100.0;
    FlightInfo {
        vehicle_id,
        ts_unix_ms: now_unix_ms(),
        is_armed: is_armed(hb),
        flight_mode: mode_string(hb),
        latitude: pos.lat as f64 / 1e7,
        longitude: pos.lon as f64 / 1e7,
        altitude_m: pos.relative_alt as f64 / 1000.0,
        horizontal_speed_m_s: round2((vx * vx + vy * vy).sqrt()),
        vertical_speed_m_s: round2(vz),
        heading_deg: (pos.hdg != HEADING_UNKNOWN).then(|| pos.hdg as f64 / 100.0),
        battery_remaining_percent: battery.and_then(|b| b.remaining),
        freshness: None,
    }
}

/// Build a record from a cache snapshot without touching the link.
pub fn build_from_cache(
    vehicle_id: u32,
    snap: &TelemetrySnapshot,
    threshold: Duration,
    allow_stale: bool,
    now: Instant,
) -> Result<FlightInfo, VehicleError> {
    let hb = snap
        .heartbeat
        .as_ref()
        .ok_or_else(|| VehicleError::NoData(format!("vehicle {}: no heartbeat received", vehicle_id)))?;
    let pos = snap
        .position
        .as_ref()
        .ok_or_else(|| VehicleError::NoData(format!("vehicle {}: no position received", vehicle_id)))?;

    let hb_age = hb.age(now);
    let pos_age = pos.age(now);
    let stale = hb_age > threshold || pos_age > threshold;
    if stale && !allow_stale {
        return Err(VehicleError::StaleData(format!(
            "vehicle {}: heartbeat {:.1}s, position {:.1}s old (threshold {:.1}s)",
            vehicle_id,
            hb_age.as_secs_f64(),
            pos_age.as_secs_f64(),
            threshold.as_secs_f64()
        )));
    }

    let mut info = normalize(vehicle_id, &hb.value, &pos.value, snap.battery.as_ref().map(|b| &b.value));
    info.freshness = Some(Freshness {
        stale,
        threshold_s: threshold.as_secs_f64(),
        heartbeat_age_s: hb_age.as_secs_f64(),
        position_age_s: pos_age.as_secs_f64(),
        battery_age_s: snap.battery.as_ref().map(|b| b.age(now).as_secs_f64()),
    });
    Ok(info)
}

/// Ask the vehicle directly. Caller holds the link for the whole query.
pub fn query_direct(
    session: &mut LinkSession,
    vehicle_id: u32,
    cfg: &ProtocolConfig,
) -> Result<FlightInfo, VehicleError> {
    session.request_data_stream(MavDataStream::MAV_DATA_STREAM_POSITION, cfg.data_stream_rate_hz)?;

    // battery status is picked up on the way if it happens to arrive
    let mut battery: Option<BatteryStatus> = None;

    let wait = cfg.direct_query_timeout();
    let hb = session
        .recv_match(wait, |m| {
            note_battery(m, &mut battery);
            match m {
                MavMessage::HEARTBEAT(hb) if is_vehicle_heartbeat(hb) => Some(hb.clone()),
                _ => None,
            }
        })?
        .ok_or_else(|| VehicleError::NoData(format!("vehicle {}: no heartbeat within {:?}", vehicle_id, wait)))?;
    let pos = session
        .recv_match(wait, |m| {
            note_battery(m, &mut battery);
            match m {
                MavMessage::GLOBAL_POSITION_INT(p) => Some(p.clone()),
                _ => None,
            }
        })?
        .ok_or_else(|| VehicleError::NoData(format!("vehicle {}: no position within {:?}", vehicle_id, wait)))?;

    debug!(vehicle_id, battery = battery.is_some(), "direct flight info");
    Ok(normalize(vehicle_id, &hb, &pos, battery.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, SimLink};
    use crate::telemetry::TelemetryCache;

    fn filled_cache(pos_age: Duration, now: Instant) -> TelemetryCache {
        let cache = TelemetryCache::new();
        cache.record_at(&sim::heartbeat(true, 3), now);
        cache.record_at(&sim::position(488_512_345, 22_912_345, 12_500), now - pos_age);
        cache
    }

    #[test]
    fn empty_cache_has_no_data() {
        let snap = TelemetryCache::new().snapshot();
        let res = build_from_cache(1, &snap, Duration::from_secs(2), true, Instant::now());
        assert!(matches!(res, Err(VehicleError::NoData(_))));
    }

    #[test]
    fn old_position_is_stale() {
        let now = Instant::now();
        let snap = filled_cache(Duration::from_secs(3), now).snapshot();
        let threshold = Duration::from_secs(2);

        let res = build_from_cache(1, &snap, threshold, false, now);
        assert!(matches!(res, Err(VehicleError::StaleData(_))));

        let info = build_from_cache(1, &snap, threshold, true, now).unwrap();
        assert!(info.is_stale());
        let f = info.freshness.unwrap();
        assert!(f.position_age_s >= 3.0);
        assert!(f.heartbeat_age_s < 2.0);
        assert_eq!(f.battery_age_s, None);
    }

    #[test]
    fn fresh_cache_is_normalized() {
        let now = Instant::now();
        let cache = filled_cache(Duration::ZERO, now);
        cache.record_at(&sim::sys_status(64), now);
        let info = build_from_cache(7, &cache.snapshot(), Duration::from_secs(2), false, now).unwrap();

        assert_eq!(info.vehicle_id, 7);
        assert!(info.is_armed);
        assert_eq!(info.flight_mode, "AUTO");
        assert!((info.latitude - 48.8512345).abs() < 1e-9);
        assert!((info.longitude - 2.2912345).abs() < 1e-9);
        assert_eq!(info.altitude_m, 12.5);
        assert_eq!(info.horizontal_speed_m_s, 5.0);
        assert_eq!(info.vertical_speed_m_s, -0.25);
        assert_eq!(info.heading_deg, Some(90.0));
        assert_eq!(info.battery_remaining_percent, Some(64));
        assert!(!info.is_stale());
    }

    #[test]
    fn unknown_heading_is_none() {
        let now = Instant::now();
        let cache = filled_cache(Duration::ZERO, now);
        let mut pos = sim::position(0, 0, 0);
        if let MavMessage::GLOBAL_POSITION_INT(p) = &mut pos {
            p.hdg = u16::MAX;
        }
        cache.record_at(&pos, now);
        let info = build_from_cache(1, &cache.snapshot(), Duration::from_secs(2), false, now).unwrap();
        assert_eq!(info.heading_deg, None);
    }

    #[test]
    fn direct_query_waits_for_heartbeat_then_position() {
        let (link, sent) = SimLink::new(|m| match m {
            MavMessage::REQUEST_DATA_STREAM(_) => vec![
                sim::sys_status(80),
                sim::position(10, 20, 1000),
                sim::heartbeat(false, 5),
                sim::position(488_512_345, 22_912_345, 2000),
            ],
            _ => vec![],
        });
        let mut session = sim::session(link);
        let info = query_direct(&mut session, 2, &sim::fast_config()).unwrap();

        assert_eq!(info.flight_mode, "LOITER");
        assert!(!info.is_armed);
        assert_eq!(info.altitude_m, 2.0);
        assert_eq!(info.battery_remaining_percent, Some(80));
        assert!(info.freshness.is_none());
        assert!(matches!(sent.lock().unwrap()[0], MavMessage::REQUEST_DATA_STREAM(_)));
    }

    #[test]
    fn direct_query_without_position_fails() {
        let (link, _) = SimLink::new(|_| vec![sim::heartbeat(false, 0)]);
        let mut session = sim::session(link);
        let res = query_direct(&mut session, 2, &sim::fast_config());
        assert!(matches!(res, Err(VehicleError::NoData(_))));
    }
}
