use serde::{Deserialize, Serialize};

/// Normalized status snapshot of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightInfo {
    pub vehicle_id: u32,
    pub ts_unix_ms: i64,
    pub is_armed: bool,
    pub flight_mode: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub horizontal_speed_m_s: f64,
    pub vertical_speed_m_s: f64,
    /// None when the autopilot reports the "unknown" sentinel.
    pub heading_deg: Option<f64>,
    pub battery_remaining_percent: Option<u8>,
    /// Only present for snapshots built from the telemetry cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<Freshness>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    pub stale: bool,
    pub threshold_s: f64,
    pub heartbeat_age_s: f64,
    pub position_age_s: f64,
    pub battery_age_s: Option<f64>,
}

impl FlightInfo {
    pub fn is_stale(&self) -> bool {
        self.freshness.as_ref().map(|f| f.stale).unwrap_or(false)
    }
}

/// One row of the vehicle listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleSummary {
    pub id: u32,
    pub endpoint: String,
    pub baud: u32,
    pub connected: bool,
    pub heartbeat_age_s: Option<f64>,
}
