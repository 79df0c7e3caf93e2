pub mod arbiter;
pub mod command;
pub mod doctor;
pub mod error;
pub mod flight_info;
pub mod handshake;
pub mod mav;
pub mod modes;
pub mod registry;
pub mod state;
pub mod telemetry;
pub mod transfer;

#[cfg(test)]
mod sim;

use std::time::Duration;

use serde::Deserialize;

/// MAVLink dialect spoken on every link.
pub use mavlink::ardupilotmega as dialect;

pub use arbiter::LinkArbiter;
pub use error::VehicleError;
pub use registry::{Vehicle, VehicleId, VehicleRegistry};

pub const DEFAULT_BAUD: u32 = 57600;

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

/// One `[[vehicles]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    pub id: VehicleId,

    /// `udpin:host:port`, `udpout:host:port`, `udp:host:port` or
    /// `serial:/dev/ttyX[:baud]`.
    pub endpoint: String,

    /// Used by serial endpoints that do not name their own rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Timeouts and retry ceilings of the session layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// MAVLink ids we present as (GCS side).
    pub gcs_system_id: u8,
    pub gcs_component_id: u8,

    pub handshake_timeout_ms: u64,

    /// Upload: wait for each item request, then re-send the count.
    pub item_timeout_ms: u64,
    pub silence_retries: u32,
    pub ack_timeout_ms: u64,

    /// Download: wait per count/item request and attempts per index.
    pub download_timeout_ms: u64,
    pub download_retries: u32,

    /// Flush of leftover frames before a transfer.
    pub drain_window_ms: u64,
    /// Pause between CLEAR_ALL and COUNT.
    pub clear_settle_ms: u64,

    pub reader_poll_ms: u64,
    pub reader_join_timeout_ms: u64,
    pub gcs_heartbeat_interval_ms: u64,
    pub data_stream_rate_hz: u16,

    pub direct_query_timeout_ms: u64,
    pub stale_threshold_ms: u64,

    /// Caller-side wait on the command worker.
    pub command_timeout_ms: u64,
    /// Wait for COMMAND_ACK after a command was sent.
    pub command_ack_timeout_ms: u64,
    pub arm_timeout_ms: u64,
    /// Pause between the mode/arm steps of a mission start.
    pub step_settle_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            gcs_system_id: 255,
            gcs_component_id: 190,
            handshake_timeout_ms: 5000,
            item_timeout_ms: 2000,
            silence_retries: 3,
            ack_timeout_ms: 3000,
            download_timeout_ms: 2000,
            download_retries: 3,
            drain_window_ms: 200,
            clear_settle_ms: 1000,
            reader_poll_ms: 500,
            reader_join_timeout_ms: 2000,
            gcs_heartbeat_interval_ms: 1000,
            data_stream_rate_hz: 2,
            direct_query_timeout_ms: 5000,
            stale_threshold_ms: 2000,
            command_timeout_ms: 3000,
            command_ack_timeout_ms: 1500,
            arm_timeout_ms: 10_000,
            step_settle_ms: 1000,
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration { ms(self.handshake_timeout_ms) }
    pub fn item_timeout(&self) -> Duration { ms(self.item_timeout_ms) }
    pub fn ack_timeout(&self) -> Duration { ms(self.ack_timeout_ms) }
    pub fn download_timeout(&self) -> Duration { ms(self.download_timeout_ms) }
    pub fn drain_window(&self) -> Duration { ms(self.drain_window_ms) }
    pub fn clear_settle(&self) -> Duration { ms(self.clear_settle_ms) }
    pub fn reader_poll(&self) -> Duration { ms(self.reader_poll_ms) }
    pub fn reader_join_timeout(&self) -> Duration { ms(self.reader_join_timeout_ms) }
    pub fn gcs_heartbeat_interval(&self) -> Duration { ms(self.gcs_heartbeat_interval_ms) }
    pub fn direct_query_timeout(&self) -> Duration { ms(self.direct_query_timeout_ms) }
    pub fn stale_threshold(&self) -> Duration { ms(self.stale_threshold_ms) }
    pub fn command_timeout(&self) -> Duration { ms(self.command_timeout_ms) }
    pub fn command_ack_timeout(&self) -> Duration { ms(self.command_ack_timeout_ms) }
    pub fn arm_timeout(&self) -> Duration { ms(self.arm_timeout_ms) }
    pub fn step_settle(&self) -> Duration { ms(self.step_settle_ms) }
}
