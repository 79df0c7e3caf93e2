use std::time::{Duration, Instant};

/// Bookkeeping the telemetry reader keeps about one link.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub last_heartbeat: Option<Instant>,
    pub last_msg: Option<String>,
    pub rx_count: u64,
    pub rx_errors: u64,
}

impl LinkStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub(crate) fn record(&mut self, name: &str, heartbeat: bool, at: Instant) {
        self.rx_count += 1;
        self.last_msg = Some(name.to_string());
        if heartbeat {
            self.last_heartbeat = Some(at);
        }
    }
}
