//! Last-known telemetry per vehicle and the background reader that fills it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use mavlink::Message;
use tracing::{debug, info, warn};

use crate::dialect::{
    MavDataStream, MavMessage, BATTERY_STATUS_DATA, GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA,
    SYS_STATUS_DATA,
};
use crate::handshake::is_vehicle_heartbeat;
use crate::state::LinkStatus;
use crate::{LinkArbiter, ProtocolConfig};

/// A value and the instant it was received.
#[derive(Debug, Clone)]
pub struct Stamped<T> {
    pub value: T,
    pub at: Instant,
}

impl<T> Stamped<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.at)
    }
}

/// Pack state decoded from SYS_STATUS or BATTERY_STATUS. `None` where the
/// autopilot reports the field as unmeasured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatteryStatus {
    pub voltage: Option<f32>,
    /// Positive while discharging.
    pub current: Option<f32>,
    pub remaining: Option<u8>,
}

impl BatteryStatus {
    pub(crate) fn from_sys_status(status: &SYS_STATUS_DATA) -> Self {
        Self {
            voltage: (status.voltage_battery != u16::MAX).then(|| status.voltage_battery as f32 / 1000.0),
            // centiamps, -1 = not measured
            current: (status.current_battery != -1).then(|| status.current_battery as f32 / 100.0),
            remaining: percent(status.battery_remaining),
        }
    }

    fn from_battery_status(status: &BATTERY_STATUS_DATA) -> Self {
        let cell0 = status.voltages[0];
        Self {
            voltage: (cell0 != u16::MAX).then(|| cell0 as f32 / 1000.0),
            current: (status.current_battery != -1).then(|| status.current_battery as f32 / 100.0),
            remaining: percent(status.battery_remaining),
        }
    }
}

fn percent(v: i8) -> Option<u8> {
    (0..=100).contains(&v).then_some(v as u8)
}

/// Consistent copy of the cache taken under one lock.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    pub heartbeat: Option<Stamped<HEARTBEAT_DATA>>,
    pub position: Option<Stamped<GLOBAL_POSITION_INT_DATA>>,
    pub battery: Option<Stamped<BatteryStatus>>,
    /// Last receive instant per message name.
    pub seen: BTreeMap<&'static str, Instant>,
}

/// Messages owned by the transfer engine; the reader never caches these.
pub fn is_mission_message(msg: &MavMessage) -> bool {
    matches!(
        msg,
        MavMessage::MISSION_COUNT(_)
            | MavMessage::MISSION_REQUEST(_)
            | MavMessage::MISSION_REQUEST_INT(_)
            | MavMessage::MISSION_ITEM(_)
            | MavMessage::MISSION_ITEM_INT(_)
            | MavMessage::MISSION_ACK(_)
            | MavMessage::MISSION_CLEAR_ALL(_)
            | MavMessage::MISSION_SET_CURRENT(_)
    )
}

#[derive(Default)]
pub struct TelemetryCache {
    inner: Mutex<TelemetrySnapshot>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_from(&self, msg: &MavMessage) {
        self.record_at(msg, Instant::now());
    }

    /// Store `msg` as received at `at`. Returns false when the message was
    /// not cached.
    pub fn record_at(&self, msg: &MavMessage, at: Instant) -> bool {
        if is_mission_message(msg) {
            return false;
        }
        let mut snap = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                if !is_vehicle_heartbeat(hb) {
                    return false;
                }
                snap.heartbeat = Some(Stamped { value: hb.clone(), at });
            }
            MavMessage::GLOBAL_POSITION_INT(pos) => {
                snap.position = Some(Stamped { value: pos.clone(), at });
            }
            MavMessage::SYS_STATUS(s) => {
                snap.battery = Some(Stamped { value: BatteryStatus::from_sys_status(s), at });
            }
            MavMessage::BATTERY_STATUS(b) => {
                snap.battery = Some(Stamped { value: BatteryStatus::from_battery_status(b), at });
            }
            _ => {}
        }
        snap.seen.insert(msg.message_name(), at);
        true
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Shared state handed to the reader.
pub struct ReaderCtx {
    pub vehicle_id: u32,
    pub arbiter: Arc<LinkArbiter>,
    pub cache: Arc<TelemetryCache>,
    pub status: Arc<Mutex<LinkStatus>>,
    pub stop: Arc<AtomicBool>,
    pub cfg: ProtocolConfig,
}

/// Poll the link until `stop` is set.
///
/// The link is held only for one heartbeat send plus one bounded receive,
/// so transfers and commands get it between polls.
pub fn run_reader(ctx: ReaderCtx) {
    let ReaderCtx { vehicle_id, arbiter, cache, status, stop, cfg } = ctx;
    info!(vehicle_id, "telemetry reader started");

    let rate = cfg.data_stream_rate_hz;
    let started = arbiter.with_exclusive_link(|s| {
        // from here on every receive on this link, ours or a transfer's,
        // keeps the GCS heartbeat going
        s.keep_alive(cfg.gcs_heartbeat_interval());
        s.request_data_stream(MavDataStream::MAV_DATA_STREAM_ALL, rate)
    });
    if let Err(e) = started {
        warn!(vehicle_id, error = %e, "data stream request failed");
    }

    while !stop.load(Ordering::Relaxed) {
        let polled = arbiter.with_exclusive_link(|s| s.recv(cfg.reader_poll()));

        match polled {
            Ok(Some(msg)) => {
                let now = Instant::now();
                let is_hb = matches!(&msg, MavMessage::HEARTBEAT(hb) if is_vehicle_heartbeat(hb));
                {
                    let mut st = status.lock().unwrap_or_else(PoisonError::into_inner);
                    st.record(msg.message_name(), is_hb, now);
                }
                if !cache.record_at(&msg, now) && is_mission_message(&msg) {
                    debug!(vehicle_id, msg = msg.message_name(), "reader skipped mission message");
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(vehicle_id, error = %e, "telemetry poll failed");
                status.lock().unwrap_or_else(PoisonError::into_inner).rx_errors += 1;
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    status.lock().unwrap_or_else(PoisonError::into_inner).connected = false;
    info!(vehicle_id, "telemetry reader stopped");
}

#[cfg(test)]
mod tests {
    use std::io;

    use mavlink::MavHeader;

    use super::*;
    use crate::dialect::MavType;
    use crate::mav::{Frame, Link, LinkSession};
    use crate::sim::{self, SimLink};

    /// Fails the first `failures` receives, then behaves like `inner`.
    struct FlakyLink {
        inner: SimLink,
        failures: usize,
    }

    impl Link for FlakyLink {
        fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> io::Result<()> {
            self.inner.send(header, msg)
        }

        fn recv(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt frame"));
            }
            self.inner.recv(timeout)
        }
    }

    #[test]
    fn mission_traffic_is_not_cached() {
        let cache = TelemetryCache::new();
        assert!(!cache.record_at(&sim::count(4), Instant::now()));
        assert!(!cache.record_at(&sim::request_int(0), Instant::now()));
        assert!(cache.snapshot().seen.is_empty());

        assert!(cache.record_at(&sim::position(488_512_345, 22_912_345, 10_000), Instant::now()));
        let snap = cache.snapshot();
        assert!(snap.position.is_some());
        assert!(snap.seen.contains_key("GLOBAL_POSITION_INT"));
    }

    #[test]
    fn gcs_heartbeats_do_not_count() {
        let cache = TelemetryCache::new();
        let mut hb = sim::heartbeat(false, 0);
        if let MavMessage::HEARTBEAT(d) = &mut hb {
            d.mavtype = MavType::MAV_TYPE_GCS;
        }
        cache.update_from(&hb);
        assert!(cache.snapshot().heartbeat.is_none());
    }

    #[test]
    fn battery_from_sys_status() {
        let cache = TelemetryCache::new();
        cache.update_from(&sim::sys_status(-1));
        let b = cache.snapshot().battery.unwrap().value;
        assert_eq!(b.voltage, Some(12.6));
        assert_eq!(b.current, Some(1.5));
        assert_eq!(b.remaining, None);

        cache.update_from(&sim::sys_status(76));
        assert_eq!(cache.snapshot().battery.unwrap().value.remaining, Some(76));
    }

    #[test]
    fn reader_fills_cache_and_leaves_mission_messages_alone() {
        let (mut link, sent) = SimLink::new(|_| vec![]);
        link.push(sim::heartbeat(true, 3));
        link.push(sim::count(4));
        link.push(sim::position(488_512_345, 22_912_345, 10_000));
        let inbox = link.inbox();

        let ctx = ReaderCtx {
            vehicle_id: 1,
            arbiter: Arc::new(LinkArbiter::new(sim::session(link))),
            cache: Arc::new(TelemetryCache::new()),
            status: Arc::new(Mutex::new(LinkStatus::default())),
            stop: Arc::new(AtomicBool::new(false)),
            cfg: sim::fast_config(),
        };
        let cache = ctx.cache.clone();
        let status = ctx.status.clone();
        let stop = ctx.stop.clone();
        let handle = thread::spawn(move || run_reader(ctx));

        let deadline = Instant::now() + Duration::from_secs(2);
        while inbox.lock().unwrap().len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let snap = cache.snapshot();
        assert!(snap.heartbeat.is_some());
        assert!(snap.position.is_some());
        assert!(!snap.seen.contains_key("MISSION_COUNT"));
        assert_eq!(status.lock().unwrap().rx_count, 3);

        let sent = sent.lock().unwrap();
        assert!(matches!(sent[0], MavMessage::REQUEST_DATA_STREAM(_)));
        assert!(sent.iter().any(|m| matches!(m, MavMessage::HEARTBEAT(_))));
    }

    #[test]
    fn reader_survives_receive_errors() {
        let (mut inner, _) = SimLink::new(|_| vec![]);
        inner.push(sim::position(488_512_345, 22_912_345, 10_000));
        let link = FlakyLink { inner, failures: 4 };

        let ctx = ReaderCtx {
            vehicle_id: 1,
            arbiter: Arc::new(LinkArbiter::new(LinkSession::new(Box::new(link), 255, 190, sim::peer()))),
            cache: Arc::new(TelemetryCache::new()),
            status: Arc::new(Mutex::new(LinkStatus::default())),
            stop: Arc::new(AtomicBool::new(false)),
            cfg: sim::fast_config(),
        };
        let cache = ctx.cache.clone();
        let status = ctx.status.clone();
        let stop = ctx.stop.clone();
        let handle = thread::spawn(move || run_reader(ctx));

        let deadline = Instant::now() + Duration::from_secs(2);
        while cache.snapshot().position.is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        assert!(cache.snapshot().position.is_some());
        let st = status.lock().unwrap();
        assert_eq!(st.rx_errors, 4);
        assert_eq!(st.rx_count, 1);
    }
}
