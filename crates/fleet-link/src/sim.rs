//! In-process stand-in for an autopilot, used by the unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mavlink::MavHeader;

use crate::dialect::{
    MavAutopilot, MavMissionResult, MavModeFlag, MavState, MavType, MavMessage,
    GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_REQUEST_DATA, MISSION_REQUEST_INT_DATA, SYS_STATUS_DATA,
};
use crate::handshake::Peer;
use crate::mav::{Frame, Link, LinkSession};
use crate::ProtocolConfig;

pub type Responder = Box<dyn FnMut(&MavMessage) -> Vec<MavMessage> + Send>;
pub type Sent = Arc<Mutex<Vec<MavMessage>>>;
pub type Inbox = Arc<Mutex<VecDeque<Frame>>>;

pub const VEHICLE_SYS: u8 = 1;

/// Answers each sent message through `responder`; answers are queued for
/// the next `recv`.
pub struct SimLink {
    inbox: Inbox,
    sent: Sent,
    responder: Responder,
}

impl SimLink {
    pub fn new(responder: impl FnMut(&MavMessage) -> Vec<MavMessage> + Send + 'static) -> (Self, Sent) {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let link = Self {
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            sent: sent.clone(),
            responder: Box::new(responder),
        };
        (link, sent)
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn push(&mut self, msg: MavMessage) {
        self.push_from(VEHICLE_SYS, msg);
    }

    pub fn push_from(&mut self, sys: u8, msg: MavMessage) {
        self.inbox.lock().unwrap().push_back((header(sys), msg));
    }
}

pub fn header(sys: u8) -> MavHeader {
    MavHeader { system_id: sys, component_id: 1, sequence: 0 }
}

impl Link for SimLink {
    fn send(&mut self, _header: &MavHeader, msg: &MavMessage) -> io::Result<()> {
        self.sent.lock().unwrap().push(msg.clone());
        let replies = (self.responder)(msg);
        let mut inbox = self.inbox.lock().unwrap();
        for r in replies {
            inbox.push_back((header(VEHICLE_SYS), r));
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(f) = self.inbox.lock().unwrap().pop_front() {
                return Ok(Some(f));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

pub fn peer() -> Peer {
    Peer {
        system_id: VEHICLE_SYS,
        component_id: 1,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
    }
}

pub fn session(link: SimLink) -> LinkSession {
    LinkSession::new(Box::new(link), 255, 190, peer())
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> ProtocolConfig {
    ProtocolConfig {
        handshake_timeout_ms: 200,
        item_timeout_ms: 60,
        silence_retries: 3,
        ack_timeout_ms: 150,
        download_timeout_ms: 60,
        download_retries: 3,
        drain_window_ms: 10,
        clear_settle_ms: 0,
        reader_poll_ms: 10,
        reader_join_timeout_ms: 500,
        gcs_heartbeat_interval_ms: 50,
        direct_query_timeout_ms: 200,
        stale_threshold_ms: 2000,
        command_timeout_ms: 300,
        command_ack_timeout_ms: 50,
        arm_timeout_ms: 200,
        step_settle_ms: 0,
        ..ProtocolConfig::default()
    }
}

pub fn heartbeat(armed: bool, custom_mode: u32) -> MavMessage {
    let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
    if armed {
        base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
    }
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode,
        system_status: MavState::MAV_STATE_STANDBY,
        mavlink_version: 3,
    })
}

pub fn position(lat_e7: i32, lon_e7: i32, alt_mm: i32) -> MavMessage {
    MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
        lat: lat_e7,
        lon: lon_e7,
        alt: alt_mm + 30_000,
        relative_alt: alt_mm,
        vx: 300,
        vy: 400,
        vz: -25,
        hdg: 9000,
        ..Default::default()
    })
}

pub fn sys_status(remaining: i8) -> MavMessage {
    MavMessage::SYS_STATUS(SYS_STATUS_DATA {
        voltage_battery: 12_600,
        current_battery: 150,
        battery_remaining: remaining,
        ..Default::default()
    })
}

pub fn request_int(seq: u16) -> MavMessage {
    MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
        seq,
        target_system: 255,
        target_component: 190,
        ..Default::default()
    })
}

pub fn request_float(seq: u16) -> MavMessage {
    MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA {
        seq,
        target_system: 255,
        target_component: 190,
        ..Default::default()
    })
}

pub fn count(n: u16) -> MavMessage {
    MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
        count: n,
        target_system: 255,
        target_component: 190,
        ..Default::default()
    })
}

pub fn ack(result: MavMissionResult) -> MavMessage {
    MavMessage::MISSION_ACK(MISSION_ACK_DATA {
        target_system: 255,
        target_component: 190,
        mavtype: result,
        ..Default::default()
    })
}
