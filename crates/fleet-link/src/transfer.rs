//! Mission upload and download exchanges.
//!
//! Both run on a `&mut LinkSession`, i.e. inside one arbiter acquisition,
//! so the telemetry reader cannot swallow a request or an item halfway.

use std::thread;
use std::time::Instant;

use fleet_mission::MissionError;
use fleet_proto::{Mission, Waypoint};
use num_traits::FromPrimitive;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dialect::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MISSION_ACK_DATA, MISSION_CLEAR_ALL_DATA,
    MISSION_COUNT_DATA, MISSION_ITEM_DATA, MISSION_ITEM_INT_DATA, MISSION_REQUEST_DATA,
    MISSION_REQUEST_INT_DATA, MISSION_REQUEST_LIST_DATA, MISSION_SET_CURRENT_DATA,
};
use crate::mav::LinkSession;
use crate::{ProtocolConfig, VehicleError};

/// A waypoint checked against the dialect and ready to go on the wire.
#[derive(Debug, Clone)]
pub(crate) struct WireItem {
    seq: u16,
    frame: MavFrame,
    command: MavCmd,
    current: u8,
    autocontinue: u8,
    params: [f32; 4],
    lat: f64,
    lon: f64,
    alt: f32,
}

fn to_e7(deg: f64) -> Option<i32> {
    let v = (deg * 1e7).round();
    (v.is_finite() && v >= i32::MIN as f64 && v <= i32::MAX as f64).then_some(v as i32)
}

impl WireItem {
    pub(crate) fn encode(wp: &Waypoint) -> Result<Self, VehicleError> {
        let bad = |reason: String| VehicleError::Unencodable { seq: wp.seq, reason };
        let frame = MavFrame::from_u8(wp.frame).ok_or_else(|| bad(format!("unknown frame {}", wp.frame)))?;
        let command = MavCmd::from_u16(wp.command).ok_or_else(|| bad(format!("unknown command {}", wp.command)))?;
        if to_e7(wp.lat).is_none() || to_e7(wp.lon).is_none() {
            return Err(bad(format!("coordinates out of range ({}, {})", wp.lat, wp.lon)));
        }
        Ok(Self {
            seq: wp.seq,
            frame,
            command,
            current: u8::from(wp.current),
            autocontinue: u8::from(wp.autocontinue),
            params: [wp.param1 as f32, wp.param2 as f32, wp.param3 as f32, wp.param4 as f32],
            lat: wp.lat,
            lon: wp.lon,
            alt: wp.alt as f32,
        })
    }

    pub(crate) fn to_int(&self, target_system: u8, target_component: u8) -> MavMessage {
        let [param1, param2, param3, param4] = self.params;
        MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            param1,
            param2,
            param3,
            param4,
            x: to_e7(self.lat).unwrap_or_default(),
            y: to_e7(self.lon).unwrap_or_default(),
            z: self.alt,
            seq: self.seq,
            command: self.command,
            target_system,
            target_component,
            frame: self.frame,
            current: self.current,
            autocontinue: self.autocontinue,
            ..Default::default()
        })
    }

    pub(crate) fn to_float(&self, target_system: u8, target_component: u8) -> MavMessage {
        let [param1, param2, param3, param4] = self.params;
        MavMessage::MISSION_ITEM(MISSION_ITEM_DATA {
            param1,
            param2,
            param3,
            param4,
            x: self.lat as f32,
            y: self.lon as f32,
            z: self.alt,
            seq: self.seq,
            command: self.command,
            target_system,
            target_component,
            frame: self.frame,
            current: self.current,
            autocontinue: self.autocontinue,
            ..Default::default()
        })
    }
}

/// Waypoint carried by an item reply, decoded per wire variant.
pub(crate) fn decode_item(msg: &MavMessage) -> Option<Waypoint> {
    match msg {
        MavMessage::MISSION_ITEM_INT(d) => Some(Waypoint {
            seq: d.seq,
            current: d.current != 0,
            frame: d.frame as u8,
            command: d.command as u16,
            param1: d.param1 as f64,
            param2: d.param2 as f64,
            param3: d.param3 as f64,
            param4: d.param4 as f64,
            lat: d.x as f64 / 1e7,
            lon: d.y as f64 / 1e7,
            alt: d.z as f64,
            autocontinue: d.autocontinue != 0,
        }),
        MavMessage::MISSION_ITEM(d) => Some(Waypoint {
            seq: d.seq,
            current: d.current != 0,
            frame: d.frame as u8,
            command: d.command as u16,
            param1: d.param1 as f64,
            param2: d.param2 as f64,
            param3: d.param3 as f64,
            param4: d.param4 as f64,
            lat: d.x as f64,
            lon: d.y as f64,
            alt: d.z as f64,
            autocontinue: d.autocontinue != 0,
        }),
        _ => None,
    }
}

/// Mission-protocol replies the upload loop reacts to.
#[derive(Debug, Clone, Copy)]
enum PeerReply {
    RequestInt(u16),
    RequestFloat(u16),
    Ack(MavMissionResult),
}

fn upload_reply(msg: &MavMessage) -> Option<PeerReply> {
    match msg {
        MavMessage::MISSION_REQUEST_INT(r) => Some(PeerReply::RequestInt(r.seq)),
        MavMessage::MISSION_REQUEST(r) => Some(PeerReply::RequestFloat(r.seq)),
        MavMessage::MISSION_ACK(a) => Some(PeerReply::Ack(a.mavtype)),
        _ => None,
    }
}

fn is_accepted(result: MavMissionResult) -> bool {
    result == MavMissionResult::MAV_MISSION_ACCEPTED
}

fn rejected(result: MavMissionResult) -> VehicleError {
    VehicleError::Rejected { what: "mission upload".into(), result: format!("{:?}", result) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadReport {
    pub items: usize,
    /// Times the count was re-sent after a silent wait.
    pub count_resends: u32,
    /// Requests for an item that had already been sent.
    pub repeated_requests: u32,
}

/// Check contiguity and encodability before anything is sent.
fn prepare(mission: &Mission) -> Result<Vec<WireItem>, VehicleError> {
    if mission.len() > usize::from(u16::MAX) {
        return Err(MissionError::Validation(format!("{} items exceed the protocol limit", mission.len())).into());
    }
    if let Some((idx, seq)) = mission.first_gap() {
        return Err(MissionError::Validation(format!("item {} has seq {}, expected {}", idx, seq, idx)).into());
    }
    mission.items.iter().map(WireItem::encode).collect()
}

/// Answer one item request. Returns false for an out-of-range seq.
fn answer(session: &mut LinkSession, items: &[WireItem], seq: u16, int_variant: bool) -> Result<bool, VehicleError> {
    let Some(item) = items.get(usize::from(seq)) else {
        warn!(seq, count = items.len(), "peer requested out-of-range item, ignored");
        return Ok(false);
    };
    let (ts, tc) = (session.target_system(), session.target_component());
    let msg = if int_variant { item.to_int(ts, tc) } else { item.to_float(ts, tc) };
    debug!(seq, int_variant, "sending mission item");
    session.send(msg)?;
    Ok(true)
}

/// Ground-to-vehicle transfer of a whole mission.
pub fn upload(session: &mut LinkSession, mission: &Mission, cfg: &ProtocolConfig) -> Result<UploadReport, VehicleError> {
    let items = prepare(mission)?;
    let n = items.len();
    let (ts, tc) = (session.target_system(), session.target_component());
    let mut report = UploadReport { items: n, ..Default::default() };

    session.drain(cfg.drain_window())?;
    session.send(MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
        target_system: ts,
        target_component: tc,
        ..Default::default()
    }))?;
    thread::sleep(cfg.clear_settle());

    let count_msg = MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
        count: n as u16,
        target_system: ts,
        target_component: tc,
        ..Default::default()
    });
    session.send(count_msg.clone())?;
    info!(sys = ts, count = n, "upload: count sent");

    let mut sent = vec![false; n];
    let mut remaining = n;
    let mut silences = 0u32;
    while remaining > 0 {
        match session.recv_match(cfg.item_timeout(), upload_reply)? {
            None => {
                silences += 1;
                if silences > cfg.silence_retries {
                    return Err(VehicleError::Timeout(format!(
                        "upload: no item request after {} count re-sends ({} of {} items sent)",
                        cfg.silence_retries,
                        n - remaining,
                        n
                    )));
                }
                warn!(silences, "upload: peer silent, re-sending count");
                session.send(count_msg.clone())?;
                report.count_resends += 1;
            }
            Some(PeerReply::Ack(result)) if !is_accepted(result) => return Err(rejected(result)),
            Some(PeerReply::Ack(_)) => {
                warn!(remaining, "upload: ack before all items were requested, ignored");
            }
            Some(PeerReply::RequestInt(seq)) => {
                note_request(session, &items, &mut sent, &mut remaining, &mut report, seq, true)?;
                silences = 0;
            }
            Some(PeerReply::RequestFloat(seq)) => {
                note_request(session, &items, &mut sent, &mut remaining, &mut report, seq, false)?;
                silences = 0;
            }
        }
    }
    info!(sys = ts, count = n, "upload: all items sent, awaiting ack");

    // requests still arriving here are answered again; the deadline stays put
    let deadline = Instant::now() + cfg.ack_timeout();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match session.recv_match(left, upload_reply)? {
            None => return Err(VehicleError::Timeout(format!("upload: no ack within {:?}", cfg.ack_timeout()))),
            Some(PeerReply::Ack(result)) if is_accepted(result) => break,
            Some(PeerReply::Ack(result)) => return Err(rejected(result)),
            Some(PeerReply::RequestInt(seq)) => {
                if answer(session, &items, seq, true)? {
                    report.repeated_requests += 1;
                }
            }
            Some(PeerReply::RequestFloat(seq)) => {
                if answer(session, &items, seq, false)? {
                    report.repeated_requests += 1;
                }
            }
        }
    }

    session.send(MavMessage::MISSION_SET_CURRENT(MISSION_SET_CURRENT_DATA {
        seq: 0,
        target_system: ts,
        target_component: tc,
    }))?;
    info!(
        sys = ts,
        count = n,
        count_resends = report.count_resends,
        repeated = report.repeated_requests,
        "upload: done, current set to 0"
    );
    Ok(report)
}

fn note_request(
    session: &mut LinkSession,
    items: &[WireItem],
    sent: &mut [bool],
    remaining: &mut usize,
    report: &mut UploadReport,
    seq: u16,
    int_variant: bool,
) -> Result<(), VehicleError> {
    if !answer(session, items, seq, int_variant)? {
        return Ok(());
    }
    let slot = &mut sent[usize::from(seq)];
    if *slot {
        report.repeated_requests += 1;
    } else {
        *slot = true;
        *remaining -= 1;
    }
    Ok(())
}

/// Vehicle-to-ground transfer. Returns the whole list or nothing.
pub fn download(session: &mut LinkSession, cfg: &ProtocolConfig) -> Result<Mission, VehicleError> {
    let (ts, tc) = (session.target_system(), session.target_component());
    let retries = cfg.download_retries.max(1);
    let wait = cfg.download_timeout();

    session.drain(cfg.drain_window())?;

    let mut count = None;
    for attempt in 1..=retries {
        session.send(MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
            target_system: ts,
            target_component: tc,
            ..Default::default()
        }))?;
        count = session.recv_match(wait, |m| match m {
            MavMessage::MISSION_COUNT(c) => Some(c.count),
            _ => None,
        })?;
        if count.is_some() {
            break;
        }
        warn!(attempt, "download: no count yet");
    }
    let count = count.ok_or_else(|| VehicleError::Timeout(format!("download: no count after {} requests", retries)))?;
    info!(sys = ts, count, "download: count received");

    let mut items = Vec::with_capacity(usize::from(count));
    for seq in 0..count {
        let wp = fetch_item(session, seq, retries, cfg)?;
        items.push(wp);
    }

    session.send(MavMessage::MISSION_ACK(MISSION_ACK_DATA {
        target_system: ts,
        target_component: tc,
        mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
        ..Default::default()
    }))?;
    info!(sys = ts, count, "download: done");
    Ok(Mission::new(items))
}

/// One index: integer request first, float request as fallback, and only
/// a reply carrying exactly `seq` counts.
fn fetch_item(session: &mut LinkSession, seq: u16, retries: u32, cfg: &ProtocolConfig) -> Result<Waypoint, VehicleError> {
    let (ts, tc) = (session.target_system(), session.target_component());
    let wait = cfg.download_timeout();

    for attempt in 1..=retries {
        session.send(MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            seq,
            target_system: ts,
            target_component: tc,
            ..Default::default()
        }))?;
        let mut reply = session.recv_match(wait, decode_item)?;
        if reply.is_none() {
            debug!(seq, attempt, "download: no int reply, trying float request");
            session.send(MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA {
                seq,
                target_system: ts,
                target_component: tc,
                ..Default::default()
            }))?;
            reply = session.recv_match(wait, decode_item)?;
        }
        match reply {
            Some(wp) if wp.seq == seq => return Ok(wp),
            Some(wp) => warn!(seq, got = wp.seq, attempt, "download: item for another seq, retrying"),
            None => warn!(seq, attempt, "download: no reply"),
        }
    }
    Err(VehicleError::ItemMissing { seq, attempts: retries })
}
