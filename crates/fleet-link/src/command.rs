//! Flight commands and the per-vehicle command worker.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dialect::{MavCmd, MavMessage, MavResult};
use crate::handshake::is_vehicle_heartbeat;
use crate::mav::LinkSession;
use crate::modes::{self, is_armed, VehicleClass};
use crate::{LinkArbiter, ProtocolConfig, VehicleError};

const QUEUE_DEPTH: usize = 8;

/// `param1` of DO_SET_MODE: custom mode enabled.
const CUSTOM_MODE_ENABLED: f32 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode(String),
    StartMission,
    ReturnToLaunch,
    Land,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    ModeSet { mode: String, id: u32 },
    MissionStarted,
    /// `issued` is false when the vehicle was disarmed and nothing was sent.
    ReturnToLaunch { issued: bool },
    Landing,
}

impl Command {
    /// How long a caller waits for the worker to finish this command.
    pub fn deadline(&self, cfg: &ProtocolConfig) -> Duration {
        match self {
            Command::StartMission => {
                cfg.command_timeout() + cfg.arm_timeout() + (cfg.step_settle() + cfg.command_ack_timeout()) * 3
            }
            Command::ReturnToLaunch => cfg.command_timeout() + cfg.direct_query_timeout(),
            _ => cfg.command_timeout(),
        }
    }
}

fn class_of(session: &LinkSession) -> VehicleClass {
    VehicleClass::from_mav_type(session.peer().mavtype)
}

/// Wait for the COMMAND_ACK of `command`. A missing ack is not an error.
fn await_ack(session: &mut LinkSession, command: MavCmd, cfg: &ProtocolConfig) -> Result<(), VehicleError> {
    let ack = session.recv_match(cfg.command_ack_timeout(), |m| match m {
        MavMessage::COMMAND_ACK(a) if a.command == command => Some(a.result),
        _ => None,
    })?;
    match ack {
        Some(MavResult::MAV_RESULT_ACCEPTED) | Some(MavResult::MAV_RESULT_IN_PROGRESS) => Ok(()),
        Some(result) => Err(VehicleError::Rejected { what: format!("{:?}", command), result: format!("{:?}", result) }),
        None => {
            warn!(?command, "no COMMAND_ACK, assuming the command went through");
            Ok(())
        }
    }
}

fn command(session: &mut LinkSession, cmd: MavCmd, params: [f32; 7], cfg: &ProtocolConfig) -> Result<(), VehicleError> {
    session.command_long(cmd, params)?;
    await_ack(session, cmd, cfg)
}

/// Switch flight mode by name, resolved against the vehicle's mode table.
pub fn set_mode(session: &mut LinkSession, name: &str, cfg: &ProtocolConfig) -> Result<u32, VehicleError> {
    let class = class_of(session);
    let id = modes::mode_id(class, name).ok_or_else(|| VehicleError::UnsupportedMode {
        mode: name.to_string(),
        known: modes::known_modes(class),
    })?;
    command(
        session,
        MavCmd::MAV_CMD_DO_SET_MODE,
        [CUSTOM_MODE_ENABLED, id as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
        cfg,
    )?;
    info!(sys = session.target_system(), mode = %name.to_uppercase(), id, "mode change sent");
    Ok(id)
}

fn await_armed(session: &mut LinkSession, cfg: &ProtocolConfig) -> Result<(), VehicleError> {
    let armed = session.recv_match(cfg.arm_timeout(), |m| match m {
        MavMessage::HEARTBEAT(hb) if is_vehicle_heartbeat(hb) && is_armed(hb) => Some(()),
        _ => None,
    })?;
    armed.ok_or_else(|| VehicleError::Timeout(format!("vehicle not armed within {:?}", cfg.arm_timeout())))
}

/// LOITER, arm, wait until armed, AUTO, then MISSION_START.
pub fn start_mission(session: &mut LinkSession, cfg: &ProtocolConfig) -> Result<(), VehicleError> {
    set_mode(session, "LOITER", cfg)?;
    thread::sleep(cfg.step_settle());

    command(session, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], cfg)?;
    await_armed(session, cfg)?;
    info!(sys = session.target_system(), "armed");
    thread::sleep(cfg.step_settle());

    set_mode(session, "AUTO", cfg)?;
    thread::sleep(cfg.step_settle());

    // first and last item 0: run the whole mission
    command(session, MavCmd::MAV_CMD_MISSION_START, [0.0; 7], cfg)?;
    info!(sys = session.target_system(), "mission started");
    Ok(())
}

/// RTL, but only for an armed vehicle. Returns whether RTL was issued.
pub fn return_to_launch(session: &mut LinkSession, cfg: &ProtocolConfig) -> Result<bool, VehicleError> {
    let armed = session
        .recv_match(cfg.direct_query_timeout(), |m| match m {
            MavMessage::HEARTBEAT(hb) if is_vehicle_heartbeat(hb) => Some(is_armed(hb)),
            _ => None,
        })?
        .ok_or_else(|| VehicleError::NoData("no heartbeat to read the armed state from".into()))?;
    if !armed {
        info!(sys = session.target_system(), "vehicle disarmed, RTL not sent");
        return Ok(false);
    }
    set_mode(session, "RTL", cfg)?;
    Ok(true)
}

pub fn land(session: &mut LinkSession, cfg: &ProtocolConfig) -> Result<(), VehicleError> {
    set_mode(session, "LAND", cfg).map(|_| ())
}

pub fn execute(session: &mut LinkSession, cmd: &Command, cfg: &ProtocolConfig) -> Result<CommandOutcome, VehicleError> {
    match cmd {
        Command::SetMode(name) => {
            let id = set_mode(session, name, cfg)?;
            Ok(CommandOutcome::ModeSet { mode: name.to_uppercase(), id })
        }
        Command::StartMission => start_mission(session, cfg).map(|_| CommandOutcome::MissionStarted),
        Command::ReturnToLaunch => return_to_launch(session, cfg).map(|issued| CommandOutcome::ReturnToLaunch { issued }),
        Command::Land => land(session, cfg).map(|_| CommandOutcome::Landing),
    }
}

struct Job {
    cmd: Command,
    reply: oneshot::Sender<Result<CommandOutcome, VehicleError>>,
}

/// Serializes commands for one vehicle through a single blocking worker.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Job>,
    cfg: ProtocolConfig,
}

impl CommandQueue {
    /// Start the worker. It exits once the queue is dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn(vehicle_id: u32, arbiter: Arc<LinkArbiter>, cfg: ProtocolConfig) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let worker_cfg = cfg.clone();
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                info!(vehicle_id, cmd = ?job.cmd, "command");
                let res = arbiter.with_exclusive_link(|s| execute(s, &job.cmd, &worker_cfg));
                if let Err(e) = &res {
                    warn!(vehicle_id, error = %e, "command failed");
                }
                // the caller may have given up already
                let _ = job.reply.send(res);
            }
            info!(vehicle_id, "command worker stopped");
        });
        (Self { tx, cfg }, handle)
    }

    pub async fn submit(&self, cmd: Command) -> Result<CommandOutcome, VehicleError> {
        let deadline = cmd.deadline(&self.cfg);
        let label = format!("{:?}", cmd);
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.tx.send(Job { cmd, reply }).await.map_err(|_| VehicleError::WorkerGone)?;
            rx.await.map_err(|_| VehicleError::WorkerGone)?
        };
        tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| VehicleError::Timeout(format!("{} not answered within {:?}", label, deadline)))?
    }
}
