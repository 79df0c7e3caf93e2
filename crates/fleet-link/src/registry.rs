//! Per-vehicle sessions and the registry that owns them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use fleet_mission::{catalog, store};
use fleet_mission::{CreatePlan, ParseReport};
use fleet_proto::{FlightInfo, HomePosition, Mission, MissionMode, VehicleSummary, WaypointSpec};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::{Command, CommandOutcome, CommandQueue};
use crate::flight_info::{build_from_cache, query_direct};
use crate::handshake::{await_handshake, Peer};
use crate::mav::{open_link, Endpoint, LinkSession};
use crate::state::LinkStatus;
use crate::telemetry::{run_reader, ReaderCtx, TelemetryCache};
use crate::transfer::{self, UploadReport};
use crate::{LinkArbiter, ProtocolConfig, VehicleConfig, VehicleError};

pub type VehicleId = u32;

/// One connected vehicle: its link, reader, cache and command worker.
pub struct Vehicle {
    id: VehicleId,
    endpoint: String,
    baud: u32,
    peer: Peer,
    cfg: ProtocolConfig,
    arbiter: Arc<LinkArbiter>,
    cache: Arc<TelemetryCache>,
    status: Arc<Mutex<LinkStatus>>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    commands: Mutex<Option<CommandQueue>>,
    command_worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Vehicle {
    /// Open the endpoint, wait for the vehicle heartbeat and start the
    /// background workers.
    pub async fn connect(vc: &VehicleConfig, cfg: &ProtocolConfig) -> Result<Self, VehicleError> {
        let endpoint: Endpoint = vc.endpoint.parse()?;
        let (baud, sys, comp, wait) = (vc.baud, cfg.gcs_system_id, cfg.gcs_component_id, cfg.handshake_timeout());
        let session = tokio::task::spawn_blocking(move || -> Result<LinkSession, VehicleError> {
            let mut link = open_link(&endpoint, baud)?;
            let peer = await_handshake(link.as_mut(), wait)?;
            Ok(LinkSession::new(link, sys, comp, peer))
        })
        .await
        .map_err(|_| VehicleError::WorkerGone)??;
        Ok(Self::start(vc.id, vc.endpoint.clone(), vc.baud, session, cfg.clone()))
    }

    /// Start the reader and the command worker on an established session.
    /// Must be called from within a tokio runtime.
    pub fn start(id: VehicleId, endpoint: String, baud: u32, session: LinkSession, cfg: ProtocolConfig) -> Self {
        let peer = session.peer().clone();
        let arbiter = Arc::new(LinkArbiter::new(session));
        let cache = Arc::new(TelemetryCache::new());
        let status = Arc::new(Mutex::new(LinkStatus { connected: true, ..Default::default() }));
        let stop = Arc::new(AtomicBool::new(false));

        let ctx = ReaderCtx {
            vehicle_id: id,
            arbiter: arbiter.clone(),
            cache: cache.clone(),
            status: status.clone(),
            stop: stop.clone(),
            cfg: cfg.clone(),
        };
        let reader = tokio::task::spawn_blocking(move || run_reader(ctx));
        let (commands, command_worker) = CommandQueue::spawn(id, arbiter.clone(), cfg.clone());

        info!(vehicle = id, %endpoint, sys = peer.system_id, mavtype = ?peer.mavtype, "vehicle session started");
        Self {
            id,
            endpoint,
            baud,
            peer,
            cfg,
            arbiter,
            cache,
            status,
            stop,
            reader: Mutex::new(Some(reader)),
            commands: Mutex::new(Some(commands)),
            command_worker: Mutex::new(Some(command_worker)),
        }
    }

    pub fn id(&self) -> VehicleId {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn status(&self) -> LinkStatus {
        lock(&self.status).clone()
    }

    pub fn summary(&self) -> VehicleSummary {
        let st = self.status();
        VehicleSummary {
            id: self.id,
            endpoint: self.endpoint.clone(),
            baud: self.baud,
            connected: st.connected,
            heartbeat_age_s: st.hb_age().map(|d| d.as_secs_f64()),
        }
    }

    /// Run `f` on the link off the async executor.
    async fn on_link<T, F>(&self, f: F) -> Result<T, VehicleError>
    where
        T: Send + 'static,
        F: FnOnce(&mut LinkSession, &ProtocolConfig) -> Result<T, VehicleError> + Send + 'static,
    {
        let arbiter = self.arbiter.clone();
        let cfg = self.cfg.clone();
        tokio::task::spawn_blocking(move || arbiter.with_exclusive_link(|s| f(s, &cfg)))
            .await
            .map_err(|_| VehicleError::WorkerGone)?
    }

    /// Snapshot from the telemetry cache; never touches the link.
    pub fn flight_info(&self, allow_stale: bool) -> Result<FlightInfo, VehicleError> {
        build_from_cache(self.id, &self.cache.snapshot(), self.cfg.stale_threshold(), allow_stale, Instant::now())
    }

    pub async fn flight_info_direct(&self) -> Result<FlightInfo, VehicleError> {
        let id = self.id;
        self.on_link(move |s, cfg| query_direct(s, id, cfg)).await
    }

    /// Write a new mission file. In auto mode without a home override the
    /// home comes from fresh cached telemetry, else from a direct query.
    pub async fn create_mission(
        &self,
        path: &Path,
        takeoff_alt_m: f64,
        waypoints: &[WaypointSpec],
        mode: MissionMode,
        home: Option<HomePosition>,
    ) -> Result<Mission, VehicleError> {
        let plan = match mode {
            MissionMode::Manual => CreatePlan::Manual,
            MissionMode::Auto => {
                let home = match home {
                    Some(h) => h,
                    None => {
                        let info = match self.flight_info(false) {
                            Ok(info) => info,
                            Err(e) => {
                                warn!(vehicle = self.id, error = %e, "no fresh cached position, asking the vehicle");
                                self.flight_info_direct().await?
                            }
                        };
                        HomePosition { lat: info.latitude, lon: info.longitude, alt: Some(info.altitude_m) }
                    }
                };
                CreatePlan::Auto { home }
            }
        };
        Ok(store::create(path, takeoff_alt_m, waypoints, plan)?)
    }

    pub async fn upload_mission(&self, mission: Mission) -> Result<UploadReport, VehicleError> {
        let id = self.id;
        let report = self.on_link(move |s, cfg| transfer::upload(s, &mission, cfg)).await?;
        info!(vehicle = id, items = report.items, "mission uploaded");
        Ok(report)
    }

    /// Parse a mission file and upload it.
    pub async fn send_mission_file(&self, path: &Path) -> Result<UploadReport, VehicleError> {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        catalog::ensure_mission_extension(&name)?;
        let ParseReport { mission, skipped_lines } = store::parse(path)?;
        if skipped_lines > 0 {
            warn!(vehicle = self.id, path = %path.display(), skipped_lines, "uploading with skipped lines");
        }
        self.upload_mission(mission).await
    }

    pub async fn download_mission(&self) -> Result<Mission, VehicleError> {
        self.on_link(transfer::download).await
    }

    /// Download the vehicle's mission into a mission file.
    pub async fn save_downloaded_mission(&self, path: &Path) -> Result<Mission, VehicleError> {
        let mission = self.download_mission().await?;
        store::write(path, &mission)?;
        info!(vehicle = self.id, path = %path.display(), items = mission.len(), "downloaded mission saved");
        Ok(mission)
    }

    pub async fn command(&self, cmd: Command) -> Result<CommandOutcome, VehicleError> {
        let queue = lock(&self.commands).clone().ok_or(VehicleError::WorkerGone)?;
        queue.submit(cmd).await
    }

    pub async fn set_mode(&self, mode: &str) -> Result<CommandOutcome, VehicleError> {
        self.command(Command::SetMode(mode.to_string())).await
    }

    pub async fn start_mission(&self) -> Result<CommandOutcome, VehicleError> {
        self.command(Command::StartMission).await
    }

    pub async fn return_to_launch(&self) -> Result<CommandOutcome, VehicleError> {
        self.command(Command::ReturnToLaunch).await
    }

    pub async fn land(&self) -> Result<CommandOutcome, VehicleError> {
        self.command(Command::Land).await
    }

    /// Stop the reader and the command worker, each with a bounded wait.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        drop(lock(&self.commands).take());

        let wait = self.cfg.reader_join_timeout();
        let handles = [("reader", lock(&self.reader).take()), ("command worker", lock(&self.command_worker).take())];
        for (what, handle) in handles {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(wait, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(vehicle = self.id, error = %e, "{} panicked", what),
                Err(_) => warn!(vehicle = self.id, "{} did not stop within {:?}", what, wait),
            }
        }
        lock(&self.status).connected = false;
        info!(vehicle = self.id, "vehicle session stopped");
    }
}

impl Drop for Vehicle {
    fn drop(&mut self) {
        // the reader notices within one poll; the worker when the queue drops
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// All connected vehicles, by id.
#[derive(Default)]
pub struct VehicleRegistry {
    vehicles: BTreeMap<VehicleId, Arc<Vehicle>>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vehicle: Vehicle) -> Result<Arc<Vehicle>, VehicleError> {
        let id = vehicle.id();
        if self.vehicles.contains_key(&id) {
            return Err(VehicleError::DuplicateVehicle(id));
        }
        let vehicle = Arc::new(vehicle);
        self.vehicles.insert(id, vehicle.clone());
        Ok(vehicle)
    }

    pub fn get(&self, id: VehicleId) -> Result<Arc<Vehicle>, VehicleError> {
        self.vehicles.get(&id).cloned().ok_or(VehicleError::VehicleNotFound(id))
    }

    pub fn summaries(&self) -> Vec<VehicleSummary> {
        self.vehicles.values().map(|v| v.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// Connect every configured vehicle. Failures are logged and skipped,
    /// so one unreachable vehicle does not block the others.
    pub async fn connect_all(configs: &[VehicleConfig], cfg: &ProtocolConfig) -> Self {
        let mut reg = Self::new();
        for vc in configs {
            match Vehicle::connect(vc, cfg).await {
                Ok(v) => {
                    if let Err(e) = reg.insert(v) {
                        warn!(vehicle = vc.id, error = %e, "vehicle skipped");
                    }
                }
                Err(e) => warn!(vehicle = vc.id, endpoint = %vc.endpoint, error = %e, "vehicle connect failed"),
            }
        }
        info!(connected = reg.len(), configured = configs.len(), "vehicle registry ready");
        reg
    }

    /// Connect only `id`.
    pub async fn connect_one(configs: &[VehicleConfig], id: VehicleId, cfg: &ProtocolConfig) -> Result<Self, VehicleError> {
        let vc = configs.iter().find(|v| v.id == id).ok_or(VehicleError::VehicleNotFound(id))?;
        let mut reg = Self::new();
        reg.insert(Vehicle::connect(vc, cfg).await?)?;
        Ok(reg)
    }

    pub async fn shutdown_all(&self) {
        for v in self.vehicles.values() {
            v.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_proto::WaypointSpec;

    use super::*;
    use crate::dialect::{MavMessage, MavResult, COMMAND_ACK_DATA};
    use crate::sim::{self, SimLink};

    fn vehicle_with(link: SimLink, id: VehicleId) -> Vehicle {
        Vehicle::start(id, "udpin:127.0.0.1:0".into(), 57600, sim::session(link), sim::fast_config())
    }

    #[tokio::test]
    async fn registry_lookup_and_duplicates() {
        let mut reg = VehicleRegistry::new();
        let (a, _) = SimLink::new(|_| vec![]);
        let (b, _) = SimLink::new(|_| vec![]);
        reg.insert(vehicle_with(a, 1)).unwrap();
        let dup = reg.insert(vehicle_with(b, 1));
        assert!(matches!(dup, Err(VehicleError::DuplicateVehicle(1))));
        assert!(matches!(reg.get(2), Err(VehicleError::VehicleNotFound(2))));
        assert_eq!(reg.summaries().len(), 1);
        assert!(reg.summaries()[0].connected);
        reg.shutdown_all().await;
        assert!(!reg.get(1).unwrap().summary().connected);
    }

    #[tokio::test]
    async fn reader_feeds_cached_flight_info() {
        let (mut link, _) = SimLink::new(|_| vec![]);
        link.push(sim::heartbeat(true, 5));
        link.push(sim::position(488_512_345, 22_912_345, 20_000));
        let v = vehicle_with(link, 3);

        let deadline = Instant::now() + Duration::from_secs(2);
        let info = loop {
            match v.flight_info(false) {
                Ok(info) => break info,
                Err(VehicleError::NoData(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await
                }
                Err(e) => panic!("{}", e),
            }
        };
        assert_eq!(info.vehicle_id, 3);
        assert_eq!(info.flight_mode, "LOITER");
        assert_eq!(info.altitude_m, 20.0);
        v.shutdown().await;
    }

    #[tokio::test]
    async fn auto_mission_uses_the_home_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto.waypoints");
        let (link, sent) = SimLink::new(|_| vec![]);
        let v = vehicle_with(link, 1);

        let wps = vec![WaypointSpec { lat: Some(48.85), lon: Some(2.29), ..Default::default() }];
        let home = HomePosition { lat: 48.84, lon: 2.28, alt: None };
        let mission = v.create_mission(&path, 30.0, &wps, MissionMode::Auto, Some(home)).await.unwrap();

        assert_eq!(mission.len(), 3);
        assert_eq!(mission.items[0].alt, 30.0);
        assert_eq!(mission.items[2].alt, 0.0);
        assert!(path.exists());
        v.shutdown().await;
        // only reader traffic went out
        assert!(sent.lock().unwrap().iter().all(|m| matches!(
            m,
            MavMessage::HEARTBEAT(_) | MavMessage::REQUEST_DATA_STREAM(_)
        )));
    }

    #[tokio::test]
    async fn commands_go_through_the_worker() {
        let (link, _) = SimLink::new(|m| match m {
            MavMessage::COMMAND_LONG(c) => vec![MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                command: c.command,
                result: MavResult::MAV_RESULT_ACCEPTED,
                ..Default::default()
            })],
            _ => vec![],
        });
        let v = vehicle_with(link, 1);
        let out = v.set_mode("rtl").await.unwrap();
        assert_eq!(out, CommandOutcome::ModeSet { mode: "RTL".into(), id: 6 });
        assert_eq!(v.land().await.unwrap(), CommandOutcome::Landing);
        v.shutdown().await;
        assert!(matches!(v.set_mode("rtl").await, Err(VehicleError::WorkerGone)));
    }
}
