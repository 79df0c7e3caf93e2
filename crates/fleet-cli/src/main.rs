use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use fleet_link::doctor as link_doctor;
use fleet_link::{ProtocolConfig, Vehicle, VehicleConfig, VehicleError, VehicleId, VehicleRegistry};
use fleet_mission::{catalog, doctor as mission_doctor, store};
use fleet_mission::{CreatePlan, ListOptions, MissionError, SortKey, SortOrder};
use fleet_proto::{ErrorBody, HomePosition, MissionMode, WaypointPatch, WaypointSpec};

#[derive(Debug, Parser)]
#[command(name = "fleet", version, about = "Multi-vehicle MAVLink ground control")]
struct Cli {
    #[arg(long, default_value = "fleet.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config and the missions directory.
    Doctor,
    /// Connect every configured vehicle and print its link summary.
    Vehicles,
    /// Print one normalized status record.
    FlightInfo {
        id: VehicleId,
        #[arg(long)]
        allow_stale: bool,
        /// Query the vehicle instead of reading the telemetry cache.
        #[arg(long)]
        direct: bool,
        /// How long to let the cache fill after connecting.
        #[arg(long, default_value_t = 1500)]
        warmup_ms: u64,
    },
    /// Print a status record every interval until ctrl-c.
    Monitor {
        id: VehicleId,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// List mission files.
    Missions {
        #[arg(long = "ext")]
        exts: Vec<String>,
        #[arg(long)]
        recursive: bool,
        #[arg(long, default_value = "mtime")]
        sort: String,
        #[arg(long, default_value = "desc")]
        order: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    Mission {
        #[command(subcommand)]
        cmd: MissionCmd,
    },
    /// Switch flight mode by name.
    Mode { id: VehicleId, mode: String },
    /// Arm and start the uploaded mission.
    Start { id: VehicleId },
    Rtl { id: VehicleId },
    Land { id: VehicleId },
}

#[derive(Debug, Subcommand)]
enum MissionCmd {
    /// Write a new mission file.
    Create {
        name: String,
        /// Vehicle used for the home position of auto missions.
        #[arg(long)]
        vehicle: Option<VehicleId>,
        #[arg(long, default_value_t = 10.0)]
        takeoff_alt: f64,
        #[arg(long, default_value = "auto")]
        mode: MissionMode,
        /// JSON array of waypoint objects.
        #[arg(long)]
        waypoints: Option<PathBuf>,
        /// `lat,lon[,alt]`, repeatable; appended after --waypoints.
        #[arg(long = "wp", value_parser = parse_point)]
        points: Vec<WaypointSpec>,
        /// `lat,lon[,alt]`
        #[arg(long, value_parser = parse_home)]
        home: Option<HomePosition>,
    },
    /// Print a mission file as JSON.
    Show { name: String },
    /// Upload a mission file to a vehicle.
    Send { id: VehicleId, name: String },
    /// Update fields of one waypoint: `key=value ...`.
    Modify {
        name: String,
        seq: u16,
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Read the vehicle's mission, optionally saving it.
    Download {
        id: VehicleId,
        #[arg(long)]
        out: Option<String>,
    },
}

/// Time given to the reader to fill the cache before the home position
/// falls back to a direct query.
const HOME_WARMUP: Duration = Duration::from_millis(1500);

fn default_missions_dir() -> PathBuf {
    PathBuf::from("missions")
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default = "default_missions_dir")]
    missions_dir: PathBuf,
    log: Option<LogCfg>,
    #[serde(default)]
    protocol: ProtocolConfig,
    #[serde(default)]
    vehicles: Vec<VehicleConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct LogCfg {
    /// Session logs go to `<dir>/<date>/<time>.log`.
    dir: PathBuf,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

fn open_session_log(dir: &Path) -> Result<std::fs::File> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let day = now.format(format_description!("[year]-[month]-[day]")).context("format log date")?;
    let stamp = now.format(format_description!("[hour]-[minute]-[second]")).context("format log time")?;
    let day_dir = dir.join(day);
    std::fs::create_dir_all(&day_dir).with_context(|| format!("create log dir {}", day_dir.display()))?;
    let path = day_dir.join(format!("{}.log", stamp));
    std::fs::File::create(&path).with_context(|| format!("create log file {}", path.display()))
}

fn init_tracing(log: Option<&LogCfg>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = log.map(|l| open_session_log(&l.dir)).transpose()?;
    let file_layer = file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn parse_coords(s: &str) -> Result<(f64, f64, Option<f64>), String> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{}': {}", p, e)))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [lat, lon] => Ok((*lat, *lon, None)),
        [lat, lon, alt] => Ok((*lat, *lon, Some(*alt))),
        _ => Err(format!("expected lat,lon[,alt], got '{}'", s)),
    }
}

fn parse_home(s: &str) -> Result<HomePosition, String> {
    let (lat, lon, alt) = parse_coords(s)?;
    Ok(HomePosition { lat, lon, alt })
}

fn parse_point(s: &str) -> Result<WaypointSpec, String> {
    let (lat, lon, alt) = parse_coords(s)?;
    Ok(WaypointSpec { lat: Some(lat), lon: Some(lon), alt, ..Default::default() })
}

const PATCH_KEYS: &[&str] = &[
    "lat", "lon", "alt", "command", "frame", "param1", "param2", "param3", "param4", "autoContinue", "current",
];

/// `key=value` pairs into a patch; numbers stay integers where they can.
fn parse_patch(fields: &[String]) -> Result<WaypointPatch> {
    let mut obj = serde_json::Map::new();
    for field in fields {
        let (key, value) = field.split_once('=').with_context(|| format!("expected key=value, got '{}'", field))?;
        let key = match key.trim() {
            k if k.eq_ignore_ascii_case("autocontinue") => "autoContinue",
            k => PATCH_KEYS
                .iter()
                .copied()
                .find(|p| *p == k)
                .with_context(|| format!("unknown waypoint field '{}' (known: {})", k, PATCH_KEYS.join(", ")))?,
        };
        let value = value.trim();
        let json = if let Ok(i) = value.parse::<i64>() {
            serde_json::Value::from(i)
        } else if let Ok(f) = value.parse::<f64>() {
            serde_json::Value::from(f)
        } else if let Ok(b) = value.parse::<bool>() {
            serde_json::Value::from(b)
        } else {
            bail!("{}: '{}' is not a number", key, value);
        };
        obj.insert(key.to_string(), json);
    }
    let patch: WaypointPatch = serde_json::from_value(serde_json::Value::Object(obj)).context("waypoint fields")?;
    if patch.is_empty() {
        bail!("no waypoint fields to update");
    }
    Ok(patch)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encode output")?);
    Ok(())
}

/// Library failures as an error body on stderr plus a per-kind exit code.
fn report(e: &anyhow::Error) -> i32 {
    let body = if let Some(v) = e.downcast_ref::<VehicleError>() {
        Some(v.to_body())
    } else {
        e.downcast_ref::<MissionError>().map(|m| ErrorBody::new(m.kind(), m.to_string()))
    };
    match body {
        Some(body) => {
            let code = body.kind.exit_code();
            match serde_json::to_string(&body) {
                Ok(s) => eprintln!("{}", s),
                Err(_) => eprintln!("error: {}", body.message),
            }
            code
        }
        None => {
            eprintln!("error: {:#}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    init_tracing(cfg.log.as_ref())?;

    let res = match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Vehicles => vehicles(&cfg).await,
        Command::FlightInfo { id, allow_stale, direct, warmup_ms } => {
            flight_info(&cfg, id, allow_stale, direct, Duration::from_millis(warmup_ms)).await
        }
        Command::Monitor { id, interval_ms } => monitor(&cfg, id, Duration::from_millis(interval_ms)).await,
        Command::Missions { exts, recursive, sort, order, limit } => {
            missions(&cfg, exts, recursive, &sort, &order, limit)
        }
        Command::Mission { cmd } => mission_cmd(&cfg, cmd).await,
        Command::Mode { id, mode } => {
            let out = with_vehicle(&cfg, id, |v| async move { v.set_mode(&mode).await }).await?;
            print_json(&out)
        }
        Command::Start { id } => print_json(&with_vehicle(&cfg, id, |v| async move { v.start_mission().await }).await?),
        Command::Rtl { id } => print_json(&with_vehicle(&cfg, id, |v| async move { v.return_to_launch().await }).await?),
        Command::Land { id } => print_json(&with_vehicle(&cfg, id, |v| async move { v.land().await }).await?),
    };

    if let Err(e) = res {
        std::process::exit(report(&e));
    }
    Ok(())
}

/// Connect `id`, run `f`, then stop the session whatever `f` returned.
async fn with_vehicle<T, F, Fut>(cfg: &Config, id: VehicleId, f: F) -> Result<T>
where
    F: FnOnce(Arc<Vehicle>) -> Fut,
    Fut: std::future::Future<Output = Result<T, VehicleError>>,
{
    let reg = VehicleRegistry::connect_one(&cfg.vehicles, id, &cfg.protocol).await?;
    let res = f(reg.get(id)?).await;
    reg.shutdown_all().await;
    Ok(res?)
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    link_doctor::check_protocol(&cfg.protocol)?;
    if cfg.vehicles.is_empty() {
        warn!("doctor: no vehicles configured");
    } else {
        link_doctor::check_vehicles(&cfg.vehicles)?;
    }
    mission_doctor::check_missions_dir(&cfg.missions_dir)?;
    if let Some(log) = &cfg.log {
        std::fs::create_dir_all(&log.dir).with_context(|| format!("log dir {}", log.dir.display()))?;
    }
    info!(vehicles = cfg.vehicles.len(), missions_dir = %cfg.missions_dir.display(), "doctor: OK");
    Ok(())
}

async fn vehicles(cfg: &Config) -> Result<()> {
    let reg = VehicleRegistry::connect_all(&cfg.vehicles, &cfg.protocol).await;
    let summaries = reg.summaries();
    reg.shutdown_all().await;
    print_json(&summaries)
}

async fn flight_info(cfg: &Config, id: VehicleId, allow_stale: bool, direct: bool, warmup: Duration) -> Result<()> {
    let info = with_vehicle(cfg, id, |v| async move {
        if direct {
            return v.flight_info_direct().await;
        }
        let deadline = Instant::now() + warmup;
        loop {
            match v.flight_info(allow_stale) {
                Err(VehicleError::NoData(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await
                }
                other => return other,
            }
        }
    })
    .await?;
    print_json(&info)
}

async fn monitor(cfg: &Config, id: VehicleId, every: Duration) -> Result<()> {
    with_vehicle(cfg, id, |v| async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tick.tick() => match v.flight_info(true) {
                    Ok(info) => match serde_json::to_string(&info) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(error = %e, "encode flight info"),
                    },
                    Err(e) => warn!(vehicle = v.id(), error = %e, "no flight info yet"),
                },
            }
        }
        Ok(())
    })
    .await
}

fn missions(
    cfg: &Config,
    exts: Vec<String>,
    recursive: bool,
    sort: &str,
    order: &str,
    limit: Option<usize>,
) -> Result<()> {
    let mut opts = ListOptions {
        recursive,
        sort: sort.parse::<SortKey>()?,
        order: order.parse::<SortOrder>()?,
        limit,
        ..Default::default()
    };
    if !exts.is_empty() {
        opts.exts = exts;
    }
    print_json(&catalog::list_missions(&cfg.missions_dir, &opts)?)
}

fn load_waypoints(path: Option<&Path>) -> Result<Vec<WaypointSpec>> {
    let Some(path) = path else { return Ok(Vec::new()) };
    let s = std::fs::read_to_string(path).with_context(|| format!("read waypoints {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse waypoints {}", path.display()))
}

async fn mission_cmd(cfg: &Config, cmd: MissionCmd) -> Result<()> {
    match cmd {
        MissionCmd::Create { name, vehicle, takeoff_alt, mode, waypoints, points, home } => {
            catalog::ensure_mission_extension(&name)?;
            mission_doctor::check_takeoff_altitude(takeoff_alt)?;
            if let Some(h) = &home {
                mission_doctor::check_home(h)?;
            }
            let mut specs = load_waypoints(waypoints.as_deref())?;
            specs.extend(points);
            mission_doctor::check_waypoints(&specs)?;
            mission_doctor::check_missions_dir(&cfg.missions_dir)?;
            let path = catalog::resolve(&cfg.missions_dir, &name);

            let mission = match (mode, home, vehicle) {
                (MissionMode::Manual, _, _) => store::create(&path, takeoff_alt, &specs, CreatePlan::Manual)?,
                (MissionMode::Auto, Some(home), _) => store::create(&path, takeoff_alt, &specs, CreatePlan::Auto { home })?,
                (MissionMode::Auto, None, Some(id)) => {
                    let path = path.clone();
                    with_vehicle(cfg, id, |v| async move {
                        let warmup = Instant::now() + HOME_WARMUP;
                        while matches!(v.flight_info(false), Err(VehicleError::NoData(_))) && Instant::now() < warmup {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        v.create_mission(&path, takeoff_alt, &specs, MissionMode::Auto, None).await
                    })
                    .await?
                }
                (MissionMode::Auto, None, None) => bail!("auto missions need --home or --vehicle"),
            };
            info!(path = %path.display(), items = mission.len(), "mission created");
            print_json(&mission)
        }
        MissionCmd::Show { name } => {
            let path = catalog::existing(&cfg.missions_dir, &name)?;
            let report = store::parse(&path)?;
            if report.skipped_lines > 0 {
                warn!(path = %path.display(), skipped = report.skipped_lines, "malformed lines skipped");
            }
            print_json(&report.mission)
        }
        MissionCmd::Send { id, name } => {
            let path = catalog::existing(&cfg.missions_dir, &name)?;
            let report = with_vehicle(cfg, id, |v| async move { v.send_mission_file(&path).await }).await?;
            print_json(&report)
        }
        MissionCmd::Modify { name, seq, fields } => {
            let patch = parse_patch(&fields)?;
            let path = catalog::existing(&cfg.missions_dir, &name)?;
            print_json(&store::modify(&path, seq, &patch)?)
        }
        MissionCmd::Download { id, out } => {
            let target = match &out {
                Some(name) => {
                    catalog::ensure_mission_extension(name)?;
                    mission_doctor::check_missions_dir(&cfg.missions_dir)?;
                    Some(catalog::resolve(&cfg.missions_dir, name))
                }
                None => None,
            };
            let mission = with_vehicle(cfg, id, |v| async move {
                match target {
                    Some(path) => v.save_downloaded_mission(&path).await,
                    None => v.download_mission().await,
                }
            })
            .await?;
            print_json(&mission)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords_with_and_without_altitude() {
        assert_eq!(parse_home("48.85,2.29").unwrap(), HomePosition { lat: 48.85, lon: 2.29, alt: None });
        let wp = parse_point("48.85, 2.29, 40").unwrap();
        assert_eq!((wp.lat, wp.lon, wp.alt), (Some(48.85), Some(2.29), Some(40.0)));
        assert!(parse_home("48.85").is_err());
        assert!(parse_home("a,b").is_err());
    }

    #[test]
    fn patch_fields() {
        let fields: Vec<String> = ["alt=55.5", "command=21", "autocontinue=0", "current=true"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let patch = parse_patch(&fields).unwrap();
        assert_eq!(patch.alt, Some(55.5));
        assert_eq!(patch.command, Some(21));
        assert_eq!(patch.autocontinue, Some(false));
        assert_eq!(patch.current, Some(true));
        assert_eq!(patch.lat, None);

        assert!(parse_patch(&["speed=3".to_string()]).is_err());
        assert!(parse_patch(&["alt".to_string()]).is_err());
        assert!(parse_patch(&["alt=high".to_string()]).is_err());
    }

    #[test]
    fn config_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [[vehicles]]
            id = 1
            endpoint = "udpin:0.0.0.0:14550"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.missions_dir, PathBuf::from("missions"));
        assert!(cfg.log.is_none());
        assert_eq!(cfg.vehicles[0].baud, fleet_link::DEFAULT_BAUD);
        assert!(link_doctor::check_protocol(&cfg.protocol).is_ok());
    }

    #[test]
    fn library_errors_map_to_exit_codes() {
        let e = anyhow::Error::new(VehicleError::VehicleNotFound(4));
        assert_eq!(report(&e), 2);
        let e = anyhow::Error::new(MissionError::Validation("x".into()));
        assert_eq!(report(&e), 3);
        assert_eq!(report(&anyhow::anyhow!("plain")), 1);
    }
}
