//! Plain-text mission files ("QGC WPL 110").
//!
//! One header line, then one record per waypoint with 12 tab-separated
//! fields: `seq current frame command p1 p2 p3 p4 lat lon alt autocontinue`.
//! Params and coordinates carry 8 decimals, altitude 6.

use std::fs;
use std::path::{Path, PathBuf};

use fleet_proto::mission::{cmd, frame};
use fleet_proto::{HomePosition, Mission, Waypoint, WaypointPatch, WaypointSpec};
use tracing::{info, warn};

use crate::{doctor, MissionError};

pub const HEADER: &str = "QGC WPL 110";
pub const FIELD_COUNT: usize = 12;

const DEFAULT_FRAME: u8 = frame::GLOBAL_RELATIVE_ALT;
const DEFAULT_ALT_M: f64 = 100.0;

/// How a new mission file is assembled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CreatePlan {
    /// The waypoint list is the whole mission.
    Manual,
    /// Home + takeoff are synthesized in front of the user points and the
    /// last point becomes a landing.
    Auto { home: HomePosition },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseReport {
    pub mission: Mission,
    /// Data lines dropped because they did not split into 12 fields.
    pub skipped_lines: usize,
}

/// Build the waypoint list for a new mission without touching the disk.
pub fn build(takeoff_alt_m: f64, waypoints: &[WaypointSpec], plan: CreatePlan) -> Result<Mission, MissionError> {
    doctor::check_waypoints(waypoints)?;

    let items = match plan {
        CreatePlan::Manual => {
            if waypoints.is_empty() {
                return Err(MissionError::Validation(
                    "manual mode needs the complete waypoint list".into(),
                ));
            }
            waypoints
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let seq = spec.seq.unwrap_or(i as u16);
                    from_spec(seq, spec, seq == 0)
                })
                .collect::<Vec<_>>()
        }
        CreatePlan::Auto { home } => {
            doctor::check_takeoff_altitude(takeoff_alt_m)?;
            doctor::check_home(&home)?;

            let home_alt = home.alt.unwrap_or(takeoff_alt_m);
            let mut items = Vec::with_capacity(waypoints.len() + 2);

            let mut start = Waypoint::nav(0, frame::GLOBAL, cmd::NAV_WAYPOINT, home.lat, home.lon, home_alt);
            start.current = true;
            items.push(start);
            items.push(Waypoint::nav(1, frame::GLOBAL, cmd::NAV_TAKEOFF, home.lat, home.lon, takeoff_alt_m));

            for (i, spec) in waypoints.iter().enumerate() {
                let mut wp = from_spec(i as u16 + 2, spec, false);
                // seq and current are owned by the generator in auto mode
                wp.current = false;
                items.push(wp);
            }

            if let Some(last) = items.last_mut() {
                last.command = cmd::NAV_LAND;
                last.alt = 0.0;
            }
            items
        }
    };

    let mission = Mission::new(items);
    if let Some((pos, seq)) = mission.first_gap() {
        return Err(MissionError::Validation(format!(
            "waypoint sequence must be contiguous from 0 (position {} has seq {})",
            pos, seq
        )));
    }
    Ok(mission)
}

fn from_spec(seq: u16, spec: &WaypointSpec, current_default: bool) -> Waypoint {
    Waypoint {
        seq,
        current: spec.current.unwrap_or(current_default),
        frame: spec.frame.unwrap_or(DEFAULT_FRAME),
        command: spec.command.unwrap_or(cmd::NAV_WAYPOINT),
        param1: spec.param1.unwrap_or(0.0),
        param2: spec.param2.unwrap_or(0.0),
        param3: spec.param3.unwrap_or(0.0),
        param4: spec.param4.unwrap_or(0.0),
        lat: spec.lat.unwrap_or(0.0),
        lon: spec.lon.unwrap_or(0.0),
        alt: spec.alt.unwrap_or(DEFAULT_ALT_M),
        autocontinue: spec.autocontinue.unwrap_or(true),
    }
}

/// Build a mission and write it to `path`.
pub fn create(
    path: &Path,
    takeoff_alt_m: f64,
    waypoints: &[WaypointSpec],
    plan: CreatePlan,
) -> Result<Mission, MissionError> {
    let mission = build(takeoff_alt_m, waypoints, plan)?;
    write(path, &mission)?;
    info!(path = %path.display(), items = mission.len(), "mission file created");
    Ok(mission)
}

pub fn format_record(wp: &Waypoint) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{:.8}\t{:.8}\t{:.8}\t{:.8}\t{:.8}\t{:.8}\t{:.6}\t{}",
        wp.seq,
        u8::from(wp.current),
        wp.frame,
        wp.command,
        wp.param1,
        wp.param2,
        wp.param3,
        wp.param4,
        wp.lat,
        wp.lon,
        wp.alt,
        u8::from(wp.autocontinue),
    )
}

pub fn render(mission: &Mission) -> String {
    let mut out = String::with_capacity(64 * (mission.len() + 1));
    out.push_str(HEADER);
    out.push('\n');
    for wp in &mission.items {
        out.push_str(&format_record(wp));
        out.push('\n');
    }
    out
}

/// Whole-file write through a sibling temp file and a rename.
pub fn write(path: &Path, mission: &Mission) -> Result<(), MissionError> {
    write_text(path, &render(mission))
}

fn write_text(path: &Path, text: &str) -> Result<(), MissionError> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| MissionError::io(dir, e))?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, text).map_err(|e| MissionError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        MissionError::io(path, e)
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_text(path: &Path) -> Result<String, MissionError> {
    fs::read_to_string(path).map_err(|e| MissionError::io(path, e))
}

/// Split off and validate the header, returning the data lines.
fn body<'a>(path: &Path, text: &'a str) -> Result<(&'a str, Vec<&'a str>), MissionError> {
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    if !header.starts_with(HEADER) {
        return Err(MissionError::format(path, format!("missing '{}' header", HEADER)));
    }
    Ok((header, lines.collect()))
}

fn split_record(line: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = line.trim().split('\t').collect();
    (parts.len() == FIELD_COUNT).then_some(parts)
}

fn parse_fields(parts: &[&str]) -> Result<Waypoint, String> {
    fn int<T: std::str::FromStr>(s: &str, name: &str) -> Result<T, String> {
        s.trim().parse().map_err(|_| format!("{} is not an integer: {:?}", name, s))
    }
    fn float(s: &str, name: &str) -> Result<f64, String> {
        s.trim().parse().map_err(|_| format!("{} is not a number: {:?}", name, s))
    }

    Ok(Waypoint {
        seq: int(parts[0], "seq")?,
        current: int::<i64>(parts[1], "current")? != 0,
        frame: int(parts[2], "frame")?,
        command: int(parts[3], "command")?,
        param1: float(parts[4], "param1")?,
        param2: float(parts[5], "param2")?,
        param3: float(parts[6], "param3")?,
        param4: float(parts[7], "param4")?,
        lat: float(parts[8], "lat")?,
        lon: float(parts[9], "lon")?,
        alt: float(parts[10], "alt")?,
        autocontinue: int::<i64>(parts[11], "autoContinue")? != 0,
    })
}

pub fn parse(path: &Path) -> Result<ParseReport, MissionError> {
    let text = read_text(path)?;
    parse_str(path, &text)
}

/// Lines that do not have exactly 12 fields are skipped and counted;
/// a 12-field line with a malformed number is a format error.
pub fn parse_str(path: &Path, text: &str) -> Result<ParseReport, MissionError> {
    let (_, lines) = body(path, text)?;
    let mut items = Vec::with_capacity(lines.len());
    let mut skipped_lines = 0;

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(parts) = split_record(line) else {
            skipped_lines += 1;
            continue;
        };
        let wp = parse_fields(&parts)
            .map_err(|reason| MissionError::format(path, format!("line {}: {}", i + 2, reason)))?;
        items.push(wp);
    }

    if skipped_lines > 0 {
        warn!(path = %path.display(), skipped_lines, "mission file has malformed lines, skipped");
    }
    Ok(ParseReport { mission: Mission::new(items), skipped_lines })
}

fn apply(wp: &mut Waypoint, patch: &WaypointPatch) {
    if let Some(v) = patch.lat { wp.lat = v; }
    if let Some(v) = patch.lon { wp.lon = v; }
    if let Some(v) = patch.alt { wp.alt = v; }
    if let Some(v) = patch.command { wp.command = v; }
    if let Some(v) = patch.frame { wp.frame = v; }
    if let Some(v) = patch.param1 { wp.param1 = v; }
    if let Some(v) = patch.param2 { wp.param2 = v; }
    if let Some(v) = patch.param3 { wp.param3 = v; }
    if let Some(v) = patch.param4 { wp.param4 = v; }
    if let Some(v) = patch.autocontinue { wp.autocontinue = v; }
    if let Some(v) = patch.current { wp.current = v; }
}

/// Patch the record(s) carrying `seq` and rewrite the file; every other
/// line is kept byte for byte.
pub fn modify(path: &Path, seq: u16, patch: &WaypointPatch) -> Result<Waypoint, MissionError> {
    let text = read_text(path)?;
    let (header, lines) = body(path, &text)?;

    let mut out = String::with_capacity(text.len() + 16);
    out.push_str(header);
    out.push('\n');

    let mut updated = None;
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        let parts = split_record(line).ok_or_else(|| {
            MissionError::format(path, format!("line {}: expected {} tab-separated fields", i + 2, FIELD_COUNT))
        })?;
        let mut wp = parse_fields(&parts)
            .map_err(|reason| MissionError::format(path, format!("line {}: {}", i + 2, reason)))?;

        if wp.seq == seq {
            apply(&mut wp, patch);
            out.push_str(&format_record(&wp));
            updated = Some(wp);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    let wp = updated.ok_or_else(|| MissionError::SeqNotFound { path: path.to_path_buf(), seq })?;
    write_text(path, &out)?;
    info!(path = %path.display(), seq, "mission waypoint modified");
    Ok(wp)
}
