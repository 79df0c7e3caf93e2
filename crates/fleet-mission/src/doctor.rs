use std::path::Path;

use fleet_proto::{HomePosition, WaypointSpec};

use crate::MissionError;

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), MissionError> {
    if cond { Ok(()) } else { Err(MissionError::Validation(msg())) }
}

pub fn check_takeoff_altitude(alt_m: f64) -> Result<(), MissionError> {
    ensure(alt_m.is_finite() && alt_m > 0.0, || format!("takeoff altitude must be > 0 (got {})", alt_m))
}

pub fn check_home(home: &HomePosition) -> Result<(), MissionError> {
    ensure(
        home.lat.abs() <= 90.0 && home.lon.abs() <= 180.0,
        || format!("home coordinates invalid ({}, {})", home.lat, home.lon),
    )?;
    if let Some(alt) = home.alt {
        ensure(alt.is_finite(), || "home altitude is not a number".into())?;
    }
    Ok(())
}

pub fn check_waypoints(waypoints: &[WaypointSpec]) -> Result<(), MissionError> {
    for (i, wp) in waypoints.iter().enumerate() {
        if let Some(lat) = wp.lat {
            ensure(lat.abs() <= 90.0, || format!("waypoint {}: latitude {} out of range", i, lat))?;
        }
        if let Some(lon) = wp.lon {
            ensure(lon.abs() <= 180.0, || format!("waypoint {}: longitude {} out of range", i, lon))?;
        }
        if let Some(alt) = wp.alt {
            ensure(alt.is_finite(), || format!("waypoint {}: altitude is not a number", i))?;
        }
    }
    Ok(())
}

/// The missions directory must exist as a directory or be creatable.
pub fn check_missions_dir(dir: &Path) -> Result<(), MissionError> {
    if dir.exists() {
        ensure(dir.is_dir(), || format!("{} is not a directory", dir.display()))
    } else {
        std::fs::create_dir_all(dir).map_err(|e| MissionError::io(dir, e))
    }
}
