pub mod error;
pub mod mission;
pub mod telemetry;

pub use error::{ErrorBody, ErrorKind};
pub use mission::{HomePosition, Mission, MissionMode, Waypoint, WaypointPatch, WaypointSpec};
pub use telemetry::{FlightInfo, Freshness, VehicleSummary};
