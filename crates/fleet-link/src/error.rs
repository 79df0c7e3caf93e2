//! Failures of the vehicle session layer.

use fleet_mission::MissionError;
use fleet_proto::{ErrorBody, ErrorKind};

use crate::VehicleId;

#[derive(Debug, thiserror::Error)]
pub enum VehicleError {
    #[error("vehicle {0} not found")]
    VehicleNotFound(VehicleId),

    #[error("vehicle {0} is already registered")]
    DuplicateVehicle(VehicleId),

    #[error("no telemetry received yet ({0})")]
    NoData(String),

    #[error("telemetry is stale: {0}")]
    StaleData(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("mission item {seq} missing after {attempts} attempts")]
    ItemMissing { seq: u16, attempts: u32 },

    #[error("mode '{mode}' not supported (known: {known})")]
    UnsupportedMode { mode: String, known: String },

    #[error("vehicle rejected {what}: {result}")]
    Rejected { what: String, result: String },

    #[error("waypoint {seq} cannot be encoded: {reason}")]
    Unencodable { seq: u16, reason: String },

    #[error("bad endpoint '{0}'")]
    Endpoint(String),

    #[error("config: {0}")]
    Config(String),

    #[error("command worker stopped")]
    WorkerGone,

    #[error("link i/o: {0}")]
    Link(#[from] std::io::Error),

    #[error(transparent)]
    Mission(#[from] MissionError),
}

impl VehicleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VehicleError::VehicleNotFound(_) => ErrorKind::NotFound,
            VehicleError::DuplicateVehicle(_) | VehicleError::Endpoint(_) | VehicleError::Config(_) => {
                ErrorKind::Validation
            }
            VehicleError::NoData(_) => ErrorKind::NoData,
            VehicleError::StaleData(_) => ErrorKind::StaleData,
            VehicleError::Timeout(_) => ErrorKind::Timeout,
            VehicleError::ItemMissing { .. } => ErrorKind::ItemMissing,
            VehicleError::UnsupportedMode { .. } => ErrorKind::UnsupportedMode,
            VehicleError::Rejected { .. } => ErrorKind::Rejected,
            VehicleError::Unencodable { .. } => ErrorKind::Format,
            VehicleError::WorkerGone | VehicleError::Link(_) => ErrorKind::Link,
            VehicleError::Mission(e) => e.kind(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.kind(), self.to_string())
    }
}
