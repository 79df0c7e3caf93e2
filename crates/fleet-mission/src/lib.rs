pub mod catalog;
pub mod doctor;
pub mod store;

use std::path::PathBuf;

use fleet_proto::ErrorKind;

pub use catalog::{list_missions, ListOptions, MissionFile, SortKey, SortOrder};
pub use store::{CreatePlan, ParseReport};

#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("mission file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("no waypoint with seq={seq} in {}", .path.display())]
    SeqNotFound { path: PathBuf, seq: u16 },

    #[error("invalid mission request: {0}")]
    Validation(String),

    #[error("{}: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },

    #[error("mission file i/o on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MissionError::FileNotFound(_) | MissionError::SeqNotFound { .. } => ErrorKind::NotFound,
            MissionError::Validation(_) => ErrorKind::Validation,
            MissionError::Format { .. } => ErrorKind::Format,
            MissionError::Io { .. } => ErrorKind::Storage,
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MissionError::Format { path: path.into(), reason: reason.into() }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            MissionError::FileNotFound(path)
        } else {
            MissionError::Io { path, source }
        }
    }
}
