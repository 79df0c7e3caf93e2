use serde::{Deserialize, Serialize};

/// Failure categories reported at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Format,
    Timeout,
    ItemMissing,
    UnsupportedMode,
    NoData,
    StaleData,
    Rejected,
    Link,
    Storage,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation | ErrorKind::Format | ErrorKind::UnsupportedMode => 400,
            ErrorKind::Timeout => 504,
            ErrorKind::NoData | ErrorKind::StaleData => 503,
            ErrorKind::ItemMissing | ErrorKind::Rejected | ErrorKind::Link => 502,
            ErrorKind::Storage => 500,
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::NotFound => 2,
            ErrorKind::Validation => 3,
            ErrorKind::Format => 4,
            ErrorKind::Timeout => 5,
            ErrorKind::ItemMissing => 6,
            ErrorKind::UnsupportedMode => 7,
            ErrorKind::NoData => 8,
            ErrorKind::StaleData => 9,
            ErrorKind::Rejected => 10,
            ErrorKind::Link => 11,
            ErrorKind::Storage => 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}
