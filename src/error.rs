use thiserror::Error;

use crate::types::Mode;

/// Failures while acquiring the camera or running the detector. All of them
/// are recoverable by retrying `start` or `record`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("landmark detector failed to initialize: {0}")]
    DetectorInitFailed(String),
    #[error("landmark detector stopped working: {0}")]
    DetectorFailed(String),
}

impl CaptureError {
    /// Sorts a raw device error message into denied vs. unavailable.
    pub fn from_device_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        if ["permission", "denied", "not authorized", "unauthorized"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            CaptureError::PermissionDenied(message)
        } else {
            CaptureError::DeviceUnavailable(message)
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("gesture label must not be empty")]
    EmptyLabel,
    #[error("sample count must be a positive integer, got {0}")]
    NonPositiveTarget(i64),
    #[error("sample count must be a number, got {0:?}")]
    NonNumericTarget(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("unexpected reply from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("{endpoint} rejected the request: {message}")]
    Rejected { endpoint: String, message: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("{command} is not available while {mode}")]
    InvalidCommand { command: &'static str, mode: Mode },
    #[error("nothing to resubmit")]
    NothingToResubmit,
    #[error("unknown command {0:?}, type `help` for a list")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}
