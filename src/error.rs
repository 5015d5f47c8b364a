//! Error taxonomy shared by the engine, the HTTP surface and the client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the device-bridge daemon.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Daemon process not running or not answering. Recover with a (re)start.
    #[error("Could not connect to the bridge daemon: {0}")]
    Unreachable(String),

    /// Daemon is up but not ready yet. Recover by waiting, not restarting.
    #[error("Bridge daemon is still initializing: {0}")]
    Initializing(String),

    /// The daemon answered but no longer sees the device.
    #[error("Device is no longer available: {0}")]
    DeviceMissing(String),

    /// The daemon answered but the command itself failed.
    #[error("Bridge command failed: {0}")]
    Command(String),
}

/// Failures launching the daemon process.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to launch bridge daemon: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge daemon did not report readiness within {timeout_secs}s")]
    ReadyTimeout { timeout_secs: u64 },

    #[error("Bridge daemon exited before becoming ready (exit code {code:?})")]
    ExitedEarly { code: Option<i32> },

    #[error("Bridge supervisor has been shut down")]
    ShutDown,
}

/// Start-request rejections. Raised before any job object exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("already running")]
    AlreadyRunning,

    #[error("No device selected for backup")]
    DeviceNotSelected,

    #[error("Device {serial} is not connected or not authorised for ADB")]
    DeviceUnauthorised { serial: String },

    #[error("Invalid backup configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("jobId does not correspond to a known backup job: {job_id}")]
pub struct NotFoundError {
    pub job_id: String,
}

/// A single file failed to transfer. Logged; the job carries on.
#[derive(Error, Debug)]
#[error("{path}: {reason}")]
pub struct TransferError {
    pub path: String,
    pub reason: String,
}

/// Conditions that end a job without success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobFatal {
    #[error("Lost connection to the bridge daemon: {0}")]
    BridgeLost(String),

    #[error("Device {0} was disconnected")]
    DeviceLost(String),

    #[error("Destination {} is not writable: {reason}", path.display())]
    DestinationUnwritable { path: PathBuf, reason: String },

    #[error("{0}")]
    Internal(String),

    #[error("{failed} of {total} file(s) failed to transfer")]
    PartialFailure { failed: usize, total: usize },

    #[error("Backup cancelled")]
    Cancelled,
}

impl JobFatal {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BridgeLost(_) => ErrorKind::BridgeUnreachable,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DeviceLost(_) | Self::DestinationUnwritable { .. } | Self::Internal(_) => {
                ErrorKind::JobFatal
            }
        }
    }
}

/// Machine-checkable discriminator carried by every error response and
/// terminal error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    BridgeUnreachable,
    BridgeInitializing,
    AlreadyRunning,
    DeviceNotSelected,
    DeviceUnauthorised,
    NotFound,
    SpawnFailed,
    JobFatal,
    PartialFailure,
    Cancelled,
    BadRequest,
    Internal,
    /// Client side: the service itself could not be reached.
    Backend,
    /// Client side: the event stream closed without a terminal event.
    Unknown,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BridgeUnreachable | Self::SpawnFailed => 503,
            Self::BridgeInitializing | Self::AlreadyRunning => 409,
            Self::DeviceNotSelected | Self::BadRequest | Self::Cancelled => 400,
            Self::DeviceUnauthorised => 403,
            Self::NotFound => 404,
            Self::JobFatal
            | Self::PartialFailure
            | Self::Internal
            | Self::Backend
            | Self::Unknown => 500,
        }
    }

    /// Best-effort kind for a response that carried no `kind` field.
    pub fn from_status(status: u16) -> Self {
        match status {
            503 => Self::BridgeUnreachable,
            409 => Self::BridgeInitializing,
            404 => Self::NotFound,
            403 => Self::DeviceUnauthorised,
            400 => Self::BadRequest,
            _ => Self::Internal,
        }
    }

    /// True when the client may recover by restarting or waiting on the bridge.
    pub fn is_bridge_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BridgeUnreachable | Self::BridgeInitializing | Self::SpawnFailed
        )
    }
}

impl From<&BridgeError> for ErrorKind {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::Unreachable(_) => Self::BridgeUnreachable,
            BridgeError::Initializing(_) => Self::BridgeInitializing,
            BridgeError::DeviceMissing(_) => Self::DeviceUnauthorised,
            BridgeError::Command(_) => Self::Internal,
        }
    }
}

impl From<&AdmissionError> for ErrorKind {
    fn from(err: &AdmissionError) -> Self {
        match err {
            AdmissionError::AlreadyRunning => Self::AlreadyRunning,
            AdmissionError::DeviceNotSelected => Self::DeviceNotSelected,
            AdmissionError::DeviceUnauthorised { .. } => Self::DeviceUnauthorised,
            AdmissionError::InvalidConfig(_) => Self::BadRequest,
            AdmissionError::Bridge(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::BridgeUnreachable).unwrap();
        assert_eq!(json, r#""bridge-unreachable""#);
        let json = serde_json::to_string(&ErrorKind::BridgeInitializing).unwrap();
        assert_eq!(json, r#""bridge-initializing""#);
    }

    #[test]
    fn test_bridge_errors_map_to_distinct_statuses() {
        let unreachable = ErrorKind::from(&BridgeError::Unreachable("x".into()));
        let initializing = ErrorKind::from(&BridgeError::Initializing("x".into()));
        assert_eq!(unreachable.status_code(), 503);
        assert_eq!(initializing.status_code(), 409);
    }

    #[test]
    fn test_already_running_detail() {
        assert_eq!(AdmissionError::AlreadyRunning.to_string(), "already running");
        assert_eq!(
            ErrorKind::from(&AdmissionError::AlreadyRunning),
            ErrorKind::AlreadyRunning
        );
    }

    #[test]
    fn test_bridge_lost_is_bridge_unreachable() {
        let fatal = JobFatal::BridgeLost("gone".into());
        assert_eq!(fatal.kind(), ErrorKind::BridgeUnreachable);
        assert_eq!(fatal.kind().status_code(), 503);
    }

    #[test]
    fn test_only_bridge_kinds_are_recoverable() {
        assert!(ErrorKind::BridgeUnreachable.is_bridge_recoverable());
        assert!(ErrorKind::BridgeInitializing.is_bridge_recoverable());
        assert!(ErrorKind::SpawnFailed.is_bridge_recoverable());
        assert!(!ErrorKind::Backend.is_bridge_recoverable());
        assert!(!ErrorKind::DeviceUnauthorised.is_bridge_recoverable());
    }

    #[test]
    fn test_job_outcomes_have_their_own_kinds() {
        let partial = JobFatal::PartialFailure { failed: 1, total: 3 };
        assert_eq!(partial.kind(), ErrorKind::PartialFailure);
        assert_eq!(partial.to_string(), "1 of 3 file(s) failed to transfer");
        assert_eq!(JobFatal::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            JobFatal::DeviceLost("dev".into()).kind(),
            ErrorKind::JobFatal
        );
    }
}
