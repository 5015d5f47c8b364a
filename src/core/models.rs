use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::paths::to_posix;

/// A device as reported by the bridge. Re-derived on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub authorised: bool,
    /// Friendly "Manufacturer Model" name, only known for authorised devices.
    #[serde(rename = "name", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// User preferences snapshot consumed by a backup job.
///
/// Field names follow the external settings store so the front-end can post its
/// stored object unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adb_device: Option<String>,
    pub destination_path: String,
    #[serde(default)]
    pub ignored_dirs: Vec<String>,
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default)]
    pub set_exif: bool,
    #[serde(default)]
    pub skip_dot: bool,
    #[serde(default)]
    pub move_files: bool,
    #[serde(default)]
    pub remove_temp_files: bool,
}

impl UserConfig {
    /// Ignored directories as normalized POSIX paths, empty entries dropped.
    pub fn normalized_ignored_dirs(&self) -> Vec<String> {
        self.ignored_dirs
            .iter()
            .map(|d| to_posix(d.trim()))
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// File extensions lower-cased and dot-prefixed.
    pub fn normalized_file_types(&self) -> Vec<String> {
        self.file_types
            .iter()
            .map(|ext| ext.trim().to_lowercase())
            .filter(|ext| !ext.is_empty())
            .map(|ext| {
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{ext}")
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// One user-facing line in a job's log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since the Unix epoch, fractional.
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub severity: Severity,
    #[serde(rename = "content")]
    pub message: String,
}

impl LogEntry {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
            severity,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Severity::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scanning,
    Transferring,
    Finalizing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanning => "scanning",
            Self::Transferring => "transferring",
            Self::Finalizing => "finalizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time view of a job, served by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub device_serial: String,
    pub status: JobStatus,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
