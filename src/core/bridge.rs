use std::path::Path;

use async_trait::async_trait;

use crate::core::models::Device;
use crate::error::BridgeError;

/// One entry of a device directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Absolute POSIX path on the device.
    pub path: String,
    pub is_dir: bool,
}

/// Operations the engine needs from the device-communication daemon.
///
/// Implementations must not block the async runtime: anything that shells out
/// uses `tokio::process`.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Check the daemon answers. Distinguishes unreachable from initializing.
    async fn probe(&self) -> Result<(), BridgeError>;

    /// All devices the daemon currently sees, authorised or not.
    async fn list_devices(&self) -> Result<Vec<Device>, BridgeError>;

    /// Immediate children of `dir` (not recursive).
    async fn list_dir(&self, serial: &str, dir: &str) -> Result<Vec<RemoteEntry>, BridgeError>;

    /// Device-reported modification time, seconds since the Unix epoch.
    async fn modified_time(&self, serial: &str, path: &str) -> Result<i64, BridgeError>;

    /// Copy a device file to a local path.
    async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<(), BridgeError>;

    /// Delete a file on the device.
    async fn remove(&self, serial: &str, path: &str) -> Result<(), BridgeError>;

    /// Cheap liveness check used to decide whether a failure is fatal.
    async fn is_alive(&self) -> bool;
}
