use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::bridge::{DeviceBridge, RemoteEntry};
use crate::core::models::Device;
use crate::core::paths;
use crate::error::BridgeError;

/// Daemon condition the simulated bridge reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedDaemon {
    Running,
    Initializing,
    Down,
}

#[derive(Debug, Clone)]
struct SimulatedFile {
    bytes: Vec<u8>,
    mtime: i64,
}

#[derive(Debug, Clone)]
struct SimulatedDevice {
    authorised: bool,
    name: String,
    files: BTreeMap<String, SimulatedFile>,
}

struct SimulatedState {
    daemon: SimulatedDaemon,
    devices: BTreeMap<String, SimulatedDevice>,
    failing_pulls: HashSet<String>,
    /// Take the daemon down once this many pulls have succeeded.
    down_after_pulls: Option<usize>,
    pulls: usize,
    pull_delay: Option<Duration>,
}

type Shared = Arc<Mutex<SimulatedState>>;

fn lock(state: &Shared) -> MutexGuard<'_, SimulatedState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Controller handle for injecting devices, files and faults.
#[derive(Clone)]
pub struct Simulator {
    state: Shared,
}

impl Simulator {
    pub fn add_device(&self, serial: &str, authorised: bool) {
        lock(&self.state).devices.insert(
            serial.to_string(),
            SimulatedDevice {
                authorised,
                name: format!("Simulated {serial}"),
                files: BTreeMap::new(),
            },
        );
    }

    pub fn remove_device(&self, serial: &str) {
        lock(&self.state).devices.remove(serial);
    }

    pub fn set_authorised(&self, serial: &str, authorised: bool) {
        if let Some(device) = lock(&self.state).devices.get_mut(serial) {
            device.authorised = authorised;
        }
    }

    /// Add a file at an absolute device path, creating the device if needed.
    pub fn add_file(&self, serial: &str, path: &str, bytes: &[u8], mtime: i64) {
        let mut state = lock(&self.state);
        let device = state
            .devices
            .entry(serial.to_string())
            .or_insert_with(|| SimulatedDevice {
                authorised: true,
                name: format!("Simulated {serial}"),
                files: BTreeMap::new(),
            });
        device.files.insert(
            paths::to_posix(path),
            SimulatedFile {
                bytes: bytes.to_vec(),
                mtime,
            },
        );
    }

    /// Paths currently present on the device.
    pub fn files(&self, serial: &str) -> Vec<String> {
        lock(&self.state)
            .devices
            .get(serial)
            .map(|d| d.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_daemon(&self, daemon: SimulatedDaemon) {
        lock(&self.state).daemon = daemon;
    }

    /// Simulate the daemon being killed externally.
    pub fn kill_daemon(&self) {
        self.set_daemon(SimulatedDaemon::Down);
    }

    pub fn fail_pull(&self, path: &str) {
        lock(&self.state).failing_pulls.insert(paths::to_posix(path));
    }

    pub fn kill_daemon_after_pulls(&self, pulls: usize) {
        lock(&self.state).down_after_pulls = Some(pulls);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        lock(&self.state).pull_delay = Some(delay);
    }

    pub fn pull_count(&self) -> usize {
        lock(&self.state).pulls
    }
}

/// In-memory device bridge for `--simulation` and tests.
pub struct SimulatedBridge {
    state: Shared,
}

impl SimulatedBridge {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimulatedState {
            daemon: SimulatedDaemon::Running,
            devices: BTreeMap::new(),
            failing_pulls: HashSet::new(),
            down_after_pulls: None,
            pulls: 0,
            pull_delay: None,
        }));

        (
            Self {
                state: state.clone(),
            },
            Simulator { state },
        )
    }

    fn check_daemon(state: &SimulatedState) -> Result<(), BridgeError> {
        match state.daemon {
            SimulatedDaemon::Running => Ok(()),
            SimulatedDaemon::Initializing => Err(BridgeError::Initializing(
                "simulated daemon is initializing".to_string(),
            )),
            SimulatedDaemon::Down => Err(BridgeError::Unreachable(
                "simulated daemon is not running".to_string(),
            )),
        }
    }

    fn with_device<T>(
        &self,
        serial: &str,
        f: impl FnOnce(&mut SimulatedDevice) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let mut state = lock(&self.state);
        Self::check_daemon(&state)?;
        match state.devices.get_mut(serial) {
            Some(device) if device.authorised => f(device),
            Some(_) => Err(BridgeError::DeviceMissing(format!(
                "device '{serial}' unauthorized"
            ))),
            None => Err(BridgeError::DeviceMissing(format!(
                "device '{serial}' not found"
            ))),
        }
    }
}

#[async_trait]
impl DeviceBridge for SimulatedBridge {
    async fn probe(&self) -> Result<(), BridgeError> {
        Self::check_daemon(&lock(&self.state))
    }

    async fn list_devices(&self) -> Result<Vec<Device>, BridgeError> {
        let state = lock(&self.state);
        Self::check_daemon(&state)?;

        Ok(state
            .devices
            .iter()
            .map(|(serial, device)| Device {
                serial: serial.clone(),
                authorised: device.authorised,
                display_name: device.authorised.then(|| device.name.clone()),
            })
            .collect())
    }

    async fn list_dir(&self, serial: &str, dir: &str) -> Result<Vec<RemoteEntry>, BridgeError> {
        let dir = paths::to_posix(dir);
        self.with_device(serial, |device| {
            let mut children: BTreeMap<String, bool> = BTreeMap::new();

            for path in device.files.keys() {
                let Some(rest) = paths::relative_to(path, &dir) else {
                    continue;
                };
                if rest.is_empty() {
                    continue;
                }
                match rest.split_once('/') {
                    Some((child, _)) => {
                        children.insert(paths::join(&dir, child), true);
                    }
                    None => {
                        children.entry(paths::join(&dir, rest)).or_insert(false);
                    }
                }
            }

            if children.is_empty() {
                return Err(BridgeError::Command(format!(
                    "ls: {dir}: No such file or directory"
                )));
            }

            Ok(children
                .into_iter()
                .map(|(path, is_dir)| RemoteEntry { path, is_dir })
                .collect())
        })
    }

    async fn modified_time(&self, serial: &str, path: &str) -> Result<i64, BridgeError> {
        self.with_device(serial, |device| {
            device
                .files
                .get(path)
                .map(|f| f.mtime)
                .ok_or_else(|| BridgeError::Command(format!("stat: {path}: No such file")))
        })
    }

    async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<(), BridgeError> {
        let delay = lock(&self.state).pull_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = lock(&self.state).failing_pulls.contains(remote);
        let bytes = self.with_device(serial, |device| {
            if failing {
                return Err(BridgeError::Command(format!(
                    "adb: error: failed to copy '{remote}': remote read failed"
                )));
            }
            device
                .files
                .get(remote)
                .map(|f| f.bytes.clone())
                .ok_or_else(|| {
                    BridgeError::Command(format!("adb: error: remote object '{remote}' does not exist"))
                })
        })?;

        tokio::fs::write(local, &bytes)
            .await
            .map_err(|e| BridgeError::Command(format!("cannot create '{}': {e}", local.display())))?;

        let mut state = lock(&self.state);
        state.pulls += 1;
        if state.down_after_pulls.is_some_and(|n| state.pulls >= n) {
            state.daemon = SimulatedDaemon::Down;
        }
        Ok(())
    }

    async fn remove(&self, serial: &str, path: &str) -> Result<(), BridgeError> {
        self.with_device(serial, |device| {
            device.files.remove(path);
            Ok(())
        })
    }

    async fn is_alive(&self) -> bool {
        lock(&self.state).daemon == SimulatedDaemon::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_dir_derives_directories() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_file("dev", "/sdcard/DCIM/Camera/a.jpg", b"a", 1);
        sim.add_file("dev", "/sdcard/notes.txt", b"n", 1);

        let entries = bridge.list_dir("dev", "/sdcard").await.unwrap();
        assert_eq!(
            entries,
            vec![
                RemoteEntry { path: "/sdcard/DCIM".into(), is_dir: true },
                RemoteEntry { path: "/sdcard/notes.txt".into(), is_dir: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_unauthorised_device_rejects_file_ops() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("dev", false);
        let result = bridge.list_dir("dev", "/sdcard").await;
        assert!(matches!(result, Err(BridgeError::DeviceMissing(_))));

        let devices = bridge.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].authorised);
        assert!(devices[0].display_name.is_none());
    }

    #[tokio::test]
    async fn test_daemon_states() {
        let (bridge, sim) = SimulatedBridge::new();
        assert!(bridge.probe().await.is_ok());

        sim.set_daemon(SimulatedDaemon::Initializing);
        assert!(matches!(bridge.list_devices().await, Err(BridgeError::Initializing(_))));

        sim.kill_daemon();
        assert!(matches!(bridge.list_devices().await, Err(BridgeError::Unreachable(_))));
        assert!(!bridge.is_alive().await);
    }

    #[tokio::test]
    async fn test_pull_and_kill_after() {
        let temp = tempfile::tempdir().unwrap();
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_file("dev", "/sdcard/a.jpg", b"abc", 7);
        sim.kill_daemon_after_pulls(1);

        let local = temp.path().join("a.jpg");
        bridge.pull("dev", "/sdcard/a.jpg", &local).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"abc");
        assert!(!bridge.is_alive().await);
        assert_eq!(sim.pull_count(), 1);
    }
}
