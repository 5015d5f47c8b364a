use std::sync::Arc;

use tracing::debug;

use super::bridge::DeviceBridge;
use super::models::Device;
use crate::error::BridgeError;

/// Live read model over the bridge's device list. Nothing is cached.
pub struct DeviceRegistry {
    bridge: Arc<dyn DeviceBridge>,
}

impl DeviceRegistry {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self { bridge }
    }

    /// Current devices, sorted by serial.
    ///
    /// A bridge that is not running fails with `Unreachable` (start it) and a
    /// starting or initializing one with `Initializing` (wait and retry).
    pub async fn list_devices(&self) -> Result<Vec<Device>, BridgeError> {
        let mut devices = self.bridge.list_devices().await?;
        devices.sort_by(|a, b| a.serial.cmp(&b.serial));
        debug!(count = devices.len(), "Listed devices");
        Ok(devices)
    }

    /// The device with this serial, if it is present and authorised.
    pub async fn find_authorised(&self, serial: &str) -> Result<Option<Device>, BridgeError> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.serial == serial && d.authorised))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimulatedBridge, SimulatedDaemon};

    #[tokio::test]
    async fn test_devices_sorted_and_filtered() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("ZX1", true);
        sim.add_device("AB2", false);
        let registry = DeviceRegistry::new(Arc::new(bridge));

        let serials: Vec<String> = registry
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.serial)
            .collect();
        assert_eq!(serials, vec!["AB2", "ZX1"]);

        assert!(registry.find_authorised("ZX1").await.unwrap().is_some());
        assert!(registry.find_authorised("AB2").await.unwrap().is_none());
        assert!(registry.find_authorised("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bridge_conditions_stay_distinct() {
        let (bridge, sim) = SimulatedBridge::new();
        let registry = DeviceRegistry::new(Arc::new(bridge));

        sim.set_daemon(SimulatedDaemon::Initializing);
        assert!(matches!(
            registry.list_devices().await,
            Err(BridgeError::Initializing(_))
        ));

        sim.kill_daemon();
        assert!(matches!(
            registry.list_devices().await,
            Err(BridgeError::Unreachable(_))
        ));
    }
}
