use std::sync::Arc;
use std::time::Duration;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::{
    BridgeSupervisor, DeviceBridge, DeviceRegistry, EngineSettings, JobRegistry,
};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub supervisor: Arc<BridgeSupervisor>,
    pub bridge: Arc<dyn DeviceBridge>,
    pub devices: Arc<DeviceRegistry>,
    pub jobs: Arc<JobRegistry>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let supervisor = Arc::new(BridgeSupervisor::new(config.bridge.clone()));
        let bridge = adapters::get_bridge(config.simulation, supervisor.clone());
        Self::with_bridge(config, supervisor, bridge)
    }

    /// Build a context around an already constructed bridge.
    pub fn with_bridge(
        config: AppConfig,
        supervisor: Arc<BridgeSupervisor>,
        bridge: Arc<dyn DeviceBridge>,
    ) -> Self {
        let devices = Arc::new(DeviceRegistry::new(bridge.clone()));
        let jobs = Arc::new(JobRegistry::new(
            devices.clone(),
            bridge.clone(),
            EngineSettings::from_config(&config),
            Duration::from_secs(config.job_grace_secs),
        ));

        Self {
            config: Arc::new(config),
            supervisor,
            bridge,
            devices,
            jobs,
        }
    }
}
