//! The single "current job" slot.
//!
//! Only one backup may be non-terminal at a time. The slot is guarded by an
//! async mutex held across admission, so two concurrent start requests can
//! never both create a job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::bridge::DeviceBridge;
use super::devices::DeviceRegistry;
use super::engine::{BackupEngine, EngineSettings};
use super::events::{EventBroadcaster, EventStream};
use super::models::{JobSnapshot, JobStatus, UserConfig};
use super::progress::JobTracker;
use crate::error::{AdmissionError, NotFoundError};

/// Everything shared between a running job, its engine and its observers.
pub struct JobHandle {
    pub id: String,
    pub device_serial: String,
    /// Snapshot taken at admission; later settings edits do not reach the job.
    pub config: Arc<UserConfig>,
    pub tracker: JobTracker,
    pub events: EventBroadcaster,
    pub cancel: CancellationToken,
}

impl JobHandle {
    pub fn new(device_serial: &str, config: UserConfig) -> Self {
        let id = Uuid::now_v7().to_string();
        Self {
            tracker: JobTracker::new(&id, device_serial),
            id,
            device_serial: device_serial.to_string(),
            config: Arc::new(config),
            events: EventBroadcaster::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.tracker.status().is_terminal()
    }
}

type Slot = Arc<Mutex<Option<Arc<JobHandle>>>>;

pub struct JobRegistry {
    current: Slot,
    devices: Arc<DeviceRegistry>,
    bridge: Arc<dyn DeviceBridge>,
    settings: EngineSettings,
    /// How long a finished job stays attachable.
    grace: Duration,
}

impl JobRegistry {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        bridge: Arc<dyn DeviceBridge>,
        settings: EngineSettings,
        grace: Duration,
    ) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            devices,
            bridge,
            settings,
            grace,
        }
    }

    /// Admit and launch a backup. Returns the new job id.
    ///
    /// The device comes from `config.adb_device`. Every rejection happens
    /// before a job exists.
    pub async fn start(&self, config: UserConfig) -> Result<String, AdmissionError> {
        let mut current = self.current.lock().await;

        if current.as_ref().is_some_and(|job| !job.is_terminal()) {
            return Err(AdmissionError::AlreadyRunning);
        }

        let serial = config
            .adb_device
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AdmissionError::DeviceNotSelected)?
            .to_string();

        if config.destination_path.trim().is_empty() {
            return Err(AdmissionError::InvalidConfig(
                "destinationPath is empty".to_string(),
            ));
        }

        if self.devices.find_authorised(&serial).await?.is_none() {
            return Err(AdmissionError::DeviceUnauthorised { serial });
        }

        let job = Arc::new(JobHandle::new(&serial, config));
        info!(job_id = %job.id, serial = %serial, "Backup job admitted");
        *current = Some(job.clone());
        drop(current);

        self.launch(job.clone());
        Ok(job.id.clone())
    }

    fn launch(&self, job: Arc<JobHandle>) {
        let engine = BackupEngine::new(job.clone(), self.bridge.clone(), self.settings.clone());
        let slot = self.current.clone();
        let grace = self.grace;

        tokio::spawn(async move {
            // The engine runs on its own task so a panic is observed here.
            if let Err(e) = tokio::spawn(engine.run()).await {
                error!(job_id = %job.id, error = %e, "Backup job task died");
                job.tracker.set_status(JobStatus::Failed);
                job.events.close();
            }

            tokio::time::sleep(grace).await;

            let mut current = slot.lock().await;
            if current.as_ref().is_some_and(|c| c.id == job.id) {
                debug!(job_id = %job.id, "Evicting finished job");
                *current = None;
            }
        });
    }

    async fn find(&self, job_id: &str) -> Result<Arc<JobHandle>, NotFoundError> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|job| job.id == job_id)
            .cloned()
            .ok_or_else(|| NotFoundError {
                job_id: job_id.to_string(),
            })
    }

    /// Subscribe to a job's events from now on.
    pub async fn attach(&self, job_id: &str) -> Result<EventStream, NotFoundError> {
        Ok(self.find(job_id).await?.events.subscribe())
    }

    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, NotFoundError> {
        Ok(self.find(job_id).await?.tracker.snapshot())
    }

    /// Request cooperative cancellation. A finished job is left as it is.
    pub async fn cancel(&self, job_id: &str) -> Result<(), NotFoundError> {
        let job = self.find(job_id).await?;
        if !job.is_terminal() {
            info!(job_id = %job.id, "Cancellation requested");
            job.cancel.cancel();
        }
        Ok(())
    }

    pub async fn current(&self) -> Option<Arc<JobHandle>> {
        self.current.lock().await.clone()
    }

    /// Cancel the running job, if any, and wait up to `wait` for it to end.
    pub async fn shutdown(&self, wait: Duration) {
        let Some(job) = self.current().await else {
            return;
        };
        if job.is_terminal() {
            return;
        }

        info!(job_id = %job.id, "Cancelling backup job for shutdown");
        job.cancel.cancel();

        let mut events = job.events.subscribe();
        let drained = tokio::time::timeout(wait, async {
            while events.next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            error!(job_id = %job.id, "Backup job did not stop in time");
        }
    }
}
