//! The backup job state machine.
//!
//! `Pending -> Scanning -> Transferring -> Finalizing -> Succeeded`, with any
//! state able to end in `Failed` or `Cancelled`. One engine runs per job, on
//! its own task, and is the only writer of that job's state and events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::bridge::DeviceBridge;
use super::events::JobEvent;
use super::exif::{self, StampOutcome};
use super::jobs::JobHandle;
use super::models::{JobStatus, LogEntry, Severity};
use super::progress;
use super::scanner::{self, ScanNotice, ScanPolicy, WorkItem};
use super::transfer::{self, PlaceOutcome};
use crate::config::AppConfig;
use crate::error::{BridgeError, JobFatal, TransferError};
use crate::logging::LogThrottle;

/// Host-side settings a job runs with.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Device directory the walk starts from.
    pub storage_root: String,
    /// Parent of the per-run working folders.
    pub temp_root: PathBuf,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            storage_root: config.storage_root.clone(),
            temp_root: config.temp_dir.clone(),
        }
    }
}

/// What happened to one file.
#[derive(Debug)]
enum FileOutcome {
    Copied,
    Moved,
    /// Copied and verified, but the device copy could not be deleted.
    CopiedNotRemoved(String),
    AlreadyAtDestination,
}

#[derive(Debug)]
enum FileFailure {
    Transfer(TransferError),
    Bridge(BridgeError),
    Fatal(JobFatal),
}

impl From<TransferError> for FileFailure {
    fn from(err: TransferError) -> Self {
        Self::Transfer(err)
    }
}

pub struct BackupEngine {
    job: Arc<JobHandle>,
    bridge: Arc<dyn DeviceBridge>,
    settings: EngineSettings,
    work_dir: PathBuf,
    throttle: LogThrottle,
}

impl BackupEngine {
    pub fn new(job: Arc<JobHandle>, bridge: Arc<dyn DeviceBridge>, settings: EngineSettings) -> Self {
        let work_dir = settings.temp_root.join(format!(
            ".temp_{}",
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        ));

        Self {
            job,
            bridge,
            settings,
            work_dir,
            throttle: LogThrottle::new(Duration::from_millis(500)),
        }
    }

    /// Run the job to a terminal state and publish its terminal event.
    pub async fn run(self) -> JobStatus {
        let span = info_span!("backup_job", job_id = %self.job.id, serial = %self.job.device_serial);

        async {
            info!("Backup job started");
            let result = self.execute().await;

            if !matches!(result, Ok(()) | Err(JobFatal::PartialFailure { .. })) {
                self.discard_work_dir().await;
            }

            let status = match result {
                Ok(()) => {
                    if self.job.tracker.progress() < 1.0 {
                        self.report_progress(1.0);
                    }
                    self.log(LogEntry::success("Complete!"));
                    self.job.tracker.set_status(JobStatus::Succeeded);
                    self.job.events.publish(JobEvent::Complete);
                    JobStatus::Succeeded
                }
                Err(JobFatal::Cancelled) => {
                    self.log(LogEntry::warning(
                        "Backup cancelled. Files already transferred were kept.",
                    ));
                    self.finish_with_error(JobStatus::Cancelled, &JobFatal::Cancelled)
                }
                Err(fatal) => {
                    self.log(LogEntry::error(fatal.to_string()));
                    self.finish_with_error(JobStatus::Failed, &fatal)
                }
            };

            info!(status = status.as_str(), "Backup job finished");
            status
        }
        .instrument(span)
        .await
    }

    fn finish_with_error(&self, status: JobStatus, fatal: &JobFatal) -> JobStatus {
        let kind = fatal.kind();
        self.job.tracker.set_status(status);
        self.job.events.publish(JobEvent::Error {
            status: kind.status_code(),
            kind,
            detail: fatal.to_string(),
        });
        status
    }

    async fn execute(&self) -> Result<(), JobFatal> {
        let config = self.job.config.clone();
        let destination = PathBuf::from(&config.destination_path);

        // Scanning
        self.job.tracker.set_status(JobStatus::Scanning);
        self.log(LogEntry::info("Scanning device..."));

        let policy = ScanPolicy::new(&config);
        let scanned = scanner::scan(
            self.bridge.as_ref(),
            &self.job.device_serial,
            &self.settings.storage_root,
            &policy,
            &self.job.cancel,
            |notice| match notice {
                ScanNotice::Entering(dir) => self.log(LogEntry::info(format!("Scanning {dir}"))),
                ScanNotice::Unreadable { dir, error } => {
                    self.log(LogEntry::warning(format!("Could not read {dir}: {error}")))
                }
            },
        )
        .await;

        let work = match scanned {
            Ok(Some(work)) => work,
            Ok(None) => return Err(JobFatal::Cancelled),
            Err(e) => {
                return Err(match self.bridge_fatal(&e).await {
                    Some(fatal) => fatal,
                    None => JobFatal::Internal(format!(
                        "Could not read {}: {e}",
                        self.settings.storage_root
                    )),
                });
            }
        };

        self.log(LogEntry::info(format!(
            "Device scan completed: found {} file(s) to back up",
            work.len()
        )));

        // Transferring
        self.job.tracker.set_status(JobStatus::Transferring);
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| JobFatal::DestinationUnwritable {
                path: destination.clone(),
                reason: e.to_string(),
            })?;
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| {
                JobFatal::Internal(format!(
                    "Could not create working folder {}: {e}",
                    self.work_dir.display()
                ))
            })?;

        let verb = if config.move_files { "Moving" } else { "Copying" };
        self.log(LogEntry::info(format!(
            "{verb} files to {}",
            destination.display()
        )));

        let total = work.len();
        let mut failed = 0;

        for (index, item) in work.iter().enumerate() {
            if self.job.cancel.is_cancelled() {
                return Err(JobFatal::Cancelled);
            }

            match self.transfer_one(item, &destination).await {
                Ok(outcome) => self.log_outcome(item, outcome),
                Err(FileFailure::Transfer(e)) => {
                    failed += 1;
                    self.log(LogEntry::error(format!("Failed to transfer {e}")));
                }
                Err(FileFailure::Bridge(e)) => match self.bridge_fatal(&e).await {
                    Some(fatal) => return Err(fatal),
                    None => {
                        failed += 1;
                        self.log(LogEntry::error(format!(
                            "Failed to transfer {}: {e}",
                            item.relative_path
                        )));
                    }
                },
                Err(FileFailure::Fatal(fatal)) => return Err(fatal),
            }

            let value = self.report_progress(progress::fraction(index + 1, total));
            if self.throttle.should_log() {
                debug!(completed = index + 1, total, progress = value, "Transfer progress");
            }
        }

        // Finalizing
        self.job.tracker.set_status(JobStatus::Finalizing);
        self.write_last_updated(&destination).await;

        if config.remove_temp_files {
            self.log(LogEntry::info("Removing temporary files..."));
            match tokio::fs::remove_dir_all(&self.work_dir).await {
                Ok(()) => self.log(LogEntry::info("Temporary files removed")),
                Err(e) => self.log(LogEntry::warning(format!(
                    "Could not remove temporary files in {}: {e}",
                    self.work_dir.display()
                ))),
            }
        }

        if failed > 0 {
            return Err(JobFatal::PartialFailure { failed, total });
        }
        Ok(())
    }

    async fn transfer_one(&self, item: &WorkItem, destination: &Path) -> Result<FileOutcome, FileFailure> {
        let serial = &self.job.device_serial;
        let config = &self.job.config;
        let dest = transfer::local_path(destination, &item.relative_path);

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Ok(FileOutcome::AlreadyAtDestination);
        }

        let temp = transfer::local_path(&self.work_dir, &item.relative_path);
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.transfer_error(item, format!("cannot create working folder: {e}")))?;
        }

        self.bridge
            .pull(serial, &item.remote_path, &temp)
            .await
            .map_err(FileFailure::Bridge)?;

        let mtime = match self.bridge.modified_time(serial, &item.remote_path).await {
            Ok(mtime) => Some(mtime),
            Err(e @ BridgeError::Command(_)) => {
                debug!(path = %item.remote_path, error = %e, "No modification time for file");
                None
            }
            Err(e) => return Err(FileFailure::Bridge(e)),
        };

        if config.set_exif {
            if let Some(mtime) = mtime {
                self.stamp_exif(&temp, mtime).await;
            }
        }

        let placed = {
            let (temp, dest) = (temp.clone(), dest.clone());
            tokio::task::spawn_blocking(move || transfer::place_file(&temp, &dest, mtime))
                .await
                .map_err(|e| FileFailure::Fatal(JobFatal::Internal(format!("copy task failed: {e}"))))?
        };

        match placed {
            Ok(PlaceOutcome::AlreadyExists) => return Ok(FileOutcome::AlreadyAtDestination),
            Ok(PlaceOutcome::Placed { bytes }) => {
                debug!(file = %item.relative_path, bytes, "Placed file");
            }
            Err(e) if e.destination_unwritable => {
                return Err(FileFailure::Fatal(JobFatal::DestinationUnwritable {
                    path: destination.to_path_buf(),
                    reason: e.message,
                }));
            }
            Err(e) => return Err(FileFailure::Transfer(self.transfer_error(item, e.message))),
        }

        if !config.move_files {
            return Ok(FileOutcome::Copied);
        }

        let verified = {
            let (temp, dest) = (temp.clone(), dest.clone());
            tokio::task::spawn_blocking(move || transfer::same_contents(&temp, &dest))
                .await
                .map_err(|e| FileFailure::Fatal(JobFatal::Internal(format!("verify task failed: {e}"))))?
        };

        match verified {
            Ok(true) => {}
            Ok(false) => {
                return Err(FileFailure::Transfer(self.transfer_error(
                    item,
                    "copy does not match the pulled file; kept on device".to_string(),
                )));
            }
            Err(e) => {
                return Err(FileFailure::Transfer(self.transfer_error(
                    item,
                    format!("could not verify copy ({e}); kept on device"),
                )));
            }
        }

        match self.bridge.remove(serial, &item.remote_path).await {
            Ok(()) => Ok(FileOutcome::Moved),
            Err(e @ BridgeError::Command(_)) => Ok(FileOutcome::CopiedNotRemoved(e.to_string())),
            Err(e) => Err(FileFailure::Bridge(e)),
        }
    }

    async fn stamp_exif(&self, path: &Path, mtime: i64) {
        let target = path.to_path_buf();
        match tokio::task::spawn_blocking(move || exif::stamp_creation_time(&target, mtime)).await {
            Ok(Ok(StampOutcome::Stamped)) => debug!(path = %path.display(), "Stamped EXIF creation time"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Could not stamp EXIF creation time"),
            Err(e) => warn!(error = %e, "EXIF task failed"),
        }
    }

    fn transfer_error(&self, item: &WorkItem, reason: String) -> TransferError {
        TransferError {
            path: item.relative_path.clone(),
            reason,
        }
    }

    fn log_outcome(&self, item: &WorkItem, outcome: FileOutcome) {
        let name = &item.relative_path;
        let entry = match outcome {
            FileOutcome::Copied => LogEntry::success(format!("Copied {name}")),
            FileOutcome::Moved => LogEntry::success(format!("Moved {name}")),
            FileOutcome::CopiedNotRemoved(reason) => LogEntry::warning(format!(
                "Copied {name} but could not remove it from the device: {reason}"
            )),
            FileOutcome::AlreadyAtDestination => LogEntry::warning(format!(
                "Skipped {name}: a file with that name already exists at the destination"
            )),
        };
        self.log(entry);
    }

    /// Decide whether a bridge failure ends the whole job.
    async fn bridge_fatal(&self, err: &BridgeError) -> Option<JobFatal> {
        match err {
            BridgeError::Unreachable(msg) | BridgeError::Initializing(msg) => {
                Some(JobFatal::BridgeLost(msg.clone()))
            }
            BridgeError::DeviceMissing(_) => {
                Some(JobFatal::DeviceLost(self.job.device_serial.clone()))
            }
            BridgeError::Command(msg) => {
                if self.bridge.is_alive().await {
                    None
                } else {
                    Some(JobFatal::BridgeLost(msg.clone()))
                }
            }
        }
    }

    async fn write_last_updated(&self, destination: &Path) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        if let Err(e) = tokio::fs::write(destination.join("LastUpdated.txt"), stamp).await {
            self.log(LogEntry::warning(format!("Could not write LastUpdated.txt: {e}")));
        }
    }

    async fn discard_work_dir(&self) {
        if !self.job.config.remove_temp_files {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.work_dir.display(), error = %e, "Could not remove working folder");
            }
        }
    }

    fn report_progress(&self, value: f64) -> f64 {
        let value = self.job.tracker.advance(value);
        self.job.events.publish(JobEvent::Progress(value));
        value
    }

    /// Publish a user-facing log line and mirror it to tracing.
    fn log(&self, entry: LogEntry) {
        match entry.severity {
            Severity::Error => error!(message = %entry.message, "job log"),
            Severity::Warning => warn!(message = %entry.message, "job log"),
            Severity::Info | Severity::Success => info!(message = %entry.message, "job log"),
        }
        self.job.events.publish(JobEvent::Log(entry));
    }
}
