//! In-memory state of a single job.
//!
//! Written only by the job's own task, read by the status endpoint. Nothing
//! here is persisted.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use super::models::{JobSnapshot, JobStatus};

#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<RwLock<JobSnapshot>>,
}

impl JobTracker {
    pub fn new(job_id: &str, device_serial: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(JobSnapshot {
                job_id: job_id.to_string(),
                device_serial: device_serial.to_string(),
                status: JobStatus::Pending,
                progress: 0.0,
                started_at: Utc::now(),
                finished_at: None,
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, JobSnapshot> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobSnapshot> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.read().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.read().status
    }

    pub fn progress(&self) -> f64 {
        self.read().progress
    }

    /// Move to a new status. Terminal statuses stamp `finished_at` and are final.
    pub fn set_status(&self, status: JobStatus) {
        let mut snapshot = self.write();
        if snapshot.status.is_terminal() {
            return;
        }
        snapshot.status = status;
        if status.is_terminal() {
            snapshot.finished_at = Some(Utc::now());
        }
    }

    /// Raise progress to `value` (clamped to [0, 1]); never lowers it.
    ///
    /// Returns the progress now in effect.
    pub fn advance(&self, value: f64) -> f64 {
        let mut snapshot = self.write();
        let value = if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if value > snapshot.progress {
            snapshot.progress = value;
        }
        snapshot.progress
    }
}

/// `completed / total`, with an empty work list counting as done.
pub fn fraction(completed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    }
}
