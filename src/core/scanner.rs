//! Remote filesystem walk that produces a job's work list.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bridge::DeviceBridge;
use super::models::UserConfig;
use super::paths;
use crate::error::BridgeError;

/// Include/exclude rules resolved from a config snapshot.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    ignored_dirs: Vec<String>,
    file_types: Vec<String>,
    skip_dot: bool,
}

impl ScanPolicy {
    pub fn new(config: &UserConfig) -> Self {
        Self {
            ignored_dirs: config.normalized_ignored_dirs(),
            file_types: config.normalized_file_types(),
            skip_dot: config.skip_dot,
        }
    }

    /// Whether a directory's whole subtree is skipped.
    pub fn prunes_dir(&self, path: &str) -> bool {
        paths::is_ignored(path, &self.ignored_dirs)
            || (self.skip_dot && paths::file_name(path).starts_with('.'))
    }

    /// Whether a file at `path` (with `relative` its path under the scan root)
    /// belongs in the work list.
    pub fn includes_file(&self, path: &str, relative: &str) -> bool {
        if paths::is_ignored(path, &self.ignored_dirs) {
            return false;
        }
        if self.skip_dot && paths::has_dot_component(relative) {
            return false;
        }
        paths::matches_file_type(path, &self.file_types)
    }
}

/// One file to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Absolute device path.
    pub remote_path: String,
    /// Path under the scan root, `/`-separated, preserved at the destination.
    pub relative_path: String,
}

/// Progress notices raised while walking.
#[derive(Debug)]
pub enum ScanNotice<'a> {
    Entering(&'a str),
    /// A subdirectory could not be listed and was left out.
    Unreadable { dir: &'a str, error: &'a BridgeError },
}

/// Walk `root` depth-first and collect every file the policy admits.
///
/// Returns `Ok(None)` when cancelled. Files come in listing order, with a
/// directory's own files ahead of its subdirectories. A subdirectory that
/// cannot be listed is reported and skipped; failing to list the root, or
/// losing the bridge or the device, is an error.
pub async fn scan(
    bridge: &dyn DeviceBridge,
    serial: &str,
    root: &str,
    policy: &ScanPolicy,
    cancel: &CancellationToken,
    mut notify: impl FnMut(ScanNotice<'_>),
) -> Result<Option<Vec<WorkItem>>, BridgeError> {
    let root = paths::to_posix(root);
    let mut work = Vec::new();

    if policy.prunes_dir(&root) {
        return Ok(Some(work));
    }

    let mut pending = vec![root.clone()];

    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        notify(ScanNotice::Entering(&dir));

        let entries = match bridge.list_dir(serial, &dir).await {
            Ok(entries) => entries,
            Err(BridgeError::Command(msg)) if dir != root => {
                let error = BridgeError::Command(msg);
                notify(ScanNotice::Unreadable { dir: &dir, error: &error });
                continue;
            }
            Err(e) => return Err(e),
        };

        let mut subdirs = Vec::new();
        for entry in entries {
            let path = paths::to_posix(&entry.path);
            let Some(relative) = paths::relative_to(&path, &root) else {
                debug!(path = %path, "Ignoring entry outside the scan root");
                continue;
            };
            if relative.is_empty() {
                continue;
            }

            if entry.is_dir {
                if !policy.prunes_dir(&path) {
                    subdirs.push(path);
                }
            } else if policy.includes_file(&path, relative) {
                let relative_path = relative.to_string();
                work.push(WorkItem {
                    remote_path: path,
                    relative_path,
                });
            }
        }

        pending.extend(subdirs.into_iter().rev());
    }

    Ok(Some(work))
}
