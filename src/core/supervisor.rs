//! Lifecycle of the device-bridge daemon process.
//!
//! The supervisor owns at most one daemon child. Starting is serialized through
//! a mutex so concurrent callers observe a single spawn; state reads go through
//! a watch channel so they never wait on a start in progress.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, SpawnError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeState {
    NotStarted,
    Starting,
    Running,
    Failed,
}

/// Observable part of the connection, readable without taking the start lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub port: Option<u16>,
}

/// The live daemon. Replaced wholesale on every (re)start.
struct BridgeConnection {
    child: Option<Child>,
    port: Option<u16>,
}

impl BridgeConnection {
    fn empty() -> Self {
        Self {
            child: None,
            port: None,
        }
    }
}

enum Readiness {
    Marker(u16),
    Assumed,
}

pub struct BridgeSupervisor {
    config: BridgeConfig,
    conn: Mutex<BridgeConnection>,
    status_tx: watch::Sender<BridgeStatus>,
    shut_down: AtomicBool,
}

impl BridgeSupervisor {
    pub fn new(config: BridgeConfig) -> Self {
        let (status_tx, _) = watch::channel(BridgeStatus {
            state: BridgeState::NotStarted,
            port: None,
        });

        Self {
            config,
            conn: Mutex::new(BridgeConnection::empty()),
            status_tx,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> BridgeStatus {
        *self.status_tx.borrow()
    }

    pub fn state(&self) -> BridgeState {
        self.status().state
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Port of the running daemon, or the reason there is none.
    pub fn endpoint(&self) -> Result<u16, BridgeError> {
        let status = self.status();
        match (status.state, status.port) {
            (BridgeState::Running, Some(port)) => Ok(port),
            (BridgeState::Starting, _) => Err(BridgeError::Initializing(
                "bridge daemon is starting".to_string(),
            )),
            (BridgeState::Failed, _) => Err(BridgeError::Unreachable(
                "bridge daemon failed".to_string(),
            )),
            _ => Err(BridgeError::Unreachable(
                "bridge daemon is not running".to_string(),
            )),
        }
    }

    /// Check the daemon process is up on its known port.
    pub async fn connect(&self) -> Result<u16, BridgeError> {
        let port = self.endpoint()?;

        // A start or restart holds the lock; report it as initializing.
        let Ok(mut conn) = self.conn.try_lock() else {
            return Err(BridgeError::Initializing(
                "bridge daemon is restarting".to_string(),
            ));
        };

        let exited = match conn.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(format!("bridge daemon exited ({status})")),
                Err(e) => Some(format!("bridge daemon state unknown: {e}")),
            },
            None => Some("bridge daemon is not running".to_string()),
        };

        if let Some(reason) = exited {
            warn!(reason = %reason, "Bridge daemon is gone");
            *conn = BridgeConnection::empty();
            self.set_status(BridgeState::Failed, None);
            return Err(BridgeError::Unreachable(reason));
        }

        Ok(port)
    }

    /// Launch the daemon unless it is already running. Returns its port.
    pub async fn ensure_started(&self) -> Result<u16, SpawnError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SpawnError::ShutDown);
        }

        let mut conn = self.conn.lock().await;

        let port = conn.port;
        if let (Some(child), Some(port)) = (conn.child.as_mut(), port) {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(port);
            }
            debug!("Previous bridge daemon has exited, starting a new one");
        }

        self.start_locked(&mut conn).await
    }

    /// Stop any running daemon, then start a fresh one.
    pub async fn restart(&self) -> Result<u16, SpawnError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SpawnError::ShutDown);
        }

        let mut conn = self.conn.lock().await;
        info!("Restarting bridge daemon");
        self.terminate(&mut conn).await;
        self.set_status(BridgeState::NotStarted, None);
        self.start_locked(&mut conn).await
    }

    /// Stop the daemon for good. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut conn = self.conn.lock().await;
        self.terminate(&mut conn).await;
        self.set_status(BridgeState::NotStarted, None);
        info!("Bridge supervisor shut down");
    }

    async fn start_locked(&self, conn: &mut BridgeConnection) -> Result<u16, SpawnError> {
        *conn = BridgeConnection::empty();
        self.set_status(BridgeState::Starting, None);

        let result = match find_free_port() {
            Ok(port) => self.spawn_and_wait(port).await,
            Err(e) => Err(SpawnError::Io(e)),
        };

        match result {
            Ok((child, port)) => {
                info!(port, pid = child.id(), "Bridge daemon running");
                *conn = BridgeConnection {
                    child: Some(child),
                    port: Some(port),
                };
                self.set_status(BridgeState::Running, Some(port));
                Ok(port)
            }
            Err(e) => {
                warn!(error = %e, "Bridge daemon failed to start");
                self.set_status(BridgeState::Failed, None);
                Err(e)
            }
        }
    }

    async fn spawn_and_wait(&self, port: u16) -> Result<(Child, u16), SpawnError> {
        let args = BridgeConfig::render_args(&self.config.server_args, port);
        debug!(program = %self.config.program, ?args, "Spawning bridge daemon");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SpawnError::Io(std::io::Error::other("bridge daemon stdout unavailable"))
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let limit = Duration::from_secs(self.config.start_timeout_secs);
        let assume_after = self.config.assume_ready_after_ms.map(Duration::from_millis);
        let marker = self.config.ready_marker.as_str();

        let outcome = timeout(limit, async {
            tokio::select! {
                res = read_until_ready(&mut lines, marker) => res.map(|p| p.map(Readiness::Marker)),
                _ = wait_optional(assume_after) => Ok(Some(Readiness::Assumed)),
            }
        })
        .await;

        match outcome {
            Ok(Ok(Some(readiness))) => {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(SpawnError::ExitedEarly {
                        code: status.code(),
                    });
                }
                let port = match readiness {
                    Readiness::Marker(announced) => announced,
                    Readiness::Assumed => port,
                };
                tokio::spawn(drain_output(lines));
                Ok((child, port))
            }
            Ok(Ok(None)) => {
                let code = child.wait().await.ok().and_then(|s| s.code());
                Err(SpawnError::ExitedEarly { code })
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(SpawnError::Io(e))
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(SpawnError::ReadyTimeout {
                    timeout_secs: self.config.start_timeout_secs,
                })
            }
        }
    }

    /// Graceful directive, then SIGTERM, then SIGKILL, each with a bounded wait.
    async fn terminate(&self, conn: &mut BridgeConnection) {
        let port = conn.port;
        let Some(mut child) = conn.child.take() else {
            return;
        };
        *conn = BridgeConnection::empty();

        if let Ok(Some(_)) = child.try_wait() {
            debug!("Bridge daemon already exited");
            return;
        }

        let step = Duration::from_secs(self.config.shutdown_grace_secs.max(1)) / 2;

        if let (Some(port), false) = (port, self.config.kill_args.is_empty()) {
            let args = BridgeConfig::render_args(&self.config.kill_args, port);
            let directive = Command::new(&self.config.program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();
            match timeout(step, directive).await {
                Ok(Ok(status)) => debug!(%status, "Sent kill-server directive"),
                Ok(Err(e)) => debug!(error = %e, "kill-server directive failed"),
                Err(_) => debug!("kill-server directive timed out"),
            }

            if timeout(step, child.wait()).await.is_ok() {
                info!("Bridge daemon stopped gracefully");
                return;
            }
        }

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(error = %e, pid, "SIGTERM failed");
            }
            if timeout(step, child.wait()).await.is_ok() {
                info!(pid, "Bridge daemon terminated");
                return;
            }
        }

        warn!("Bridge daemon did not exit in time, killing it");
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill bridge daemon");
        }
    }

    fn set_status(&self, state: BridgeState, port: Option<u16>) {
        self.status_tx.send_replace(BridgeStatus { state, port });
    }
}

/// Parse the readiness line: `<marker> {"port": N}` or `<marker> N`.
///
/// Any other line yields `None`.
pub fn parse_ready_line(line: &str, marker: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix(marker)?;
    let payload = rest.trim();
    if payload.is_empty() || !(rest.starts_with(char::is_whitespace)) {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if let Some(port) = value.get("port").and_then(|p| p.as_u64()) {
            return u16::try_from(port).ok();
        }
    }

    payload.parse().ok()
}

async fn read_until_ready(
    lines: &mut Lines<BufReader<ChildStdout>>,
    marker: &str,
) -> std::io::Result<Option<u16>> {
    while let Some(line) = lines.next_line().await? {
        if let Some(port) = parse_ready_line(&line, marker) {
            return Ok(Some(port));
        }
        debug!(line = %line, "bridge");
    }
    Ok(None)
}

async fn wait_optional(delay: Option<Duration>) {
    match delay {
        Some(d) => sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Keep reading daemon output so it never blocks on a full pipe.
async fn drain_output(mut lines: Lines<BufReader<ChildStdout>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line = %line, "bridge");
    }
}

/// Ask the OS for a free localhost port.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
