use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "backphotod.toml";
const ENV_PREFIX: &str = "BACKPHOTOD_";

const ASSUME_READY_HINT: &str = "\
# Treat a daemon that is still running as ready after this many milliseconds,
# for builds that never print the ready marker. Unset means wait for the marker.
# assume_ready_after_ms = 2000
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address of the job control API. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Use the in-memory bridge instead of a real daemon.
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Device directory walked by every backup.
    pub storage_root: String,
    /// Parent directory of per-run working folders.
    pub temp_dir: PathBuf,
    /// How long a finished job stays attachable.
    pub job_grace_secs: u64,
    pub bridge: BridgeConfig,
}

/// How the bridge daemon is launched and stopped.
///
/// `{port}` in any argument is replaced with the chosen listening port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub program: String,
    pub server_args: Vec<String>,
    pub kill_args: Vec<String>,
    /// Prefix of the stdout line announcing readiness and the listening port.
    pub ready_marker: String,
    pub start_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Start the daemon on demand when a client connects and none is running.
    pub auto_start: bool,
    /// Treat a still-running daemon as ready after this delay even without a
    /// marker line. For daemon builds that print nothing on start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_ready_after_ms: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            simulation: false,
            verbose: false,
            json_logs: false,
            storage_root: "/sdcard".to_string(),
            temp_dir: std::env::temp_dir().join("backphotod"),
            job_grace_secs: 30,
            bridge: BridgeConfig::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: "adb".to_string(),
            server_args: vec![
                "-P".to_string(),
                "{port}".to_string(),
                "server".to_string(),
                "nodaemon".to_string(),
            ],
            kill_args: vec![
                "-P".to_string(),
                "{port}".to_string(),
                "kill-server".to_string(),
            ],
            ready_marker: "BRIDGE_READY".to_string(),
            start_timeout_secs: 10,
            shutdown_grace_secs: 5,
            auto_start: true,
            assume_ready_after_ms: None,
        }
    }
}

impl BridgeConfig {
    /// Substitute `{port}` into an argument template.
    pub fn render_args(template: &[String], port: u16) -> Vec<String> {
        let port = port.to_string();
        template.iter().map(|a| a.replace("{port}", &port)).collect()
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `BACKPHOTOD_*` env vars and CLI flags.
    pub fn new<A: Serialize>(cli_args: Option<&A>, config_file: Option<&Path>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", file.display()))
    }

    /// Effective configuration as TOML, for `backphotod config`.
    /// Unset optional knobs are rendered as comments so the output lists
    /// every setting. `[bridge]` is the last table, so they land inside it.
    pub fn to_toml(&self) -> Result<String> {
        let mut rendered = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if self.bridge.assume_ready_after_ms.is_none() {
            rendered.push_str(ASSUME_READY_HINT);
        }
        Ok(rendered)
    }
}
