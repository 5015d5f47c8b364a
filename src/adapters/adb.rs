//! Bridge implementation backed by the `adb` command-line client.
//!
//! Every call is a short-lived `adb -P <port> ...` process pointed at the
//! daemon owned by the [`BridgeSupervisor`].

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::core::bridge::{DeviceBridge, RemoteEntry};
use crate::core::models::Device;
use crate::core::paths;
use crate::core::supervisor::BridgeSupervisor;
use crate::error::BridgeError;

/// `SERIAL  state  key:value ...` lines of `adb devices -l`.
static DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<serial>\S+)\s+(?P<state>[a-z]+)(?:\s+(?P<props>.*))?$")
        .expect("device line regex is valid")
});

pub struct AdbBridge {
    supervisor: Arc<BridgeSupervisor>,
    program: String,
}

impl AdbBridge {
    pub fn new(supervisor: Arc<BridgeSupervisor>) -> Self {
        let program = supervisor.config().program.clone();
        Self {
            supervisor,
            program,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        let port = self.supervisor.endpoint()?;

        let output = Command::new(&self.program)
            .arg("-P")
            .arg(port.to_string())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BridgeError::Unreachable(format!("failed to run {}: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(err) = classify_failure(&stdout, &stderr) {
            return Err(err);
        }

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(BridgeError::Command(detail.to_string()));
        }

        Ok(stdout)
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String, BridgeError> {
        self.run(&["-s", serial, "shell", command]).await
    }

    async fn friendly_name(&self, serial: &str) -> Option<String> {
        let manufacturer = self
            .shell(serial, "getprop ro.product.manufacturer")
            .await
            .ok()?;
        let model = self.shell(serial, "getprop ro.product.model").await.ok()?;
        let name = format!("{} {}", title_case(manufacturer.trim()), model.trim());
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn probe(&self) -> Result<(), BridgeError> {
        self.supervisor.connect().await?;
        self.run(&["devices"]).await.map(|_| ())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, BridgeError> {
        let output = self.run(&["devices", "-l"]).await?;
        let mut devices = Vec::new();

        for listed in parse_devices(&output) {
            let display_name = if listed.authorised {
                match self.friendly_name(&listed.serial).await {
                    Some(name) => Some(name),
                    None => listed.model.clone(),
                }
            } else {
                None
            };

            devices.push(Device {
                serial: listed.serial,
                authorised: listed.authorised,
                display_name,
            });
        }

        devices.sort_by(|a, b| a.serial.cmp(&b.serial));
        Ok(devices)
    }

    async fn list_dir(&self, serial: &str, dir: &str) -> Result<Vec<RemoteEntry>, BridgeError> {
        let output = self
            .shell(serial, &format!("ls -1ap {}", shell_quote(dir)))
            .await?;
        Ok(parse_listing(dir, &output))
    }

    async fn modified_time(&self, serial: &str, path: &str) -> Result<i64, BridgeError> {
        let output = self
            .shell(serial, &format!("stat -c %Y {}", shell_quote(path)))
            .await?;
        output
            .trim()
            .parse()
            .map_err(|_| BridgeError::Command(format!("unexpected stat output: {}", output.trim())))
    }

    async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<(), BridgeError> {
        let local = local.to_string_lossy();
        debug!(serial, remote, local = %local, "adb pull");
        self.run(&["-s", serial, "pull", "-a", remote, local.as_ref()])
            .await
            .map(|_| ())
    }

    async fn remove(&self, serial: &str, path: &str) -> Result<(), BridgeError> {
        self.shell(serial, &format!("rm -f {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    async fn is_alive(&self) -> bool {
        self.probe().await.is_ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ListedDevice {
    serial: String,
    authorised: bool,
    model: Option<String>,
}

fn parse_devices(output: &str) -> Vec<ListedDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*')
        })
        .filter_map(|line| DEVICE_LINE.captures(line))
        .map(|caps| {
            let model = caps.name("props").and_then(|props| {
                props
                    .as_str()
                    .split_whitespace()
                    .find_map(|kv| kv.strip_prefix("model:"))
                    .map(|m| m.replace('_', " "))
            });
            ListedDevice {
                serial: caps["serial"].to_string(),
                authorised: caps["state"].trim() == "device",
                model,
            }
        })
        .collect()
}

fn parse_listing(dir: &str, output: &str) -> Vec<RemoteEntry> {
    output
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .filter(|line| !matches!(*line, "." | ".." | "./" | "../"))
        .map(|line| match line.strip_suffix('/') {
            Some(name) => RemoteEntry {
                path: paths::join(dir, name),
                is_dir: true,
            },
            None => RemoteEntry {
                path: paths::join(dir, line),
                is_dir: false,
            },
        })
        .collect()
}

/// Map well-known adb client messages onto the bridge error taxonomy.
///
/// Only stderr and the status lines adb itself prints on stdout are looked
/// at; the rest of stdout is device data such as file names.
fn classify_failure(stdout: &str, stderr: &str) -> Option<BridgeError> {
    let own_stdout = stdout.lines().filter(|line| {
        let line = line.trim_start();
        line.starts_with("* ") || line.starts_with("error:") || line.starts_with("adb: error:")
    });
    let lines: Vec<&str> = stderr
        .lines()
        .chain(own_stdout)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if let Some(line) = find_line(&lines, |l| {
        l.contains("daemon not running") || l.contains("daemon still not running")
    }) {
        return Some(BridgeError::Initializing(line));
    }
    if let Some(line) = find_line(&lines, |l| {
        l.contains("cannot connect to daemon")
            || l.contains("failed to check server version")
            || l.contains("Connection refused")
    }) {
        return Some(BridgeError::Unreachable(line));
    }
    if let Some(line) = find_line(&lines, |l| {
        l.contains("error: device") && (l.contains("not found") || l.contains("offline"))
            || l.contains("no devices/emulators found")
            || l.contains("device unauthorized")
    }) {
        return Some(BridgeError::DeviceMissing(line));
    }
    None
}

fn find_line(lines: &[&str], matches: impl Fn(&str) -> bool) -> Option<String> {
    lines.iter().find(|line| matches(line)).map(|line| line.to_string())
}

/// Single-quote a path for the device shell.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let output = "List of devices attached\n\
            R58M123ABC             device usb:1-1 product:beyond1ltexx model:SM_G973F device:beyond1 transport_id:1\n\
            emulator-5554\tunauthorized usb:1-2 transport_id:2\n\
            0123456789\toffline\n\n";

        let devices = parse_devices(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].serial, "R58M123ABC");
        assert!(devices[0].authorised);
        assert_eq!(devices[0].model.as_deref(), Some("SM G973F"));
        assert_eq!(devices[1].serial, "emulator-5554");
        assert!(!devices[1].authorised);
        assert!(!devices[2].authorised);
        assert_eq!(devices[2].model, None);
    }

    #[test]
    fn test_parse_devices_skips_daemon_chatter() {
        let output = "* daemon started successfully\nList of devices attached\n";
        assert!(parse_devices(output).is_empty());
    }

    #[test]
    fn test_parse_listing() {
        let output = "./\n../\nDCIM/\n.thumbnails/\nnotes.txt\nIMG 1.jpg\r\n";
        let entries = parse_listing("/sdcard", output);
        assert_eq!(
            entries,
            vec![
                RemoteEntry { path: "/sdcard/DCIM".into(), is_dir: true },
                RemoteEntry { path: "/sdcard/.thumbnails".into(), is_dir: true },
                RemoteEntry { path: "/sdcard/notes.txt".into(), is_dir: false },
                RemoteEntry { path: "/sdcard/IMG 1.jpg".into(), is_dir: false },
            ]
        );
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("", "* daemon not running; starting now at tcp:5037"),
            Some(BridgeError::Initializing(_))
        ));
        assert!(matches!(
            classify_failure("", "cannot connect to daemon at tcp:5037: Connection refused"),
            Some(BridgeError::Unreachable(_))
        ));
        assert!(matches!(
            classify_failure("", "error: device 'R58' not found"),
            Some(BridgeError::DeviceMissing(_))
        ));
        assert_eq!(classify_failure("1700000000\n", ""), None);
    }

    #[test]
    fn test_file_names_in_listing_are_not_errors() {
        let listing = "DCIM/\nConnection refused.jpg\ndaemon not running.png\ndevice unauthorized.mp4\n";
        assert_eq!(classify_failure(listing, ""), None);

        let entries = parse_listing("/sdcard", listing);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].path, "/sdcard/Connection refused.jpg");
        assert!(!entries[1].is_dir);
    }

    #[test]
    fn test_adb_status_lines_on_stdout_are_classified() {
        assert_eq!(
            classify_failure("* daemon not running; starting now at tcp:5037\n", ""),
            Some(BridgeError::Initializing(
                "* daemon not running; starting now at tcp:5037".to_string()
            ))
        );
        assert_eq!(
            classify_failure("a.jpg\n", "adb: error: cannot connect to daemon"),
            Some(BridgeError::Unreachable(
                "adb: error: cannot connect to daemon".to_string()
            ))
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/sdcard/it's.jpg"), r"'/sdcard/it'\''s.jpg'");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("SAMSUNG"), "Samsung");
        assert_eq!(title_case("google"), "Google");
    }
}
