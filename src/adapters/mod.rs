use std::sync::Arc;

use crate::core::bridge::DeviceBridge;
use crate::core::supervisor::BridgeSupervisor;

mod adb;
mod simulated;

pub use adb::AdbBridge;
pub use simulated::{SimulatedBridge, SimulatedDaemon, Simulator};

/// Build the bridge for this run.
///
/// In simulation mode a stdin reader drives the simulated device so the
/// daemon can be exercised by hand.
pub fn get_bridge(simulation: bool, supervisor: Arc<BridgeSupervisor>) -> Arc<dyn DeviceBridge> {
    if simulation {
        let (bridge, controller) = SimulatedBridge::new();
        seed_demo_device(&controller);

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.as_slice() {
                    ["add", serial] => controller.add_device(serial, true),
                    ["unauth", serial] => controller.set_authorised(serial, false),
                    ["auth", serial] => controller.set_authorised(serial, true),
                    ["rm", serial] => controller.remove_device(serial),
                    ["file", serial, path] => {
                        controller.add_file(serial, path, path.as_bytes(), chrono::Utc::now().timestamp())
                    }
                    ["kill"] => controller.kill_daemon(),
                    ["init"] => controller.set_daemon(SimulatedDaemon::Initializing),
                    ["up"] => controller.set_daemon(SimulatedDaemon::Running),
                    _ => eprintln!(
                        "(Simulator) Use: add|auth|unauth|rm <serial>, file <serial> <path>, kill, init, up"
                    ),
                }
            }
        });

        return Arc::new(bridge);
    }

    Arc::new(AdbBridge::new(supervisor))
}

fn seed_demo_device(controller: &Simulator) {
    let now = chrono::Utc::now().timestamp();
    controller.add_device("SIM0001", true);
    controller.add_file("SIM0001", "/sdcard/DCIM/Camera/IMG_0001.jpg", b"simulated jpeg", now);
    controller.add_file("SIM0001", "/sdcard/DCIM/Camera/VID_0002.mp4", b"simulated mp4", now);
    controller.add_file("SIM0001", "/sdcard/Android/data/cache.jpg", b"cache", now);
    controller.add_file("SIM0001", "/sdcard/.trash/old.jpg", b"trash", now);
}
