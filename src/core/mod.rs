pub mod bridge;
pub mod devices;
pub mod engine;
pub mod events;
pub mod exif;
pub mod jobs;
pub mod models;
pub mod paths;
pub mod progress;
pub mod scanner;
pub mod supervisor;
pub mod transfer;

pub use bridge::{DeviceBridge, RemoteEntry};
pub use devices::DeviceRegistry;
pub use engine::{BackupEngine, EngineSettings};
pub use events::{EventBroadcaster, EventStream, JobEvent};
pub use jobs::{JobHandle, JobRegistry};
pub use models::{Device, JobSnapshot, JobStatus, LogEntry, Severity, UserConfig};
pub use progress::JobTracker;
pub use supervisor::{BridgeState, BridgeStatus, BridgeSupervisor};
