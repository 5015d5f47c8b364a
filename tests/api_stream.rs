//! The HTTP surface driven through the bundled client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backphotod::adapters::{SimulatedBridge, SimulatedDaemon, Simulator};
use backphotod::client::{ApiClient, BackendResponse, BackupUpdate};
use backphotod::config::AppConfig;
use backphotod::context::AppContext;
use backphotod::core::{BridgeSupervisor, JobStatus, Severity, UserConfig};
use backphotod::error::ErrorKind;
use backphotod::web::WebServer;
use tempfile::TempDir;

struct TestServer {
    base: String,
    client: ApiClient,
    sim: Simulator,
    server: Arc<WebServer>,
    _temp: TempDir,
    destination: std::path::PathBuf,
}

impl TestServer {
    async fn start() -> Self {
        let temp = TempDir::new().unwrap();
        let (bridge, sim) = SimulatedBridge::new();
        let config = AppConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            simulation: true,
            temp_dir: temp.path().join("work"),
            ..AppConfig::default()
        };
        let supervisor = Arc::new(BridgeSupervisor::new(config.bridge.clone()));
        let ctx = AppContext::with_bridge(config, supervisor, Arc::new(bridge));

        let server = Arc::new(WebServer::new(ctx.clone(), ctx.config.bind));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let base = format!("http://{addr}");
        let client = ApiClient::new(base.clone());
        assert!(client.wait_until_up(Duration::from_secs(5)).await);

        Self {
            base,
            client,
            sim,
            server,
            destination: temp.path().join("out"),
            _temp: temp,
        }
    }

    fn config(&self, serial: &str) -> UserConfig {
        UserConfig {
            adb_device: Some(serial.to_string()),
            destination_path: self.destination.to_string_lossy().into_owned(),
            ignored_dirs: vec!["/sdcard/Android".to_string()],
            file_types: vec!["jpg".to_string()],
            set_exif: false,
            skip_dot: true,
            move_files: false,
            remove_temp_files: true,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

#[tokio::test]
async fn test_connect_and_list_devices() {
    let server = TestServer::start().await;
    server.sim.add_device("B-PHONE", true);
    server.sim.add_device("A-PHONE", false);

    assert_eq!(server.client.connect().await, BackendResponse::Ok(()));

    let devices = server.client.devices().await.into_result().unwrap();
    let serials: Vec<_> = devices.iter().map(|d| d.serial.as_str()).collect();
    assert_eq!(serials, vec!["A-PHONE", "B-PHONE"]);
    assert!(!devices[0].authorised);
    assert!(devices[0].display_name.is_none());
    assert!(devices[1].display_name.is_some());
}

#[tokio::test]
async fn test_bridge_down_maps_to_503_kind() {
    let server = TestServer::start().await;
    server.sim.kill_daemon();

    match server.client.connect().await {
        BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::BridgeUnreachable),
        other => panic!("expected an error, got {other:?}"),
    }
    match server.client.devices().await {
        BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::BridgeUnreachable),
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_or_restart_reports_a_bridge_that_stays_down() {
    let server = TestServer::start().await;
    assert_eq!(server.client.connect_or_restart().await, BackendResponse::Ok(()));

    server.sim.set_daemon(SimulatedDaemon::Initializing);
    match server.client.connect_or_restart().await {
        BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::BridgeInitializing),
        other => panic!("expected an error, got {other:?}"),
    }

    server.sim.kill_daemon();
    match server.client.connect_or_restart().await {
        BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::BridgeUnreachable),
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_or_restart_leaves_backend_errors_alone() {
    let client = ApiClient::new("http://127.0.0.1:9");
    match client.connect_or_restart().await {
        BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::Backend),
        other => panic!("expected a backend error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_backup_streams_updates_until_complete() {
    let server = TestServer::start().await;
    for i in 0..3 {
        server
            .sim
            .add_file("PHONE", &format!("/sdcard/DCIM/{i}.jpg"), b"jpeg", 1_600_000_000);
    }
    server.sim.set_pull_delay(Duration::from_millis(50));

    let job_id = server
        .client
        .start_backup(&server.config("PHONE"))
        .await
        .into_result()
        .unwrap();

    let mut updates: Vec<BackupUpdate> = Vec::new();
    let outcome = server
        .client
        .follow(&job_id, |update| updates.push(update))
        .await;

    assert_eq!(outcome, BackendResponse::Ok(()));
    let progress: Vec<f64> = updates.iter().filter_map(|u| u.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&1.0));
    assert!(updates.iter().any(|u| {
        u.log
            .as_ref()
            .is_some_and(|l| l.severity == Severity::Success && l.message.contains("2.jpg"))
    }));

    let snapshot = server.client.status(&job_id).await.into_result().unwrap();
    assert_eq!(snapshot.status, JobStatus::Succeeded);
    assert_eq!(snapshot.progress, 1.0);
    assert!(snapshot.finished_at.is_some());
    assert!(server.destination.join("DCIM/0.jpg").exists());
}

#[tokio::test]
async fn test_second_start_conflicts() {
    let server = TestServer::start().await;
    for i in 0..5 {
        server
            .sim
            .add_file("PHONE", &format!("/sdcard/DCIM/{i}.jpg"), b"jpeg", 1);
    }
    server.sim.set_pull_delay(Duration::from_millis(200));

    let config = server.config("PHONE");
    let job_id = server.client.start_backup(&config).await.into_result().unwrap();

    match server.client.start_backup(&config).await {
        BackendResponse::Err { kind, detail } => {
            assert_eq!(kind, ErrorKind::AlreadyRunning);
            assert_eq!(kind.status_code(), 409);
            assert_eq!(detail, "already running");
        }
        other => panic!("expected a conflict, got {other:?}"),
    }

    assert!(server.client.cancel(&job_id).await.is_ok());
    match server.client.follow(&job_id, |_| {}).await {
        BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_start_rejections() {
    let server = TestServer::start().await;
    server.sim.add_device("LOCKED", false);

    let no_device = UserConfig {
        adb_device: None,
        ..server.config("PHONE")
    };
    match server.client.start_backup(&no_device).await {
        BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::DeviceNotSelected),
        other => panic!("expected a rejection, got {other:?}"),
    }

    match server.client.start_backup(&server.config("LOCKED")).await {
        BackendResponse::Err { kind, .. } => {
            assert_eq!(kind, ErrorKind::DeviceUnauthorised);
            assert_eq!(kind.status_code(), 403);
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let server = TestServer::start().await;

    for outcome in [
        server.client.follow("no-such-job", |_| {}).await,
        server.client.cancel("no-such-job").await,
    ] {
        match outcome {
            BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("expected not found, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_complete_event_carries_a_data_line() {
    let server = TestServer::start().await;
    server.sim.add_file("PHONE", "/sdcard/DCIM/a.jpg", b"jpeg", 1);

    let job_id = server
        .client
        .start_backup(&server.config("PHONE"))
        .await
        .into_result()
        .unwrap();
    for _ in 0..200 {
        let snapshot = server.client.status(&job_id).await.into_result().unwrap();
        if snapshot.status.is_terminal() {
            assert_eq!(snapshot.status, JobStatus::Succeeded);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A finished job replays only its terminal event, then the body ends.
    let body = reqwest::get(format!("{}/backup?jobId={job_id}", server.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(
        body.contains("event: backend-complete\ndata: {}\n\n"),
        "{body:?}"
    );
}

#[tokio::test]
async fn test_missing_job_id_is_bad_request() {
    let server = TestServer::start().await;
    let response = reqwest::get(format!("{}/backup", server.base)).await.unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "bad-request");
}

#[tokio::test]
async fn test_client_reports_unreachable_backend() {
    let client = ApiClient::new("http://127.0.0.1:9");
    match client.connect().await {
        BackendResponse::Err { kind, detail } => {
            assert_eq!(kind, ErrorKind::Backend);
            assert!(detail.contains("Is the backend running?"));
        }
        other => panic!("expected a backend error, got {other:?}"),
    }
}
