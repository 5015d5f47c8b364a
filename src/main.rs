use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use backphotod::client::{ApiClient, BackendResponse, BackupUpdate};
use backphotod::core::UserConfig;
use backphotod::logging::{self, LogConfig};
use backphotod::{config, context, web};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// How long a running job gets to observe cancellation on shutdown.
const JOB_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long open event streams get to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const BRIDGE_HELP: &str = "\
Bridge settings live in the [bridge] table of the config file or in
BACKPHOTOD_BRIDGE__* environment variables:
  program, server_args, kill_args, ready_marker, start_timeout_secs,
  shutdown_grace_secs, auto_start
  assume_ready_after_ms   Treat a daemon that is still running as ready after
                          this many milliseconds, for builds that never print
                          the ready marker (e.g. BACKPHOTOD_BRIDGE__ASSUME_READY_AFTER_MS=2000)";

#[derive(Parser)]
#[command(name = "backphotod")]
#[command(about = "Android photo backup daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job control API and supervise the bridge daemon.
    #[command(after_help = BRIDGE_HELP)]
    Serve(ServerArgs),
    /// List devices known to a running daemon.
    Devices(ClientArgs),
    /// Back up a device through a running daemon and follow its progress.
    Backup(BackupArgs),
    /// Print the effective configuration.
    #[command(after_help = BRIDGE_HELP)]
    Config(ServerArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip)]
    #[arg(long)]
    config_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    storage_root: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[derive(Args)]
struct ClientArgs {
    /// Base URL of the daemon, e.g. http://127.0.0.1:8470
    #[arg(long)]
    server: String,
}

#[derive(Args)]
struct BackupArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Serial of the device to back up.
    #[arg(long)]
    device: String,

    /// Backup settings as JSON (destinationPath, ignoredDirs, fileTypes, ...).
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => {
            let config = config::AppConfig::new(Some(args), args.config_file.as_deref())?;
            logging::init(LogConfig::from_app(&config));
            run_server(config).await.context("Daemon failed")?
        }
        Commands::Config(args) => {
            let config = config::AppConfig::new(Some(args), args.config_file.as_deref())?;
            print!("{}", config.to_toml()?);
        }
        Commands::Devices(args) => {
            logging::init(LogConfig::default());
            run_devices(args).await?
        }
        Commands::Backup(args) => {
            logging::init(LogConfig::default());
            run_backup(args).await?
        }
    }

    Ok(())
}

async fn run_server(config: config::AppConfig) -> Result<()> {
    let ctx = context::AppContext::new(config);
    let server = Arc::new(web::WebServer::new(ctx.clone(), ctx.config.bind));
    let listener = server.bind().await.context("Failed to bind the API address")?;

    let mut serve_task = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let served = tokio::select! {
        joined = &mut serve_task => Some(joined),
        _ = shutdown_signal() => None,
    };

    let result = match served {
        Some(joined) => joined.context("API server task failed").and_then(|r| r),
        None => {
            info!("Shutting down");
            ctx.jobs.shutdown(JOB_STOP_TIMEOUT).await;
            server.shutdown();
            match tokio::time::timeout(DRAIN_TIMEOUT, serve_task).await {
                Ok(joined) => joined.context("API server task failed").and_then(|r| r),
                Err(_) => {
                    warn!("API server did not drain in time");
                    Ok(())
                }
            }
        }
    };

    ctx.supervisor.shutdown().await;
    result
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

async fn run_devices(args: &ClientArgs) -> Result<()> {
    let client = ApiClient::new(&args.server);
    client.connect_or_restart().await.into_result()?;

    let devices = client.devices().await.into_result()?;
    if devices.is_empty() {
        println!("No devices connected");
    }
    for device in devices {
        let state = if device.authorised {
            "authorised"
        } else {
            "unauthorised"
        };
        println!(
            "{}\t{}\t{}",
            device.serial,
            state,
            device.display_name.unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_backup(args: &BackupArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read {}", args.config.display()))?;
    let mut settings: UserConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid backup settings in {}", args.config.display()))?;
    settings.adb_device = Some(args.device.clone());

    let client = ApiClient::new(&args.client.server);
    client.connect_or_restart().await.into_result()?;
    let job_id = client.start_backup(&settings).await.into_result()?;
    println!("Started backup {job_id}");

    let outcome = client
        .follow(&job_id, |update: BackupUpdate| {
            if let Some(progress) = update.progress {
                println!("[{:>3.0}%]", progress * 100.0);
            }
            if let Some(log) = update.log {
                println!("{:<7} {}", format!("{:?}", log.severity).to_lowercase(), log.message);
            }
        })
        .await;

    match outcome {
        BackendResponse::Ok(()) => {
            println!("Backup complete");
            Ok(())
        }
        BackendResponse::Err { kind, detail } => bail!("Backup failed ({kind:?}): {detail}"),
    }
}
