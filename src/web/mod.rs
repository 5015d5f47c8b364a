//! Job control API.
//!
//! JSON request/response endpoints plus one server-sent-events stream per
//! backup job.
//!
//! ## Endpoints
//!
//! - `POST /connect` - check (and if allowed, start) the bridge daemon
//! - `GET /devices` - devices the bridge sees
//! - `POST /backup/start` - admit a backup job, returns its id
//! - `GET /backup?jobId=` - the job's event stream
//! - `POST /backup/cancel?jobId=` - cooperative cancellation
//! - `GET /backup/status?jobId=` - point-in-time job state
//! - `POST /bridge/restart` - tear down and respawn the bridge daemon
//! - `GET /health` - liveness and bridge state

mod routes;
mod stream;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::context::AppContext;

pub use routes::ApiError;
pub use stream::to_sse_event;

/// Prefix of the line printed once the API is accepting connections.
pub const READY_MARKER: &str = "BACKPHOTOD_READY";

/// Shared state for the handlers.
#[derive(Clone)]
pub struct WebState {
    pub ctx: AppContext,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/connect", post(routes::connect))
        .route("/devices", get(routes::devices))
        .route("/backup/start", post(routes::start_backup))
        .route("/backup", get(routes::backup_stream))
        .route("/backup/cancel", post(routes::cancel_backup))
        .route("/backup/status", get(routes::backup_status))
        .route("/bridge/restart", post(routes::restart_bridge))
        .route("/health", get(routes::health))
        .with_state(state)
}

pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            state: WebState { ctx },
            shutdown_tx,
        }
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        Ok(TcpListener::bind(self.bind_addr).await?)
    }

    /// Serve on `listener` until `shutdown()` is called.
    ///
    /// Prints the readiness line to stdout before accepting requests.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Job control API listening");
        println!(
            "{READY_MARKER} {}",
            serde_json::json!({ "host": addr.ip().to_string(), "port": addr.port() })
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
