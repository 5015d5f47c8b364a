//! Client for the job control API.
//!
//! Every call resolves to a [`BackendResponse`], never a transport error:
//! an unreachable daemon is `Err { kind: Backend }` and an event stream that
//! ends without a terminal event is `Err { kind: Unknown }`.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::core::{Device, JobSnapshot, LogEntry, UserConfig};
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendResponse<T> {
    Ok(T),
    Err { kind: ErrorKind, detail: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{detail} ({kind:?})")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl<T> BackendResponse<T> {
    pub fn err(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Err {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BackendResponse<U> {
        match self {
            Self::Ok(value) => BackendResponse::Ok(f(value)),
            Self::Err { kind, detail } => BackendResponse::Err { kind, detail },
        }
    }

    pub fn into_result(self) -> Result<T, ClientError> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err { kind, detail } => Err(ClientError { kind, detail }),
        }
    }
}

/// Payload of a `message` event. Either field may be absent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackupUpdate {
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub log: Option<LogEntry>,
}

#[derive(Deserialize)]
struct StreamError {
    status: u16,
    detail: String,
    #[serde(default)]
    kind: Option<ErrorKind>,
}

#[derive(Deserialize)]
struct DevicesBody {
    devices: Vec<Device>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    job_id: String,
}

pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn connect(&self) -> BackendResponse<()> {
        self.send::<Value>(self.http.post(self.url("/connect")), "Error connecting to ADB")
            .await
            .map(|_| ())
    }

    /// Connect, restarting the bridge once if the failure is one a restart
    /// can clear.
    pub async fn connect_or_restart(&self) -> BackendResponse<()> {
        let kind = match self.connect().await {
            BackendResponse::Err { kind, .. } if kind.is_bridge_recoverable() => kind,
            outcome => return outcome,
        };
        debug!(?kind, "Bridge not usable, restarting it");
        if let err @ BackendResponse::Err { .. } = self.restart_bridge().await {
            return err;
        }
        self.connect().await
    }

    pub async fn devices(&self) -> BackendResponse<Vec<Device>> {
        self.send::<DevicesBody>(self.http.get(self.url("/devices")), "Error listing devices")
            .await
            .map(|body| body.devices)
    }

    /// Admit a backup. Returns the job id.
    pub async fn start_backup(&self, config: &UserConfig) -> BackendResponse<String> {
        let request = self
            .http
            .post(self.url("/backup/start"))
            .json(&json!({ "config": config }));
        self.send::<StartBody>(request, "Error starting backup")
            .await
            .map(|body| body.job_id)
    }

    pub async fn restart_bridge(&self) -> BackendResponse<()> {
        self.send::<Value>(self.http.post(self.url("/bridge/restart")), "Error restarting ADB")
            .await
            .map(|_| ())
    }

    pub async fn cancel(&self, job_id: &str) -> BackendResponse<()> {
        let request = self
            .http
            .post(self.url("/backup/cancel"))
            .query(&[("jobId", job_id)]);
        self.send::<Value>(request, "Error cancelling backup")
            .await
            .map(|_| ())
    }

    pub async fn status(&self, job_id: &str) -> BackendResponse<JobSnapshot> {
        let request = self
            .http
            .get(self.url("/backup/status"))
            .query(&[("jobId", job_id)]);
        self.send(request, "Error reading backup status").await
    }

    /// Consume a job's event stream until its terminal event.
    ///
    /// `on_update` sees every well-formed `message` payload in order; malformed
    /// ones are dropped.
    pub async fn follow(
        &self,
        job_id: &str,
        mut on_update: impl FnMut(BackupUpdate),
    ) -> BackendResponse<()> {
        let request = self
            .http
            .get(self.url("/backup"))
            .query(&[("jobId", job_id)])
            .header(ACCEPT, "text/event-stream");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return unreachable_backend(e, "Unknown error trying backup"),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            return error_from_body(status, &body, "Error attaching to backup");
        }

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(error = %e, "Event stream read failed");
                    break;
                }
            };

            for message in decoder.feed(&chunk) {
                match message.event.as_str() {
                    "message" => match serde_json::from_str::<BackupUpdate>(&message.data) {
                        Ok(update) => on_update(update),
                        Err(e) => debug!(error = %e, data = %message.data, "Dropping malformed update"),
                    },
                    "backend-error" => return stream_error(&message.data),
                    "backend-complete" => return BackendResponse::Ok(()),
                    other => debug!(event = other, "Ignoring unknown event"),
                }
            }
        }

        BackendResponse::err(
            ErrorKind::Unknown,
            "Unknown error trying backup - the event stream closed before the backup finished",
        )
    }

    /// Poll `/health` until it answers or `timeout` elapses.
    pub async fn wait_until_up(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(response) = self.http.get(self.url("/health")).send().await {
                if response.status().is_success() {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        fallback: &str,
    ) -> BackendResponse<T> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return unreachable_backend(e, fallback),
        };

        let status = response.status();
        // Bodies that are not JSON read as empty.
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return error_from_body(status.as_u16(), &body, fallback);
        }

        match serde_json::from_value(body) {
            Ok(value) => BackendResponse::Ok(value),
            Err(e) => BackendResponse::err(ErrorKind::Internal, format!("{fallback}: {e}")),
        }
    }
}

fn unreachable_backend<T>(err: reqwest::Error, fallback: &str) -> BackendResponse<T> {
    debug!(error = %err, "Request to backend failed");
    BackendResponse::err(
        ErrorKind::Backend,
        format!("{fallback} - Is the backend running?"),
    )
}

fn error_from_body<T>(status: u16, body: &Value, fallback: &str) -> BackendResponse<T> {
    let kind = body
        .get("kind")
        .and_then(|k| serde_json::from_value(k.clone()).ok())
        .unwrap_or_else(|| ErrorKind::from_status(status));
    let detail = body
        .get("detail")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string();
    BackendResponse::Err { kind, detail }
}

fn stream_error(data: &str) -> BackendResponse<()> {
    match serde_json::from_str::<StreamError>(data) {
        Ok(err) => BackendResponse::Err {
            kind: err.kind.unwrap_or_else(|| ErrorKind::from_status(err.status)),
            detail: err.detail,
        },
        Err(_) => BackendResponse::err(ErrorKind::Internal, data),
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split lines anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseMessage> {
        self.pending.extend_from_slice(bytes);
        let mut messages = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            if let Some(message) = self.line(line.trim_end_matches('\r')) {
                messages.push(message);
            }
        }

        messages
    }

    fn line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseMessage {
                event: event.unwrap_or_else(|| "message".to_string()),
                data,
            });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"event: mess").is_empty());
        assert!(decoder.feed(b"age\ndata: {\"progr").is_empty());
        let messages = decoder.feed(b"ess\":0.5}\n\n");
        assert_eq!(
            messages,
            vec![SseMessage {
                event: "message".into(),
                data: r#"{"progress":0.5}"#.into()
            }]
        );
    }

    #[test]
    fn test_decoder_defaults_and_comments() {
        let mut decoder = SseDecoder::default();
        let messages = decoder.feed(b": keep-alive\n\ndata: a\r\ndata: b\r\n\r\nevent: backend-complete\ndata: \n\n");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].event, "message");
        assert_eq!(messages[0].data, "a\nb");
        assert_eq!(messages[1].event, "backend-complete");
        assert_eq!(messages[1].data, "");
    }

    #[test]
    fn test_stream_error_kind_fallbacks() {
        assert_eq!(
            stream_error(r#"{"status":503,"detail":"gone"}"#),
            BackendResponse::err(ErrorKind::BridgeUnreachable, "gone")
        );
        assert_eq!(
            stream_error(r#"{"status":500,"detail":"x","kind":"partial-failure"}"#),
            BackendResponse::err(ErrorKind::PartialFailure, "x")
        );
        assert_eq!(
            stream_error("not json"),
            BackendResponse::err(ErrorKind::Internal, "not json")
        );
    }

    #[test]
    fn test_update_payload_shapes() {
        let update: BackupUpdate = serde_json::from_str(r#"{"progress":0.25}"#).unwrap();
        assert_eq!(update.progress, Some(0.25));
        assert!(update.log.is_none());

        let update: BackupUpdate = serde_json::from_str(
            r#"{"log":{"timestamp":1.5,"type":"success","content":"Copied a.jpg"}}"#,
        )
        .unwrap();
        assert_eq!(update.log.unwrap().message, "Copied a.jpg");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_backend_kind() {
        let port = crate::core::supervisor::find_free_port().unwrap();
        let client = ApiClient::new(format!("http://127.0.0.1:{port}"));
        match client.devices().await {
            BackendResponse::Err { kind, .. } => assert_eq!(kind, ErrorKind::Backend),
            other => panic!("unexpected {other:?}"),
        }
    }
}
