//! Polling of long-running voice-clone jobs until they settle.

use crate::casing;
use crate::error::{ApiError, ClientError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

const FAILED_FALLBACK: &str = "Voice clone creation failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Ready,
    Failed,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceCloneStatus {
    #[serde(alias = "id")]
    pub voice_clone_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub voice_name: Option<String>,
    #[serde(default)]
    pub sample_audio_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub sample_duration_seconds: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Where job status comes from. One call is one query.
pub trait StatusSource: Send + Sync + 'static {
    fn fetch(&self, id: &str) -> impl Future<Output = Result<VoiceCloneStatus>> + Send;
}

pub trait PollHandler: Send + 'static {
    fn on_status_change(&mut self, _status: &VoiceCloneStatus) {}
    fn on_ready(&mut self, _status: VoiceCloneStatus) {}
    fn on_error(&mut self, _error: ClientError) {}
}

#[derive(Debug)]
pub struct PollHandle {
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stops polling. A query already in flight is discarded when it returns.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(?err, "poll task panicked");
        }
    }
}

/// Queries `source` for job `id` every `interval` until the job is ready,
/// failed, a query fails, or the returned handle is cancelled.
pub fn poll_status<S, H>(source: Arc<S>, id: impl Into<String>, interval: Duration, handler: H) -> PollHandle
where
    S: StatusSource,
    H: PollHandler,
{
    let id = id.into();
    let active = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(run(source, id, interval, handler, active.clone()));
    PollHandle { active, task }
}

async fn run<S: StatusSource, H: PollHandler>(
    source: Arc<S>,
    id: String,
    interval: Duration,
    mut handler: H,
    active: Arc<AtomicBool>,
) {
    loop {
        if !active.load(Ordering::SeqCst) {
            return;
        }
        let result = source.fetch(&id).await;
        if !active.load(Ordering::SeqCst) {
            debug!(%id, "discarding status of cancelled poll");
            return;
        }
        let status = match result {
            Ok(status) => status,
            Err(err) => {
                active.store(false, Ordering::SeqCst);
                handler.on_error(err);
                return;
            }
        };
        handler.on_status_change(&status);
        if status.status.is_terminal() {
            active.store(false, Ordering::SeqCst);
            if status.status == JobStatus::Ready {
                handler.on_ready(status);
            } else {
                let msg = status.error_message.unwrap_or_else(|| FAILED_FALLBACK.to_string());
                handler.on_error(ClientError::Job(msg));
            }
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Reads job status from the gateway's `/api/voice-clone/status`.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    http: reqwest::Client,
    endpoint: Url,
    authorization: Option<String>,
}

impl HttpStatusSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut endpoint = Url::parse(base_url)?;
        endpoint
            .path_segments_mut()
            .map_err(|_| ClientError::Validation(format!("{base_url} cannot be a base url")))?
            .pop_if_empty()
            .extend(["api", "voice-clone", "status"]);
        Ok(Self { http: reqwest::Client::new(), endpoint, authorization: None })
    }

    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }
}

impl StatusSource for HttpStatusSource {
    async fn fetch(&self, id: &str) -> Result<VoiceCloneStatus> {
        let mut req = self.http.get(self.endpoint.clone()).query(&[("id", id)]);
        if let Some(auth) = &self.authorization {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = ApiError::from_body(&body)
                .unwrap_or_else(|| ApiError::new("HTTP_ERROR", format!("status query returned {status}")));
            return Err(ClientError::Api(err));
        }
        let value: serde_json::Value = resp.json().await?;
        serde_json::from_value(casing::to_client(value)).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}
