//! `POST /api/analyze`: runs the speech-coach workflow for one recording and
//! relays its events to the caller as an SSE stream.
//!
//! A single producer task owns the only sender of the response channel. It
//! writes an initial `start` frame, maps every workflow event to a frame, and
//! always finishes with exactly one terminal frame (`complete` or `error`).
//! Dropping the sender ends the response body.

use crate::sse::{Complete, Progress, StreamEvent};
use crate::utils::ApiError;
use crate::workflow::{AnalysisMode, EventKind, WorkflowEvent, WorkflowParams, WorkflowSource};
use crate::AppState;
use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const FALLBACK_STEP: &str = "processing";
const FALLBACK_PROGRESS: u8 = 50;
const FALLBACK_MESSAGE: &str = "Processing...";

fn default_voice_type() -> String {
    "default_male".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default = "default_voice_type")]
    pub voice_type: String,
    #[serde(default)]
    pub question: Option<String>,
}

impl AnalyzeRequest {
    fn into_params(self, session_id: &str) -> Result<WorkflowParams, ApiError> {
        let audio_url = match self.audio_url {
            Some(url) if !url.trim().is_empty() => url,
            _ => return Err(ApiError::invalid_request("audioUrl is required")),
        };
        Ok(WorkflowParams {
            session_id: session_id.to_string(),
            audio_url,
            mode: self.mode,
            voice_type: self.voice_type,
            question: self.question.filter(|q| !q.is_empty()),
            project_id: self.project_id.filter(|p| !p.is_empty()),
        })
    }
}

/// Maps one workflow event to the frame sent for it.
fn frame_for(event: WorkflowEvent, session_id: &str) -> StreamEvent {
    let state = event.state;
    match event.kind {
        EventKind::Progress => {
            let latest = state.latest_message();
            let progress = latest
                .and_then(|m| m.progress)
                .map(|p| p.clamp(0.0, 100.0).round() as u8)
                .unwrap_or(FALLBACK_PROGRESS);
            StreamEvent::Progress(Progress {
                step: latest.and_then(|m| m.step.clone()).unwrap_or_else(|| FALLBACK_STEP.into()),
                progress,
                message: latest
                    .and_then(|m| m.message.clone())
                    .unwrap_or_else(|| FALLBACK_MESSAGE.into()),
                session_id: session_id.to_string(),
            })
        }
        EventKind::Complete => match state.analysis_result {
            Some(analysis_result) => StreamEvent::Complete(Complete {
                session_id: session_id.to_string(),
                transcript: state.transcript,
                analysis_result: Some(analysis_result),
                improved_script: state.improved_script,
                improved_audio_url: state.improved_audio_url,
            }),
            None => StreamEvent::error("STREAM_ERROR", "workflow ended without a result", session_id),
        },
        EventKind::Error => {
            let (code, message) = match state.error {
                Some(e) => (e.code, e.message),
                None => (None, None),
            };
            StreamEvent::error(
                code.unwrap_or_else(|| "UNKNOWN_ERROR".into()),
                message.unwrap_or_else(|| "An unknown error occurred".into()),
                session_id,
            )
        }
    }
}

/// Writes frames for one session and refuses anything after the terminal one.
struct SessionWriter {
    session_id: String,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    finished: bool,
    disconnected: bool,
}

impl SessionWriter {
    fn new(session_id: String, tx: mpsc::Sender<Result<Bytes, std::io::Error>>) -> Self {
        Self { session_id, tx, finished: false, disconnected: false }
    }

    async fn send(&mut self, event: StreamEvent) -> Result<()> {
        if self.finished {
            tracing::debug!(event = event.name(), "dropping frame after terminal event");
            return Ok(());
        }
        let frame = event.encode()?;
        if event.is_terminal() {
            self.finished = true;
            let code = match &event {
                StreamEvent::Error(f) => f.code.as_str(),
                _ => "",
            };
            crate::metrics::analyze::TERMINAL_FRAMES.with_label_values(&[event.name(), code]).inc();
        }
        if self.tx.send(Ok(frame)).await.is_err() {
            self.disconnected = true;
            anyhow::bail!("client disconnected")
        }
        Ok(())
    }

    /// Best-effort terminal error, used on the fault paths.
    async fn fail(&mut self, code: &str, message: String) {
        if self.finished || self.disconnected {
            return;
        }
        let event = StreamEvent::error(code, message, &self.session_id);
        if let Err(err) = self.send(event).await {
            tracing::debug!(?err, "could not deliver terminal error");
        }
    }
}

async fn pump(
    workflow: &dyn WorkflowSource,
    params: WorkflowParams,
    writer: &mut SessionWriter,
) -> Result<()> {
    let session_id = writer.session_id.clone();
    writer
        .send(StreamEvent::Progress(Progress {
            step: "start".to_string(),
            progress: 0,
            message: "Starting analysis...".to_string(),
            session_id: session_id.clone(),
        }))
        .await?;

    let mut events = workflow.start(params);
    while let Some(event) = events.next().await {
        writer.send(frame_for(event?, &session_id)).await?;
        if writer.finished {
            break;
        }
    }
    if !writer.finished {
        let event = StreamEvent::error("STREAM_ERROR", "workflow ended without a result", &session_id);
        writer.send(event).await?;
    }
    Ok(())
}

/// Drives one analysis session to its terminal frame.
async fn run_session(
    workflow: Arc<dyn WorkflowSource>,
    params: WorkflowParams,
    max_duration: std::time::Duration,
    mut writer: SessionWriter,
) -> Result<()> {
    let started = std::time::Instant::now();
    crate::metrics::analyze::OPEN_STREAMS.inc();
    match tokio::time::timeout(max_duration, pump(workflow.as_ref(), params, &mut writer)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(?err, "analysis stream failed");
            writer.fail("STREAM_ERROR", err.to_string()).await;
        }
        Err(_) => {
            tracing::warn!(?max_duration, "analysis stream timed out");
            let msg = format!("analysis exceeded {}s", max_duration.as_secs());
            writer.fail("STREAM_TIMEOUT", msg).await;
        }
    }
    crate::metrics::analyze::OPEN_STREAMS.dec();
    crate::metrics::analyze::SESSION_DURATION.observe(started.elapsed().as_secs_f64());
    tracing::info!(disconnected = writer.disconnected, "analysis stream closed");
    Ok(())
}

pub async fn handler(
    axum::extract::State(state): axum::extract::State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: AnalyzeRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            crate::metrics::analyze::REJECTED.inc();
            return Err(ApiError::invalid_request(format!("invalid request body: {err}")));
        }
    };
    let session_id = uuid::Uuid::new_v4().to_string();
    let params = match req.into_params(&session_id) {
        Ok(params) => params,
        Err(err) => {
            crate::metrics::analyze::REJECTED.inc();
            return Err(err);
        }
    };
    crate::metrics::analyze::SESSIONS.inc();

    let span = tracing::info_span!("analyze", session_id = %session_id);
    span.in_scope(|| tracing::info!(mode = ?params.mode, "starting analysis stream"));

    let (tx, rx) = mpsc::channel(32);
    let writer = SessionWriter::new(session_id, tx);
    let max_duration = std::time::Duration::from_secs(state.config.stream.max_duration_s);
    let workflow = state.workflow.clone();
    tokio::spawn(tracing::Instrument::instrument(
        async move {
            if let Err(err) = run_session(workflow, params, max_duration, writer).await {
                tracing::error!(?err, "analysis session failed");
            }
        },
        span,
    ));

    let headers = [
        (header::CONTENT_TYPE, "text/event-stream"),
        (header::CACHE_CONTROL, "no-cache, no-transform"),
        (header::CONNECTION, "keep-alive"),
        (header::HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Body::from_stream(ReceiverStream::new(rx))).into_response())
}
