//! Source of speech-coach workflow events.
//!
//! The analysis itself runs in the backend. It exposes the workflow as a
//! newline-delimited stream of node updates, `{"node": "stt", "update": {..}}`,
//! where each update is a partial workflow state. `HttpWorkflow` turns those
//! updates into `WorkflowEvent`s: one `Progress` per update, `Error` as soon as
//! an update carries an `error`, and `Complete` with the merged state once the
//! backend closes the stream. A stream that closes before any update set
//! `analysis_result` ends in `Error` instead.

use anyhow::Result;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<WorkflowEvent>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Quick,
    Deep,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowParams {
    pub session_id: String,
    pub audio_url: String,
    pub mode: AnalysisMode,
    pub voice_type: String,
    pub question: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMessage {
    pub step: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Partial speech-coach state as produced by one workflow node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowState {
    pub messages: Vec<StepMessage>,
    pub transcript: Option<String>,
    pub analysis_result: Option<Value>,
    pub improved_script: Option<String>,
    pub improved_audio_url: Option<String>,
    pub error: Option<WorkflowError>,
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

impl WorkflowState {
    /// Lenient extraction: missing or mistyped fields are left empty.
    pub fn from_update(v: &Value) -> Self {
        let messages = v
            .get("messages")
            .and_then(Value::as_array)
            .map(|msgs| {
                msgs.iter()
                    .map(|m| StepMessage {
                        step: str_field(m, "step"),
                        progress: m.get("progress").and_then(Value::as_f64),
                        message: str_field(m, "message"),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let error = v.get("error").filter(|e| !e.is_null()).map(|e| WorkflowError {
            code: str_field(e, "code"),
            message: str_field(e, "message").or_else(|| e.as_str().map(str::to_string)),
        });
        Self {
            messages,
            transcript: str_field(v, "transcript"),
            analysis_result: v.get("analysis_result").filter(|r| !r.is_null()).cloned(),
            improved_script: str_field(v, "improved_script"),
            improved_audio_url: str_field(v, "improved_audio_url"),
            error,
        }
    }

    /// Overwrites every field present in `update`.
    pub fn merge(&mut self, update: &WorkflowState) {
        if !update.messages.is_empty() {
            self.messages = update.messages.clone();
        }
        if update.transcript.is_some() {
            self.transcript = update.transcript.clone();
        }
        if update.analysis_result.is_some() {
            self.analysis_result = update.analysis_result.clone();
        }
        if update.improved_script.is_some() {
            self.improved_script = update.improved_script.clone();
        }
        if update.improved_audio_url.is_some() {
            self.improved_audio_url = update.improved_audio_url.clone();
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
    }

    pub fn latest_message(&self) -> Option<&StepMessage> {
        self.messages.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Progress,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub state: WorkflowState,
}

impl WorkflowEvent {
    pub fn progress(state: WorkflowState) -> Self {
        Self { kind: EventKind::Progress, state }
    }

    pub fn complete(state: WorkflowState) -> Self {
        Self { kind: EventKind::Complete, state }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        let state = WorkflowState {
            error: Some(WorkflowError { code: Some(code.to_string()), message: Some(message.into()) }),
            ..WorkflowState::default()
        };
        Self { kind: EventKind::Error, state }
    }
}

pub trait WorkflowSource: Send + Sync + 'static {
    fn start(&self, params: WorkflowParams) -> EventStream;
}

/// Splits a byte stream into newline-terminated lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).trim().to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Applies one node-update line. Returns `false` once the workflow has failed.
async fn apply_line(
    line: &str,
    merged: &mut WorkflowState,
    tx: &mpsc::Sender<Result<WorkflowEvent>>,
) -> Result<bool> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(?err, "skipping malformed workflow update");
            return Ok(true);
        }
    };
    let node = value.get("node").and_then(Value::as_str).unwrap_or("unknown").to_string();
    let update = WorkflowState::from_update(value.get("update").unwrap_or(&value));
    merged.merge(&update);
    if update.error.is_some() {
        tracing::info!(%node, "workflow node reported an error");
        tx.send(Ok(WorkflowEvent { kind: EventKind::Error, state: update })).await?;
        return Ok(false);
    }
    tracing::debug!(%node, "workflow node update");
    tx.send(Ok(WorkflowEvent::progress(update))).await?;
    Ok(true)
}

pub struct HttpWorkflow {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWorkflow {
    pub fn new(client: reqwest::Client, backend_url: &str) -> Self {
        let endpoint = format!("{}/workflows/speech-coach/stream", backend_url.trim_end_matches('/'));
        Self { client, endpoint }
    }

    async fn run(
        client: reqwest::Client,
        endpoint: String,
        params: WorkflowParams,
        tx: mpsc::Sender<Result<WorkflowEvent>>,
    ) -> Result<()> {
        let resp = match client.post(&endpoint).json(&params).send().await {
            Ok(resp) => resp,
            Err(err) => {
                tx.send(Ok(WorkflowEvent::error("WORKFLOW_ERROR", err.to_string()))).await?;
                return Ok(());
            }
        };
        if !resp.status().is_success() {
            let msg = format!("workflow backend returned {}", resp.status());
            tx.send(Ok(WorkflowEvent::error("WORKFLOW_ERROR", msg))).await?;
            return Ok(());
        }

        let mut merged = WorkflowState::default();
        let mut lines = LineBuffer::default();
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tx.send(Ok(WorkflowEvent::error("WORKFLOW_ERROR", err.to_string()))).await?;
                    return Ok(());
                }
            };
            for line in lines.push(&chunk) {
                if !apply_line(&line, &mut merged, &tx).await? {
                    return Ok(());
                }
            }
        }
        if let Some(line) = lines.finish() {
            if !apply_line(&line, &mut merged, &tx).await? {
                return Ok(());
            }
        }
        if merged.analysis_result.is_none() {
            tracing::warn!("workflow stream closed without an analysis result");
            let msg = "workflow finished without an analysis result";
            tx.send(Ok(WorkflowEvent::error("WORKFLOW_ERROR", msg))).await?;
            return Ok(());
        }
        tx.send(Ok(WorkflowEvent::complete(merged))).await?;
        Ok(())
    }
}

impl WorkflowSource for HttpWorkflow {
    fn start(&self, params: WorkflowParams) -> EventStream {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        crate::utils::spawn("workflow_updates", Self::run(client, endpoint, params, tx));
        Box::pin(ReceiverStream::new(rx))
    }
}
