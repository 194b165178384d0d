//! Server-sent event frames emitted by the analysis stream.
//!
//! Frame layout: `event: <name>\ndata: <json>\n\n`. Payload keys use the
//! wire convention (snake_case).

use bytes::Bytes;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub step: String,
    pub progress: u8,
    pub message: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Complete {
    pub session_id: String,
    pub transcript: Option<String>,
    pub analysis_result: Option<serde_json::Value>,
    pub improved_script: Option<String>,
    pub improved_audio_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub code: String,
    pub message: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress(Progress),
    Complete(Complete),
    Error(Failure),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, session_id: &str) -> Self {
        Self::Error(Failure {
            code: code.into(),
            message: message.into(),
            session_id: session_id.to_string(),
        })
    }

    fn data(&self) -> serde_json::Result<String> {
        match self {
            Self::Progress(p) => serde_json::to_string(p),
            Self::Complete(c) => serde_json::to_string(c),
            Self::Error(e) => serde_json::to_string(e),
        }
    }

    /// Encodes the event as a single SSE frame.
    pub fn encode(&self) -> serde_json::Result<Bytes> {
        let data = self.data()?;
        Ok(Bytes::from(format!("event: {}\ndata: {}\n\n", self.name(), data)))
    }
}
