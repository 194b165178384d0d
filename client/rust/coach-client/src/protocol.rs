//! Server-sent event framing and the typed events carried by analysis streams.

use crate::casing;
use crate::error::{ApiError, ClientError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// One dispatched SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes may be pushed in arbitrary pieces. Lines end with `\n` or `\r\n`,
/// comment lines (`:`) and unknown fields are ignored, multi-line `data` is
/// joined with `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(frame) = self.process_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame)
            }
        }
        frames
    }

    /// Flushes a final message that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.process_line(line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event: event.unwrap_or_else(|| "message".to_string()), data })
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
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

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub step: String,
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub analysis_result: Option<Value>,
    #[serde(default)]
    pub improved_script: Option<String>,
    #[serde(default)]
    pub improved_audio_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress(ProgressEvent),
    Complete(CompleteEvent),
    Error(ApiError),
    Heartbeat,
}

/// Parses a wire payload: JSON, wire-to-memory key conversion, then the typed event.
pub fn parse_payload<T: DeserializeOwned>(data: &str) -> Result<T> {
    let value: Value =
        serde_json::from_str(data).map_err(|e| ClientError::Protocol(e.to_string()))?;
    serde_json::from_value(casing::to_client(value))
        .map_err(|e| ClientError::Protocol(e.to_string()))
}

impl StreamEvent {
    /// `Ok(None)` for event names this client does not know about.
    pub fn from_frame(frame: &SseFrame) -> Result<Option<Self>> {
        let event = match frame.event.as_str() {
            "progress" => Self::Progress(parse_payload(&frame.data)?),
            "complete" => Self::Complete(parse_payload(&frame.data)?),
            "error" => {
                let value: Value =
                    serde_json::from_str(&frame.data).map_err(|e| ClientError::Protocol(e.to_string()))?;
                Self::Error(ApiError::from_payload(&value))
            }
            "heartbeat" => Self::Heartbeat,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
