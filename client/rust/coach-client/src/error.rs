use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

const UNKNOWN_CODE: &str = "UNKNOWN_ERROR";
const UNKNOWN_MESSAGE: &str = "An unknown error occurred";

/// Structured `{code, message}` error as sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    /// The error reported when a stream breaks without a usable error frame.
    pub fn connection_lost() -> Self {
        Self::new("CONNECTION_ERROR", "connection lost")
    }

    /// Reads an error response body, either `{error: {code, message}}` or a
    /// flat `{code, message}`. A missing code becomes `HTTP_ERROR`.
    pub fn from_body(body: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let err = value.get("error").filter(|e| e.is_object()).unwrap_or(&value);
        let message = err.get("message")?.as_str()?;
        let code = err.get("code").and_then(|c| c.as_str()).unwrap_or("HTTP_ERROR");
        Some(Self::new(code, message))
    }

    /// Reads the payload of an `error` frame. Missing or mistyped fields fall
    /// back to generic values so the frame's code survives on its own.
    pub fn from_payload(value: &serde_json::Value) -> Self {
        let field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Self {
            code: field("code").unwrap_or_else(|| UNKNOWN_CODE.to_string()),
            message: field("message").unwrap_or_else(|| UNKNOWN_MESSAGE.to_string()),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("{0}")]
    Job(String),

    #[error("{0}")]
    Api(ApiError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("a recording session is already active")]
    AlreadyActive,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::Validation(err.to_string())
    }
}
