use anyhow::Result;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Replaces `$NAME` occurrences with the value of the environment variable,
/// or the empty string when it is unset.
pub fn replace_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Structured `{code, message}` error returned by the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
    /// When set the body is `{"error": {code, message}}` instead of the flat form.
    #[serde(skip)]
    pub nested: bool,
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_REQUEST",
            message: message.into(),
            status: StatusCode::BAD_REQUEST,
            nested: true,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { code: "NOT_FOUND", message: message.into(), status: StatusCode::NOT_FOUND, nested: true }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL_ERROR",
            message: message.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            nested: true,
        }
    }

    pub fn proxy() -> Self {
        Self {
            code: "PROXY_ERROR",
            message: "Failed to connect to backend".to_string(),
            status: StatusCode::BAD_GATEWAY,
            nested: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Nested<'a> {
            error: &'a ApiError,
        }

        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        } else {
            tracing::debug!(code = self.code, message = %self.message, "request rejected");
        }
        let status = self.status;
        if self.nested {
            (status, axum::Json(Nested { error: &self })).into_response()
        } else {
            (status, axum::Json(&self)).into_response()
        }
    }
}

pub fn spawn<F>(name: &'static str, future: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::task::spawn(async move {
        match future.await {
            Ok(_) => tracing::debug!(?name, "task completed successfully"),
            Err(err) => tracing::error!(?name, ?err, "task failed"),
        }
    })
}
