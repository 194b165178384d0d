//! Catch-all `/api/*` reverse proxy to the backend.
//!
//! Only `Authorization` and `Content-Type` are forwarded. Event-stream
//! responses are relayed chunk by chunk as they arrive; everything else is
//! read in full and echoed with the backend status.

use crate::utils::ApiError;
use crate::AppState;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};

const FORWARDED_HEADERS: [header::HeaderName; 2] = [header::AUTHORIZATION, header::CONTENT_TYPE];

/// Backend URL for an inbound `/api/...` request, with the `/api` prefix removed.
pub fn target_url(backend_url: &str, uri: &Uri) -> String {
    let path = uri.path();
    let path = path.strip_prefix("/api").unwrap_or(path);
    let base = backend_url.trim_end_matches('/');
    match uri.query() {
        Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
        _ => format!("{base}{path}"),
    }
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("multipart/form-data"))
}

fn build_request(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> reqwest::RequestBuilder {
    let mut req = client.request(method.clone(), url);
    for name in FORWARDED_HEADERS.iter() {
        if let Some(value) = headers.get(name) {
            req = req.header(name.clone(), value.clone());
        }
    }
    if carries_body(&method) {
        // Multipart bodies go out byte for byte so the boundary in the
        // forwarded content type still matches.
        req = if is_multipart(headers) {
            req.body(body)
        } else {
            req.body(String::from_utf8_lossy(&body).into_owned())
        };
    }
    req
}

fn is_event_stream(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"))
}

pub async fn handler(
    axum::extract::State(state): axum::extract::State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = target_url(&state.config.backend_url, &uri);
    crate::metrics::proxy::REQUESTS.with_label_values(&[method.as_str()]).inc();
    tracing::debug!(%method, %url, "proxying request");

    let resp = match build_request(&state.http, method, &url, &headers, body).send().await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(?err, %url, "backend request failed");
            crate::metrics::proxy::ERRORS.inc();
            return ApiError::proxy().into_response();
        }
    };
    let status = resp.status();

    if is_event_stream(&resp) {
        crate::metrics::proxy::SSE_PASSTHROUGH.inc();
        let headers = [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ];
        return (status, headers, Body::from_stream(resp.bytes_stream())).into_response();
    }

    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    match resp.text().await {
        Ok(text) => (status, [(header::CONTENT_TYPE, content_type)], text).into_response(),
        Err(err) => {
            tracing::warn!(?err, %url, "failed to read backend response");
            crate::metrics::proxy::ERRORS.inc();
            ApiError::proxy().into_response()
        }
    }
}
