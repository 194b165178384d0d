//! `GET /api/voice-clone/status`: current state of a voice-cloning job.

use crate::utils::ApiError;
use crate::AppState;
use anyhow::Result;
use axum::http::{header, HeaderMap, StatusCode};
use futures_util::future::BoxFuture;

/// A voice-clone job as stored by the backend.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct VoiceCloneRecord {
    pub id: String,
    #[serde(default)]
    pub voice_name: Option<String>,
    pub status: String,
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

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceCloneStatus {
    pub voice_clone_id: String,
    pub voice_name: Option<String>,
    pub status: String,
    pub sample_audio_url: Option<String>,
    pub error_message: Option<String>,
    pub sample_duration_seconds: Option<f64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl From<VoiceCloneRecord> for VoiceCloneStatus {
    fn from(r: VoiceCloneRecord) -> Self {
        Self {
            voice_clone_id: r.id,
            voice_name: r.voice_name,
            status: r.status,
            sample_audio_url: r.sample_audio_url,
            error_message: r.error_message,
            sample_duration_seconds: r.sample_duration_seconds,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Lookup of voice-clone jobs on behalf of a caller.
///
/// `id: None` means the caller's current job. `Ok(None)` means the caller has
/// no such job.
pub trait JobStore: Send + Sync + 'static {
    fn find(
        &self,
        id: Option<String>,
        authorization: Option<String>,
    ) -> BoxFuture<'_, Result<Option<VoiceCloneRecord>>>;
}

pub struct BackendJobStore {
    client: reqwest::Client,
    endpoint: String,
}

impl BackendJobStore {
    pub fn new(client: reqwest::Client, backend_url: &str) -> Self {
        let endpoint = format!("{}/voice-clone/status", backend_url.trim_end_matches('/'));
        Self { client, endpoint }
    }

    async fn fetch(
        &self,
        id: Option<String>,
        authorization: Option<String>,
    ) -> Result<Option<VoiceCloneRecord>> {
        let mut req = self.client.get(&self.endpoint);
        if let Some(id) = id {
            req = req.query(&[("id", id)]);
        }
        if let Some(auth) = authorization {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.json().await?))
    }
}

impl JobStore for BackendJobStore {
    fn find(
        &self,
        id: Option<String>,
        authorization: Option<String>,
    ) -> BoxFuture<'_, Result<Option<VoiceCloneRecord>>> {
        Box::pin(self.fetch(id, authorization))
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    id: Option<String>,
}

pub async fn handler(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Query(query): axum::extract::Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<axum::Json<VoiceCloneStatus>, ApiError> {
    use crate::metrics::voice_clone::STATUS_QUERIES;

    let id = query.id.filter(|id| !id.is_empty());
    let authorization =
        headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()).map(str::to_string);
    match state.jobs.find(id.clone(), authorization).await {
        Ok(Some(record)) => {
            let outcome = match record.status.as_str() {
                s @ ("processing" | "ready" | "failed") => s,
                _ => "other",
            };
            STATUS_QUERIES.with_label_values(&[outcome]).inc();
            Ok(axum::Json(record.into()))
        }
        Ok(None) => {
            STATUS_QUERIES.with_label_values(&["not_found"]).inc();
            Err(ApiError::not_found("No voice clone found"))
        }
        Err(err) => {
            STATUS_QUERIES.with_label_values(&["error"]).inc();
            tracing::error!(?err, ?id, "voice clone lookup failed");
            Err(ApiError::internal("Failed to look up voice clone"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct InMemoryJobs {
        jobs: HashMap<String, VoiceCloneRecord>,
        token: &'static str,
    }

    impl JobStore for InMemoryJobs {
        fn find(
            &self,
            id: Option<String>,
            authorization: Option<String>,
        ) -> BoxFuture<'_, Result<Option<VoiceCloneRecord>>> {
            Box::pin(async move {
                if authorization.as_deref() != Some(self.token) {
                    return Ok(None);
                }
                let found = match id {
                    Some(id) => self.jobs.get(&id).cloned(),
                    None => self.jobs.values().next().cloned(),
                };
                Ok(found)
            })
        }
    }

    struct BrokenJobs;

    impl JobStore for BrokenJobs {
        fn find(&self, _: Option<String>, _: Option<String>) -> BoxFuture<'_, Result<Option<VoiceCloneRecord>>> {
            Box::pin(async { Err(anyhow::anyhow!("database unavailable")) })
        }
    }

    fn record(id: &str, status: &str) -> VoiceCloneRecord {
        VoiceCloneRecord {
            id: id.to_string(),
            voice_name: Some("My voice".to_string()),
            status: status.to_string(),
            sample_audio_url: None,
            error_message: None,
            sample_duration_seconds: Some(42.5),
            created_at: Some("2026-01-02T03:04:05Z".to_string()),
            updated_at: None,
        }
    }

    fn app(jobs: impl JobStore) -> axum::Router {
        let state = crate::AppStateInner::for_tests("http://127.0.0.1:9").with_jobs(Arc::new(jobs));
        crate::router(Arc::new(state))
    }

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::get(uri).header("authorization", "Bearer me").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn returns_camel_case_payload() {
        let jobs = InMemoryJobs {
            jobs: HashMap::from([("vc-1".to_string(), record("vc-1", "processing"))]),
            token: "Bearer me",
        };
        let (status, v) = get(app(jobs), "/api/voice-clone/status?id=vc-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["voiceCloneId"], "vc-1");
        assert_eq!(v["status"], "processing");
        assert_eq!(v["sampleDurationSeconds"], 42.5);
        assert!(v["sampleAudioUrl"].is_null());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let jobs = InMemoryJobs { jobs: HashMap::new(), token: "Bearer me" };
        let (status, v) = get(app(jobs), "/api/voice-clone/status?id=nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(v["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn other_callers_jobs_are_hidden() {
        let jobs = InMemoryJobs {
            jobs: HashMap::from([("vc-1".to_string(), record("vc-1", "ready"))]),
            token: "Bearer someone-else",
        };
        let (status, _) = get(app(jobs), "/api/voice-clone/status?id=vc-1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    /// Backend that knows job `vc-1` for `Bearer me` only.
    async fn job_backend() -> String {
        async fn status(
            axum::extract::Query(q): axum::extract::Query<HashMap<String, String>>,
            headers: HeaderMap,
        ) -> axum::response::Response {
            use axum::response::IntoResponse;
            if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some("Bearer me") {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            match q.get("id").map(String::as_str) {
                Some("vc-1") | None => axum::Json(serde_json::json!({
                    "id": "vc-1",
                    "status": "ready",
                    "sample_audio_url": "https://cdn/vc-1.wav",
                }))
                .into_response(),
                Some(_) => StatusCode::NOT_FOUND.into_response(),
            }
        }
        let app = axum::Router::new().route("/voice-clone/status", axum::routing::get(status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn backend_store_forwards_authorization() {
        let store = BackendJobStore::new(reqwest::Client::new(), &job_backend().await);
        let found = store.find(Some("vc-1".to_string()), Some("Bearer me".to_string())).await.unwrap();
        let found = found.unwrap();
        assert_eq!(found.id, "vc-1");
        assert_eq!(found.status, "ready");
        assert_eq!(found.sample_audio_url.as_deref(), Some("https://cdn/vc-1.wav"));
        assert!(found.voice_name.is_none());

        let current = store.find(None, Some("Bearer me".to_string())).await.unwrap();
        assert_eq!(current.map(|r| r.id).as_deref(), Some("vc-1"));

        let denied = store.find(Some("vc-1".to_string()), None).await;
        assert!(denied.is_err());
    }

    #[tokio::test]
    async fn backend_not_found_is_none() {
        let store = BackendJobStore::new(reqwest::Client::new(), &job_backend().await);
        let found = store.find(Some("nope".to_string()), Some("Bearer me".to_string())).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn gateway_serves_backend_jobs() {
        let state = crate::AppStateInner::for_tests(&job_backend().await);
        let (status, v) = get(crate::router(Arc::new(state)), "/api/voice-clone/status?id=vc-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["voiceCloneId"], "vc-1");
        assert_eq!(v["sampleAudioUrl"], "https://cdn/vc-1.wav");
    }

    #[tokio::test]
    async fn store_failure_is_internal_error() {
        let (status, v) = get(app(BrokenJobs), "/api/voice-clone/status").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(v["error"]["code"], "INTERNAL_ERROR");
    }
}
