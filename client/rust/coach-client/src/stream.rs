//! Consumption of analysis event streams.
//!
//! `dispatch` turns a byte stream into handler callbacks. Exactly one of
//! `on_complete` / `on_error` ends a stream unless it is cancelled first, in
//! which case no further callbacks run at all.

use crate::error::{ApiError, ClientError, Result};
use crate::protocol::{CompleteEvent, ProgressEvent, SseDecoder, SseFrame, StreamEvent};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

pub trait StreamHandler: Send + 'static {
    fn on_progress(&mut self, _event: ProgressEvent) {}
    fn on_complete(&mut self, _event: CompleteEvent) {}
    fn on_error(&mut self, _error: ApiError) {}
    fn on_heartbeat(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Cancellation flag shared between a stream task and its owners.
///
/// Cancelling is idempotent. A token may be passed in from outside to tie a
/// stream to some wider abort signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Handle on a running stream subscription.
#[derive(Debug)]
pub struct StreamHandle {
    token: CancelToken,
    task: JoinHandle<StreamOutcome>,
}

impl StreamHandle {
    /// Closes the stream. No callbacks run afterwards; calling it again, or
    /// after the stream already ended, does nothing.
    pub fn cancel(&self) {
        self.token.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the stream task to end.
    pub async fn join(self) -> StreamOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(?err, "stream task panicked");
                StreamOutcome::Failed
            }
        }
    }
}

enum FrameResult {
    Continue,
    Done(StreamOutcome),
}

fn handle_frame<H: StreamHandler>(frame: &SseFrame, handler: &mut H) -> FrameResult {
    match StreamEvent::from_frame(frame) {
        Ok(Some(StreamEvent::Progress(p))) => handler.on_progress(p),
        Ok(Some(StreamEvent::Heartbeat)) => handler.on_heartbeat(),
        Ok(Some(StreamEvent::Complete(c))) => {
            handler.on_complete(c);
            return FrameResult::Done(StreamOutcome::Completed);
        }
        Ok(Some(StreamEvent::Error(e))) => {
            handler.on_error(e);
            return FrameResult::Done(StreamOutcome::Failed);
        }
        Ok(None) => debug!(event = %frame.event, "ignoring unknown event"),
        Err(err) if frame.event == "progress" => {
            warn!(%err, "skipping malformed progress frame");
        }
        Err(err) => {
            warn!(%err, event = %frame.event, "unparsable terminal frame");
            handler.on_error(ApiError::connection_lost());
            return FrameResult::Done(StreamOutcome::Failed);
        }
    }
    FrameResult::Continue
}

/// Reads SSE frames from `body` and dispatches them to `handler`.
pub async fn dispatch<S, E, H>(body: S, handler: &mut H, token: &CancelToken) -> StreamOutcome
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
    H: StreamHandler,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamOutcome::Cancelled,
            chunk = body.next() => chunk,
        };
        let frames = match chunk {
            Some(Ok(chunk)) => decoder.push(&chunk),
            Some(Err(err)) => {
                if token.is_cancelled() {
                    return StreamOutcome::Cancelled;
                }
                warn!(%err, "event stream transport failure");
                handler.on_error(ApiError::connection_lost());
                return StreamOutcome::Failed;
            }
            None => {
                for frame in decoder.finish() {
                    if token.is_cancelled() {
                        return StreamOutcome::Cancelled;
                    }
                    if let FrameResult::Done(outcome) = handle_frame(&frame, handler) {
                        return outcome;
                    }
                }
                if token.is_cancelled() {
                    return StreamOutcome::Cancelled;
                }
                debug!("event stream ended without a terminal event");
                handler.on_error(ApiError::connection_lost());
                return StreamOutcome::Failed;
            }
        };
        for frame in frames {
            if token.is_cancelled() {
                return StreamOutcome::Cancelled;
            }
            if let FrameResult::Done(outcome) = handle_frame(&frame, handler) {
                return outcome;
            }
        }
    }
}

/// Body of `POST /api/analyze`, in the request's camelCase convention.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub audio_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub mode: String,
    pub voice_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

impl AnalyzeRequest {
    pub fn new(audio_url: impl Into<String>) -> Self {
        Self {
            audio_url: audio_url.into(),
            project_id: None,
            mode: "quick".to_string(),
            voice_type: "default_male".to_string(),
            question: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    base_url: Url,
}

impl StreamClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Validation(format!("{base_url} cannot be a base url")));
        }
        Ok(Self { http, base_url })
    }

    pub(crate) fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Subscribes to `GET /api/sessions/{id}/stream`.
    pub fn subscribe<H: StreamHandler>(&self, session_id: &str, handler: H) -> StreamHandle {
        self.subscribe_with(session_id, handler, CancelToken::new())
    }

    /// Like `subscribe`, closing the stream when `token` is cancelled.
    pub fn subscribe_with<H: StreamHandler>(
        &self,
        session_id: &str,
        handler: H,
        token: CancelToken,
    ) -> StreamHandle {
        let url = self.endpoint(&["api", "sessions", session_id, "stream"]);
        let req = self.http.get(url).header(reqwest::header::ACCEPT, "text/event-stream");
        self.spawn(req, handler, token)
    }

    /// Starts an analysis with `POST /api/analyze` and consumes its event stream.
    pub fn analyze<H: StreamHandler>(&self, request: &AnalyzeRequest, handler: H) -> StreamHandle {
        self.analyze_with(request, handler, CancelToken::new())
    }

    pub fn analyze_with<H: StreamHandler>(
        &self,
        request: &AnalyzeRequest,
        handler: H,
        token: CancelToken,
    ) -> StreamHandle {
        let url = self.endpoint(&["api", "analyze"]);
        let req = self.http.post(url).json(request);
        self.spawn(req, handler, token)
    }

    /// Runs an analysis to its end and returns every event received.
    pub async fn collect(&self, request: &AnalyzeRequest) -> Result<Vec<StreamEvent>> {
        #[derive(Default)]
        struct Collector(Vec<StreamEvent>);

        impl StreamHandler for Collector {
            fn on_progress(&mut self, event: ProgressEvent) {
                self.0.push(StreamEvent::Progress(event))
            }
            fn on_complete(&mut self, event: CompleteEvent) {
                self.0.push(StreamEvent::Complete(event))
            }
            fn on_error(&mut self, error: ApiError) {
                self.0.push(StreamEvent::Error(error))
            }
            fn on_heartbeat(&mut self) {
                self.0.push(StreamEvent::Heartbeat)
            }
        }

        let url = self.endpoint(&["api", "analyze"]);
        let resp = self.http.post(url).json(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = ApiError::from_body(&body)
                .unwrap_or_else(|| ApiError::new("HTTP_ERROR", format!("gateway returned {status}")));
            return Err(ClientError::Api(err));
        }
        let mut collector = Collector::default();
        dispatch(resp.bytes_stream(), &mut collector, &CancelToken::new()).await;
        Ok(collector.0)
    }

    fn spawn<H: StreamHandler>(
        &self,
        req: reqwest::RequestBuilder,
        mut handler: H,
        token: CancelToken,
    ) -> StreamHandle {
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let token = task_token;
            let resp = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamOutcome::Cancelled,
                resp = req.send() => resp,
            };
            let resp = match resp {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(%err, "could not open event stream");
                    handler.on_error(ApiError::connection_lost());
                    return StreamOutcome::Failed;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                if token.is_cancelled() {
                    return StreamOutcome::Cancelled;
                }
                warn!(%status, "event stream rejected");
                handler.on_error(ApiError::from_body(&body).unwrap_or_else(ApiError::connection_lost));
                return StreamOutcome::Failed;
            }
            dispatch(resp.bytes_stream(), &mut handler, &token).await
        });
        StreamHandle { token, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl StreamHandler for Recorder {
        fn on_progress(&mut self, event: ProgressEvent) {
            self.0.push(format!("progress:{}:{}", event.step, event.progress))
        }
        fn on_complete(&mut self, event: CompleteEvent) {
            self.0.push(format!("complete:{}", event.transcript.unwrap_or_default()))
        }
        fn on_error(&mut self, error: ApiError) {
            self.0.push(format!("error:{}", error.code))
        }
        fn on_heartbeat(&mut self) {
            self.0.push("heartbeat".to_string())
        }
    }

    /// Forwards callbacks to a channel so spawned streams can be observed.
    struct Forward(mpsc::UnboundedSender<String>);

    impl StreamHandler for Forward {
        fn on_progress(&mut self, event: ProgressEvent) {
            let _ = self.0.send(format!("progress:{}", event.step));
        }
        fn on_complete(&mut self, _event: CompleteEvent) {
            let _ = self.0.send("complete".to_string());
        }
        fn on_error(&mut self, error: ApiError) {
            let _ = self.0.send(format!("error:{}", error.code));
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = std::result::Result<Bytes, String>> {
        let parts: Vec<_> = parts.iter().map(|p| Ok(Bytes::from(p.to_string()))).collect();
        stream::iter(parts)
    }

    async fn run(parts: &[&str]) -> (StreamOutcome, Vec<String>) {
        let mut rec = Recorder::default();
        let outcome = dispatch(chunks(parts), &mut rec, &CancelToken::new()).await;
        (outcome, rec.0)
    }

    #[tokio::test]
    async fn progress_then_complete() {
        let (outcome, calls) = run(&[
            "event: progress\ndata: {\"step\":\"stt\",\"progress\":20,\"session_id\":\"s\"}\n\nevent: heart",
            "beat\ndata: {}\n\nevent: complete\ndata: {\"transcript\":\"hi\"}\n\n",
            "event: progress\ndata: {\"step\":\"late\",\"progress\":99}\n\n",
        ])
        .await;
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(calls, ["progress:stt:20", "heartbeat", "complete:hi"]);
    }

    #[tokio::test]
    async fn error_frame_payload_is_forwarded() {
        let (outcome, calls) =
            run(&["event: error\ndata: {\"code\":\"STT_FAILED\",\"message\":\"no speech\"}\n\n"]).await;
        assert_eq!(outcome, StreamOutcome::Failed);
        assert_eq!(calls, ["error:STT_FAILED"]);
    }

    #[tokio::test]
    async fn error_frame_without_message_keeps_its_code() {
        let (outcome, calls) = run(&["event: error\ndata: {\"code\":\"STT_FAILED\"}\n\n"]).await;
        assert_eq!(outcome, StreamOutcome::Failed);
        assert_eq!(calls, ["error:STT_FAILED"]);
    }

    #[tokio::test]
    async fn unparsable_error_is_a_connection_error() {
        let (_, calls) = run(&["event: error\ndata: not json\n\n"]).await;
        assert_eq!(calls, ["error:CONNECTION_ERROR"]);
    }

    #[tokio::test]
    async fn malformed_progress_is_skipped() {
        let (outcome, calls) = run(&[
            "event: progress\ndata: {oops\n\n",
            "event: complete\ndata: {}\n\n",
        ])
        .await;
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(calls, ["complete:"]);
    }

    #[tokio::test]
    async fn early_end_is_a_connection_error() {
        let (outcome, calls) = run(&["event: progress\ndata: {\"step\":\"stt\",\"progress\":1}\n\n"]).await;
        assert_eq!(outcome, StreamOutcome::Failed);
        assert_eq!(calls, ["progress:stt:1", "error:CONNECTION_ERROR"]);
    }

    #[tokio::test]
    async fn unterminated_final_frame_still_counts() {
        let (outcome, calls) = run(&["event: complete\ndata: {\"transcript\":\"x\"}"]).await;
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(calls, ["complete:x"]);
    }

    #[tokio::test]
    async fn transport_failure_is_a_connection_error() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"event: progress\ndata: {\"step\":\"a\",\"progress\":5}\n\n")),
            Err("connection reset".to_string()),
        ]);
        let mut rec = Recorder::default();
        let outcome = dispatch(body, &mut rec, &CancelToken::new()).await;
        assert_eq!(outcome, StreamOutcome::Failed);
        assert_eq!(rec.0, ["progress:a:5", "error:CONNECTION_ERROR"]);
    }

    #[tokio::test]
    async fn cancelled_stream_makes_no_callbacks() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        let mut rec = Recorder::default();
        let outcome = dispatch(chunks(&["event: complete\ndata: {}\n\n"]), &mut rec, &token).await;
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert!(rec.0.is_empty());
    }

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    fn sse_response(body: axum::body::Body) -> axum::response::Response {
        axum::response::Response::builder()
            .header("content-type", "text/event-stream")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn subscribe_reads_session_stream() {
        let app = axum::Router::new().route(
            "/api/sessions/{id}/stream",
            axum::routing::get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                let body = format!(
                    "event: progress\ndata: {{\"step\":\"{id}\",\"progress\":10}}\n\nevent: complete\ndata: {{}}\n\n"
                );
                sse_response(axum::body::Body::from(body))
            }),
        );
        let base = serve(app).await;
        let client = StreamClient::new(&base).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = client.subscribe("abc", Forward(tx));
        assert_eq!(handle.join().await, StreamOutcome::Completed);
        assert_eq!(rx.recv().await.unwrap(), "progress:abc");
        assert_eq!(rx.recv().await.unwrap(), "complete");
    }

    #[tokio::test]
    async fn cancel_closes_open_stream() {
        let app = axum::Router::new().route(
            "/api/sessions/{id}/stream",
            axum::routing::get(|| async {
                let first = stream::iter(vec![Ok::<_, std::convert::Infallible>(Bytes::from_static(
                    b"event: progress\ndata: {\"step\":\"stt\",\"progress\":10}\n\n",
                ))]);
                sse_response(axum::body::Body::from_stream(first.chain(stream::pending())))
            }),
        );
        let base = serve(app).await;
        let client = StreamClient::new(&base).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = client.subscribe("s", Forward(tx));
        assert_eq!(rx.recv().await.unwrap(), "progress:stt");

        handle.cancel();
        handle.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_after_complete_is_a_noop() {
        let app = axum::Router::new().route(
            "/api/sessions/{id}/stream",
            axum::routing::get(|| async {
                sse_response(axum::body::Body::from("event: complete\ndata: {}\n\n"))
            }),
        );
        let base = serve(app).await;
        let client = StreamClient::new(&base).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = client.subscribe("s", Forward(tx));
        assert_eq!(rx.recv().await.unwrap(), "complete");
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        handle.cancel();
        handle.cancel();
        assert_eq!(handle.join().await, StreamOutcome::Completed);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn analyze_rejection_reports_api_error() {
        let app = axum::Router::new().route(
            "/api/analyze",
            axum::routing::post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    axum::Json(serde_json::json!({"error": {"code": "INVALID_REQUEST", "message": "audioUrl is required"}})),
                )
            }),
        );
        let base = serve(app).await;
        let client = StreamClient::new(&base).unwrap();
        let err = client.collect(&AnalyzeRequest::new("")).await.unwrap_err();
        match err {
            ClientError::Api(e) => assert_eq!(e.code, "INVALID_REQUEST"),
            other => panic!("unexpected error: {other:?}"),
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(client.analyze(&AnalyzeRequest::new(""), Forward(tx)).join().await, StreamOutcome::Failed);
        assert_eq!(rx.recv().await.unwrap(), "error:INVALID_REQUEST");
    }

    #[tokio::test]
    async fn collect_returns_all_events() {
        let app = axum::Router::new().route(
            "/api/analyze",
            axum::routing::post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                assert_eq!(body["audioUrl"], "https://cdn/a.wav");
                assert_eq!(body["voiceType"], "default_male");
                sse_response(axum::body::Body::from(
                    "event: progress\ndata: {\"step\":\"start\",\"progress\":0}\n\nevent: complete\ndata: {\"analysis_result\":{\"overall_score\":80}}\n\n",
                ))
            }),
        );
        let base = serve(app).await;
        let client = StreamClient::new(&base).unwrap();
        let events = client.collect(&AnalyzeRequest::new("https://cdn/a.wav")).await.unwrap();
        assert_eq!(events.len(), 2);
        match &events[1] {
            StreamEvent::Complete(c) => {
                assert_eq!(c.analysis_result.as_ref().unwrap()["overallScore"], 80)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn endpoint_escapes_segments() {
        let client = StreamClient::new("http://gw:3000/base/").unwrap();
        let url = client.endpoint(&["api", "sessions", "a b", "stream"]);
        assert_eq!(url.as_str(), "http://gw:3000/base/api/sessions/a%20b/stream");
    }
}
