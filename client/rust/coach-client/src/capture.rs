//! Recording controller: owns the input device for one session at a time and
//! turns its chunks into a single WAV artifact.

use crate::audio::{AudioChunk, AudioInput, CaptureConstraints};
use crate::error::{ClientError, Result};
use base64::Engine;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod wav;

pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(300);
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    Started,
    /// Whole seconds recorded so far.
    Tick(u64),
    Paused,
    Resumed,
    MaxDurationReached,
    Stopped { duration: u64 },
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub max_duration: Duration,
    pub constraints: CaptureConstraints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { max_duration: DEFAULT_MAX_DURATION, constraints: CaptureConstraints::default() }
    }
}

/// The finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureArtifact {
    pub data: Bytes,
    pub mime_type: &'static str,
    pub duration_secs: f64,
}

impl CaptureArtifact {
    pub fn to_data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.data);
        format!("data:{};base64,{encoded}", self.mime_type)
    }
}

/// Snapshot of the controller, shaped for display.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSession {
    pub is_recording: bool,
    pub is_paused: bool,
    pub duration: u64,
    pub audio_blob: Option<CaptureArtifact>,
    pub audio_url: Option<String>,
}

/// `MM:SS`.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[derive(Debug, Default)]
struct Shared {
    paused: bool,
    elapsed: Duration,
    span_start: Option<Instant>,
    max_reached: bool,
    wav: Vec<u8>,
}

impl Shared {
    fn recorded(&self) -> Duration {
        self.elapsed + self.span_start.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn close_span(&mut self) {
        if let Some(start) = self.span_start.take() {
            self.elapsed += start.elapsed();
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ActiveCapture {
    sample_rate_hz: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
    stop_collector: Option<oneshot::Sender<()>>,
    collector: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl ActiveCapture {
    fn release_tracks(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!("device tracks released");
        }
    }

    /// Runs the device release on the blocking pool, since stopping a device
    /// can block until its stream has shut down.
    async fn release_tracks_off_runtime(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(err) = tokio::task::spawn_blocking(release).await {
                warn!(?err, "device release failed");
            }
            debug!("device tracks released");
        }
    }

    fn teardown(&mut self) {
        self.ticker.abort();
        self.release_tracks();
        if let Some(stop) = self.stop_collector.take() {
            let _ = stop.send(());
        }
    }
}

pub struct CaptureController<I: AudioInput> {
    input: I,
    config: CaptureConfig,
    events: mpsc::UnboundedSender<CaptureEvent>,
    state: CaptureState,
    shared: Arc<Mutex<Shared>>,
    active: Option<ActiveCapture>,
    artifact: Option<CaptureArtifact>,
}

impl<I: AudioInput> CaptureController<I> {
    pub fn new(input: I, config: CaptureConfig) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctl = Self {
            input,
            config,
            events,
            state: CaptureState::Idle,
            shared: Arc::new(Mutex::new(Shared::default())),
            active: None,
            artifact: None,
        };
        (ctl, rx)
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Recorded time, paused spans excluded.
    pub fn duration(&self) -> Duration {
        lock(&self.shared).recorded()
    }

    pub fn session(&self) -> RecordingSession {
        RecordingSession {
            is_recording: matches!(self.state, CaptureState::Recording | CaptureState::Paused),
            is_paused: self.state == CaptureState::Paused,
            duration: self.duration().as_secs(),
            audio_blob: self.artifact.clone(),
            audio_url: self.artifact.as_ref().map(CaptureArtifact::to_data_url),
        }
    }

    fn emit(&self, event: CaptureEvent) {
        let _ = self.events.send(event);
    }

    /// Opens the input device and starts recording. Must be called from
    /// within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            CaptureState::Recording | CaptureState::Paused => return Err(ClientError::AlreadyActive),
            CaptureState::Stopped => self.artifact = None,
            CaptureState::Idle => {}
        }
        self.state = CaptureState::Idle;
        let opened = match self.input.open(&self.config.constraints) {
            Ok(opened) => opened,
            Err(err) => {
                warn!(%err, "could not open input device");
                return Err(match err {
                    ClientError::Device(_) => err,
                    other => ClientError::Device(other.to_string()),
                });
            }
        };

        {
            let mut shared = lock(&self.shared);
            *shared = Shared {
                span_start: Some(Instant::now()),
                wav: wav::streaming_header(opened.sample_rate_hz),
                ..Shared::default()
            };
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let collector = tokio::spawn(collect(opened.chunks, self.shared.clone(), stop_rx));
        let ticker = tokio::spawn(tick(self.shared.clone(), self.events.clone(), self.config.max_duration));
        self.active = Some(ActiveCapture {
            sample_rate_hz: opened.sample_rate_hz,
            release: Some(opened.release),
            stop_collector: Some(stop_tx),
            collector,
            ticker,
        });
        self.state = CaptureState::Recording;
        info!(sample_rate_hz = opened.sample_rate_hz, "recording started");
        self.emit(CaptureEvent::Started);
        Ok(())
    }

    /// Returns `false` unless currently recording.
    pub fn pause(&mut self) -> bool {
        if self.state != CaptureState::Recording {
            return false;
        }
        {
            let mut shared = lock(&self.shared);
            shared.close_span();
            shared.paused = true;
        }
        self.state = CaptureState::Paused;
        self.emit(CaptureEvent::Paused);
        true
    }

    /// Returns `false` unless currently paused.
    pub fn resume(&mut self) -> bool {
        if self.state != CaptureState::Paused {
            return false;
        }
        {
            let mut shared = lock(&self.shared);
            shared.span_start = Some(Instant::now());
            shared.paused = false;
        }
        self.state = CaptureState::Recording;
        self.emit(CaptureEvent::Resumed);
        true
    }

    /// Releases the device and returns the finished, duration-stamped recording.
    pub async fn stop(&mut self) -> Result<CaptureArtifact> {
        let mut active = match self.active.take() {
            Some(active) if matches!(self.state, CaptureState::Recording | CaptureState::Paused) => active,
            other => {
                self.active = other;
                return Err(ClientError::InvalidState("no active recording"));
            }
        };
        active.ticker.abort();
        active.release_tracks_off_runtime().await;
        active.teardown();
        if let Err(err) = (&mut active.collector).await {
            warn!(?err, "capture collector failed");
        }

        let (raw, duration) = {
            let mut shared = lock(&self.shared);
            shared.close_span();
            shared.paused = false;
            (std::mem::take(&mut shared.wav), shared.elapsed)
        };
        let data = match wav::repair(&raw, duration) {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "duration repair failed, keeping raw recording");
                Bytes::from(raw)
            }
        };
        let artifact =
            CaptureArtifact { data, mime_type: "audio/wav", duration_secs: duration.as_secs_f64() };
        self.artifact = Some(artifact.clone());
        self.state = CaptureState::Stopped;
        info!(
            duration_secs = artifact.duration_secs,
            sample_rate_hz = active.sample_rate_hz,
            bytes = artifact.data.len(),
            "recording stopped"
        );
        self.emit(CaptureEvent::Stopped { duration: duration.as_secs() });
        Ok(artifact)
    }

    /// Returns a stopped controller to idle, dropping its recording.
    pub fn reset(&mut self) -> bool {
        if self.state != CaptureState::Stopped {
            return false;
        }
        self.artifact = None;
        *lock(&self.shared) = Shared::default();
        self.state = CaptureState::Idle;
        true
    }

    /// Abandons an active recording: the timer stops and the device is
    /// released. Safe to call repeatedly. The release runs on the calling
    /// thread and may block until the device has stopped.
    pub fn shutdown(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.teardown();
            active.collector.abort();
            let mut shared = lock(&self.shared);
            shared.close_span();
            shared.wav.clear();
            self.state = CaptureState::Idle;
            debug!("active recording abandoned");
        }
    }
}

impl<I: AudioInput> Drop for CaptureController<I> {
    fn drop(&mut self) {
        self.shutdown()
    }
}

async fn collect(
    mut chunks: mpsc::Receiver<AudioChunk>,
    shared: Arc<Mutex<Shared>>,
    mut stop: oneshot::Receiver<()>,
) {
    let append = |chunk: AudioChunk| {
        let mut shared = lock(&shared);
        if !shared.paused {
            wav::append_samples(&mut shared.wav, &chunk.samples);
        }
    };
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => append(chunk),
                None => return,
            },
        }
    }
    while let Ok(chunk) = chunks.try_recv() {
        append(chunk)
    }
}

async fn tick(shared: Arc<Mutex<Shared>>, events: mpsc::UnboundedSender<CaptureEvent>, max: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + TICK, TICK);
    loop {
        interval.tick().await;
        let (secs, max_now) = {
            let mut shared = lock(&shared);
            if shared.paused {
                continue;
            }
            let recorded = shared.recorded();
            let max_now = recorded >= max && !shared.max_reached;
            if max_now {
                shared.max_reached = true;
            }
            (recorded.as_secs(), max_now)
        };
        if events.send(CaptureEvent::Tick(secs)).is_err() {
            return;
        }
        if max_now {
            info!(secs, "maximum recording duration reached");
            let _ = events.send(CaptureEvent::MaxDurationReached);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OpenedInput;
    use byteorder::{ByteOrder, LittleEndian};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct FakeInput {
        sender: Arc<Mutex<Option<mpsc::Sender<AudioChunk>>>>,
        releases: Arc<AtomicUsize>,
        release_thread: Arc<Mutex<Option<std::thread::ThreadId>>>,
        opens: Arc<AtomicUsize>,
        fail: bool,
    }

    const RATE: u32 = 100;

    impl AudioInput for FakeInput {
        fn open(&mut self, _constraints: &CaptureConstraints) -> Result<OpenedInput> {
            if self.fail {
                return Err(ClientError::Device("permission denied".to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(64);
            *self.sender.lock().unwrap() = Some(tx);
            let releases = self.releases.clone();
            let release_thread = self.release_thread.clone();
            Ok(OpenedInput {
                sample_rate_hz: RATE,
                chunks: rx,
                release: Box::new(move || {
                    releases.fetch_add(1, Ordering::SeqCst);
                    *release_thread.lock().unwrap() = Some(std::thread::current().id());
                }),
            })
        }
    }

    impl FakeInput {
        async fn feed(&self, n: usize, value: f32) {
            let tx = self.sender.lock().unwrap().clone().unwrap();
            tx.send(AudioChunk { samples: vec![value; n], sample_rate_hz: RATE }).await.unwrap();
            settle().await;
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(secs: u64) {
        for _ in 0..secs {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev)
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_is_excluded() {
        let input = FakeInput::default();
        let (mut ctl, mut events) = CaptureController::new(input.clone(), CaptureConfig::default());
        ctl.start().unwrap();
        input.feed(50, 0.25).await;
        advance(3).await;
        assert!(ctl.pause());
        input.feed(40, 0.75).await;
        advance(5).await;
        assert_eq!(ctl.session().duration, 3);
        assert!(ctl.resume());
        input.feed(30, -0.5).await;
        advance(2).await;

        let artifact = ctl.stop().await.unwrap();
        assert_eq!(artifact.duration_secs, 5.0);
        assert_eq!(artifact.mime_type, "audio/wav");
        let data = &artifact.data;
        assert_eq!(data.len(), wav::HEADER_LEN + 80 * 4);
        assert_eq!(LittleEndian::read_u32(&data[54..]), 80 * 4);
        assert_eq!(LittleEndian::read_f32(&data[wav::HEADER_LEN..]), 0.25);
        assert_eq!(LittleEndian::read_f32(&data[wav::HEADER_LEN + 50 * 4..]), -0.5);

        let events = drain(&mut events);
        assert_eq!(events.first(), Some(&CaptureEvent::Started));
        assert_eq!(events.last(), Some(&CaptureEvent::Stopped { duration: 5 }));
        assert!(events.contains(&CaptureEvent::Paused));
        assert!(events.contains(&CaptureEvent::Resumed));
        let ticks: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Tick(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert!(!ticks.is_empty());
        assert!(ticks.windows(2).all(|w| w[0] <= w[1]) && ticks.iter().all(|&s| s <= 5));

        let session = ctl.session();
        assert!(!session.is_recording);
        assert_eq!(session.audio_blob.as_ref(), Some(&artifact));
        assert!(session.audio_url.unwrap().starts_with("data:audio/wav;base64,UklGR"));
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_leaves_controller_idle() {
        let input = FakeInput { fail: true, ..Default::default() };
        let (mut ctl, mut events) = CaptureController::new(input, CaptureConfig::default());
        assert!(matches!(ctl.start(), Err(ClientError::Device(_))));
        assert_eq!(ctl.state(), CaptureState::Idle);
        assert!(ctl.session().audio_blob.is_none());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let input = FakeInput::default();
        let (mut ctl, _events) = CaptureController::new(input.clone(), CaptureConfig::default());
        ctl.start().unwrap();
        assert!(matches!(ctl.start(), Err(ClientError::AlreadyActive)));
        assert!(ctl.pause());
        assert!(matches!(ctl.start(), Err(ClientError::AlreadyActive)));
        assert_eq!(input.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_are_guarded() {
        let (mut ctl, _events) = CaptureController::new(FakeInput::default(), CaptureConfig::default());
        assert!(!ctl.pause());
        assert!(!ctl.resume());
        ctl.start().unwrap();
        assert!(!ctl.resume());
        assert!(ctl.pause());
        assert!(!ctl.pause());
        assert!(ctl.session().is_paused);
        ctl.stop().await.unwrap();
        assert!(!ctl.pause());
        assert!(matches!(ctl.stop().await, Err(ClientError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_fires_once() {
        let config = CaptureConfig { max_duration: Duration::from_secs(3), ..Default::default() };
        let (mut ctl, mut events) = CaptureController::new(FakeInput::default(), config);
        ctl.start().unwrap();
        advance(6).await;
        let events = drain(&mut events);
        let hits = events.iter().filter(|e| **e == CaptureEvent::MaxDurationReached).count();
        assert_eq!(hits, 1);
        assert_eq!(ctl.state(), CaptureState::Recording);
        assert!(events.contains(&CaptureEvent::Tick(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_are_released_once() {
        let input = FakeInput::default();
        let (mut ctl, _events) = CaptureController::new(input.clone(), CaptureConfig::default());
        ctl.start().unwrap();
        ctl.stop().await.unwrap();
        ctl.shutdown();
        drop(ctl);
        assert_eq!(input.releases.load(Ordering::SeqCst), 1);

        let (mut ctl, _events) = CaptureController::new(input.clone(), CaptureConfig::default());
        ctl.start().unwrap();
        ctl.shutdown();
        ctl.shutdown();
        assert_eq!(ctl.state(), CaptureState::Idle);
        drop(ctl);
        assert_eq!(input.releases.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_the_device_off_the_runtime_thread() {
        let input = FakeInput::default();
        let (mut ctl, _events) = CaptureController::new(input.clone(), CaptureConfig::default());
        ctl.start().unwrap();
        ctl.stop().await.unwrap();
        assert_eq!(input.releases.load(Ordering::SeqCst), 1);
        let released_on = input.release_thread.lock().unwrap().unwrap();
        assert_ne!(released_on, std::thread::current().id());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_and_reset_clear_the_artifact() {
        let input = FakeInput::default();
        let (mut ctl, _events) = CaptureController::new(input.clone(), CaptureConfig::default());
        ctl.start().unwrap();
        advance(1).await;
        ctl.stop().await.unwrap();
        assert!(ctl.session().audio_blob.is_some());

        ctl.start().unwrap();
        assert!(ctl.session().audio_blob.is_none());
        assert_eq!(ctl.session().duration, 0);
        ctl.stop().await.unwrap();

        assert!(ctl.reset());
        assert!(!ctl.reset());
        assert_eq!(ctl.state(), CaptureState::Idle);
        assert!(ctl.session().audio_blob.is_none());
    }

    #[test]
    fn durations_format_as_minutes_and_seconds() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(65), "01:05");
        assert_eq!(format_duration(300), "05:00");
    }

    #[test]
    fn data_url_is_base64() {
        let artifact =
            CaptureArtifact { data: Bytes::from_static(b"abc"), mime_type: "audio/wav", duration_secs: 0.0 };
        assert_eq!(artifact.to_data_url(), "data:audio/wav;base64,YWJj");
    }
}
