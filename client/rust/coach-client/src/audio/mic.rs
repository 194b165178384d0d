use super::{downmix_to_mono_into, AudioChunk, AudioInput, CaptureConstraints, OpenedInput};
use crate::error::{ClientError, Result};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CHUNK_CHANNEL_CAPACITY: usize = 64;

fn device_err(e: impl std::fmt::Display) -> ClientError {
    ClientError::Device(e.to_string())
}

/// The default system microphone.
///
/// cpal streams are not `Send`, so each opened stream lives on its own thread
/// until released.
#[derive(Debug, Default)]
pub struct MicInput {
    device_name: Option<String>,
}

impl MicInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the input device with this name instead of the default one.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self { device_name: Some(name.into()) }
    }
}

impl AudioInput for MicInput {
    fn open(&mut self, constraints: &CaptureConstraints) -> Result<OpenedInput> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            debug!(
                echo_cancellation = constraints.echo_cancellation,
                noise_suppression = constraints.noise_suppression,
                "input processing requested, recording raw device signal"
            );
        }
        let constraints = *constraints;
        let device_name = self.device_name.clone();
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel::<AudioChunk>(CHUNK_CHANNEL_CAPACITY);

        let thread = std::thread::Builder::new().name("coach-mic".to_string()).spawn(move || {
            let stream = match start_stream(device_name.as_deref(), &constraints, tx) {
                Ok((stream, rate)) => {
                    let _ = init_tx.send(Ok(rate));
                    stream
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };
            // Returns on an explicit stop or once the controller side is gone.
            let _ = stop_rx.recv();
            drop(stream);
        })?;

        let sample_rate_hz = match init_rx.recv() {
            Ok(result) => result?,
            Err(_) => return Err(device_err("microphone thread exited")),
        };
        info!(sample_rate_hz, "microphone opened");
        let release = Box::new(move || {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                warn!("microphone thread panicked");
            }
        });
        Ok(OpenedInput { sample_rate_hz, chunks: rx, release })
    }
}

fn start_stream(
    device_name: Option<&str>,
    constraints: &CaptureConstraints,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = match device_name {
        None => host.default_input_device(),
        Some(name) => host
            .input_devices()
            .map_err(device_err)?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
    }
    .ok_or_else(|| device_err("no input device available"))?;

    let preferred = cpal::SampleRate(constraints.sample_rate_hz);
    let input_config = device
        .supported_input_configs()
        .map_err(device_err)?
        .find(|c| c.min_sample_rate() <= preferred && preferred <= c.max_sample_rate())
        .map(|c| c.with_sample_rate(preferred));
    let input_config = match input_config {
        Some(c) => c,
        None => device.default_input_config().map_err(device_err)?,
    };

    let sample_rate_hz = input_config.sample_rate().0;
    let channels = usize::from(input_config.channels());
    let stream_config: StreamConfig = input_config.clone().into();

    let stream = match input_config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, channels, sample_rate_hz, tx)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, channels, sample_rate_hz, tx)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, channels, sample_rate_hz, tx)?,
        other => return Err(device_err(format!("unsupported input sample format: {other:?}"))),
    };
    stream.play().map_err(device_err)?;
    Ok((stream, sample_rate_hz))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    sample_rate_hz: u32,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut mono_buf = Vec::<f32>::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                downmix_to_mono_into(data, channels, &mut mono_buf, |s| f32::from_sample_(s));
                if mono_buf.is_empty() {
                    return;
                }
                let chunk = AudioChunk { samples: mono_buf.clone(), sample_rate_hz };
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(chunk) {
                    warn!("capture buffer full, dropping audio");
                }
            },
            move |err| {
                warn!(error = %err, "mic input stream error");
            },
            None,
        )
        .map_err(device_err)
}
