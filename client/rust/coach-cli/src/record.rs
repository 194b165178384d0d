use anyhow::{Context, Result};
use clap::Args;
use coach_client::audio::mic::MicInput;
use coach_client::capture::format_duration;
use coach_client::{CaptureConfig, CaptureController, CaptureEvent};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Where to write the recording
    #[arg(long, short = 'o', default_value = "recording.wav")]
    pub output: PathBuf,

    /// Seconds after which a warning is shown
    #[arg(long, default_value = "300")]
    pub max_duration_s: u64,

    /// Stop automatically once the maximum duration is reached
    #[arg(long)]
    pub stop_at_max: bool,

    /// Input device name, the system default when omitted
    #[arg(long)]
    pub device: Option<String>,

    /// Preferred sample rate
    #[arg(long, default_value = "44100")]
    pub sample_rate: u32,
}

pub async fn run(args: RecordArgs) -> Result<()> {
    let input = match &args.device {
        Some(name) => MicInput::with_device(name.clone()),
        None => MicInput::new(),
    };
    let mut config = CaptureConfig { max_duration: Duration::from_secs(args.max_duration_s), ..Default::default() };
    config.constraints.sample_rate_hz = args.sample_rate;
    let (mut ctl, mut events) = CaptureController::new(input, config);
    ctl.start().context("could not start recording")?;
    eprintln!("Recording... (Ctrl+C to stop)");

    let stderr_is_tty = std::io::stderr().is_terminal();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = events.recv() => match ev {
                Some(CaptureEvent::Tick(secs)) if stderr_is_tty => {
                    eprint!("\r● {}", format_duration(secs));
                    let _ = std::io::stderr().flush();
                }
                Some(CaptureEvent::MaxDurationReached) => {
                    eprintln!("\nmaximum duration of {} reached", format_duration(args.max_duration_s));
                    if args.stop_at_max {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }
    if stderr_is_tty {
        eprintln!();
    }

    let artifact = ctl.stop().await?;
    std::fs::write(&args.output, &artifact.data)
        .with_context(|| format!("could not write {}", args.output.display()))?;
    info!(path = %args.output.display(), bytes = artifact.data.len(), "recording saved");
    eprintln!(
        "Saved {} ({})",
        args.output.display(),
        format_duration(artifact.duration_secs.round() as u64)
    );
    Ok(())
}
