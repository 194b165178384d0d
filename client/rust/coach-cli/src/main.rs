use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod analyze;
mod record;
mod voice_clone;

#[derive(Parser, Debug)]
#[command(author, version, about = "Speech coach gateway CLI")]
struct Cli {
    /// Base URL of the gateway
    #[arg(long, env = "COACH_GATEWAY_URL", default_value = "http://localhost:3000", global = true)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record the microphone into a WAV file
    Record(record::RecordArgs),
    /// Start an analysis and follow its progress
    Analyze(analyze::AnalyzeArgs),
    /// Follow the event stream of an existing session
    Watch(analyze::WatchArgs),
    /// Wait for a voice-clone job to finish
    VoiceCloneStatus(voice_clone::StatusArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record(args) => record::run(args).await?,
        Commands::Analyze(args) => analyze::run(&cli.url, args).await?,
        Commands::Watch(args) => analyze::watch(&cli.url, args).await?,
        Commands::VoiceCloneStatus(args) => voice_clone::run(&cli.url, args).await?,
    }

    Ok(())
}
