use anyhow::{bail, Result};
use clap::Args;
use coach_client::{
    casing, AnalyzeRequest, ApiError, CancelToken, CompleteEvent, ProgressEvent, StreamClient, StreamHandle,
    StreamHandler, StreamOutcome,
};

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Location of the recording to analyze
    #[arg(long)]
    pub audio_url: String,

    /// quick or deep
    #[arg(long, default_value = "quick")]
    pub mode: String,

    #[arg(long, default_value = "default_male")]
    pub voice_type: String,

    /// Question the speech answers
    #[arg(long)]
    pub question: Option<String>,

    #[arg(long)]
    pub project_id: Option<String>,

    /// Print the result with the gateway's snake_case keys
    #[arg(long)]
    pub wire_keys: bool,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    pub session_id: String,

    /// Print the result with the gateway's snake_case keys
    #[arg(long)]
    pub wire_keys: bool,
}

/// Progress goes to stderr, the final result to stdout as JSON.
struct Printer {
    wire_keys: bool,
}

impl Printer {
    fn render(&self, event: &CompleteEvent) -> serde_json::Result<String> {
        let value = serde_json::to_value(event)?;
        let value = if self.wire_keys { casing::to_server(value) } else { value };
        serde_json::to_string_pretty(&value)
    }
}

impl StreamHandler for Printer {
    fn on_progress(&mut self, event: ProgressEvent) {
        let message = event.message.unwrap_or_default();
        eprintln!("[{:>3.0}%] {:<16} {message}", event.progress, event.step);
    }

    fn on_complete(&mut self, event: CompleteEvent) {
        match self.render(&event) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("could not render result: {err}"),
        }
    }

    fn on_error(&mut self, error: ApiError) {
        eprintln!("analysis failed: {error}");
    }

    fn on_heartbeat(&mut self) {
        tracing::debug!("heartbeat");
    }
}

async fn follow(handle: StreamHandle, token: CancelToken) -> Result<()> {
    let join = handle.join();
    tokio::pin!(join);
    let outcome = tokio::select! {
        outcome = &mut join => outcome,
        _ = tokio::signal::ctrl_c() => {
            token.cancel();
            join.await
        }
    };
    match outcome {
        StreamOutcome::Completed => Ok(()),
        StreamOutcome::Cancelled => {
            eprintln!("cancelled");
            Ok(())
        }
        StreamOutcome::Failed => bail!("stream ended with an error"),
    }
}

pub async fn run(url: &str, args: AnalyzeArgs) -> Result<()> {
    let client = StreamClient::new(url)?;
    let mut request = AnalyzeRequest::new(args.audio_url);
    request.mode = args.mode;
    request.voice_type = args.voice_type;
    request.question = args.question;
    request.project_id = args.project_id;
    let token = CancelToken::new();
    follow(client.analyze_with(&request, Printer { wire_keys: args.wire_keys }, token.clone()), token).await
}

pub async fn watch(url: &str, args: WatchArgs) -> Result<()> {
    let client = StreamClient::new(url)?;
    let token = CancelToken::new();
    follow(client.subscribe_with(&args.session_id, Printer { wire_keys: args.wire_keys }, token.clone()), token).await
}
