use anyhow::{bail, Result};
use clap::Args;
use coach_client::poller::DEFAULT_POLL_INTERVAL;
use coach_client::{poll_status, ClientError, HttpStatusSource, PollHandler, VoiceCloneStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Voice-clone job id
    pub id: String,

    /// Milliseconds between status queries
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub interval_ms: u64,

    /// Value of the Authorization header sent to the gateway
    #[arg(long, env = "COACH_AUTHORIZATION")]
    pub authorization: Option<String>,
}

struct Reporter {
    done: Option<oneshot::Sender<std::result::Result<VoiceCloneStatus, ClientError>>>,
}

impl PollHandler for Reporter {
    fn on_status_change(&mut self, status: &VoiceCloneStatus) {
        eprintln!("status: {:?}", status.status);
    }

    fn on_ready(&mut self, status: VoiceCloneStatus) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Ok(status));
        }
    }

    fn on_error(&mut self, error: ClientError) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(error));
        }
    }
}

pub async fn run(url: &str, args: StatusArgs) -> Result<()> {
    let mut source = HttpStatusSource::new(url)?;
    if let Some(auth) = args.authorization {
        source = source.with_authorization(auth);
    }
    let (tx, rx) = oneshot::channel();
    let handle = poll_status(
        Arc::new(source),
        args.id,
        Duration::from_millis(args.interval_ms),
        Reporter { done: Some(tx) },
    );

    let result = tokio::select! {
        result = rx => result,
        _ = tokio::signal::ctrl_c() => {
            handle.cancel();
            eprintln!("cancelled");
            return Ok(());
        }
    };
    match result {
        Ok(Ok(status)) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Ok(Err(err)) => bail!("voice clone failed: {err}"),
        Err(_) => bail!("status polling stopped unexpectedly"),
    }
}
