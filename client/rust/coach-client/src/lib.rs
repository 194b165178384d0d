//! Client side of the speech coach gateway.
//!
//! - [`stream`]: consumes analysis event streams.
//! - [`poller`]: waits for voice-clone jobs to settle.
//! - [`capture`]: records the microphone into a WAV artifact.

pub mod audio;
pub mod capture;
pub mod casing;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod stream;

pub use capture::{CaptureArtifact, CaptureConfig, CaptureController, CaptureEvent, CaptureState};
pub use error::{ApiError, ClientError, Result};
pub use poller::{poll_status, HttpStatusSource, PollHandle, PollHandler, VoiceCloneStatus};
pub use protocol::{CompleteEvent, ProgressEvent, StreamEvent};
pub use stream::{AnalyzeRequest, CancelToken, StreamClient, StreamHandle, StreamHandler, StreamOutcome};
