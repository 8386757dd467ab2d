//! Streaming API: run a job in the background and watch its progress.
//!
//! [`transcribe_stream`] spawns the job on the current tokio runtime and
//! hands back a [`TranscriptionHandle`]: a `Stream` of [`ProgressUpdate`]s
//! plus the task's `JoinHandle`. The stream ends once the job is over; its
//! last item is the `Complete` or `Error` event.
//!
//! ```rust,no_run
//! use edgequake_img2md::{transcribe_stream, TranscriptionConfig, TranscriptionRequest};
//! use tokio_stream::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let request = TranscriptionRequest::new(vec!["scan/001.png".into()], "out");
//! let mut handle = transcribe_stream(request, TranscriptionConfig::default(), CancellationToken::new());
//! while let Some(update) = handle.updates.next().await {
//!     eprintln!("{:?}: {}", update.status, update.message);
//! }
//! let output = handle.join().await?;
//! println!("{} documents", output.documents.len());
//! # Ok(())
//! # }
//! ```

use crate::config::TranscriptionConfig;
use crate::error::Img2MdError;
use crate::output::TranscriptionOutput;
use crate::progress::{self, ProgressUpdate};
use crate::transcribe::{transcribe, TranscriptionRequest};
use std::pin::Pin;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// A boxed stream of progress updates.
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressUpdate> + Send>>;

/// A running transcription job.
pub struct TranscriptionHandle {
    /// Progress events, in emission order.
    pub updates: ProgressStream,
    /// The job itself.
    pub task: JoinHandle<Result<TranscriptionOutput, Img2MdError>>,
    cancel: CancellationToken,
}

impl TranscriptionHandle {
    /// Request cancellation. The job ends with [`Img2MdError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job's result.
    pub async fn join(self) -> Result<TranscriptionOutput, Img2MdError> {
        self.task
            .await
            .map_err(|e| Img2MdError::Internal(format!("transcription task failed: {e}")))?
    }
}

/// Spawn a transcription job and stream its progress.
///
/// Must be called from within a tokio runtime.
pub fn transcribe_stream(
    request: TranscriptionRequest,
    config: TranscriptionConfig,
    cancel: CancellationToken,
) -> TranscriptionHandle {
    let (reporter, rx) = progress::channel("", "");
    let job_cancel = cancel.clone();
    let task = tokio::spawn(async move { transcribe(&request, &config, reporter, job_cancel).await });

    TranscriptionHandle {
        updates: Box::pin(UnboundedReceiverStream::new(rx)),
        task,
        cancel,
    }
}
