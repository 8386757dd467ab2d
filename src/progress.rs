//! Per-job progress events.
//!
//! Every job gets its own channel from [`channel`]; the sending half
//! ([`ProgressReporter`]) is threaded through the pipeline and cloned into
//! each batch worker, the receiving half goes to whatever UI wants to
//! render the job. Nothing is global, so two jobs running side by side can
//! never see each other's events.
//!
//! Emission is fire-and-forget: the channel is unbounded and a dropped
//! receiver is silently ignored, so a slow or absent UI never stalls or fails
//! a transcription. Consumers must not assume a fixed number of events; the
//! only guarantee is that a job's stream ends with [`ProgressStatus::Complete`]
//! or [`ProgressStatus::Error`].
//!
//! # Example
//!
//! ```rust
//! use edgequake_img2md::progress::{self, ProgressStatus, ProgressUpdate};
//!
//! let (reporter, mut rx) = progress::channel("gemini", "gemini-2.0-flash");
//! reporter.emit(ProgressUpdate::new(ProgressStatus::Planning, "Planning 3 batches"));
//! let update = rx.try_recv().unwrap();
//! assert_eq!(update.provider, "gemini");
//! assert_eq!(update.status, ProgressStatus::Planning);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Phase of the pipeline an update describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Validating,
    Planning,
    Processing,
    /// A request is about to leave for the provider.
    Sending,
    /// A provider response (or failure) came back.
    Received,
    Retrying,
    Refining,
    Assembling,
    Writing,
    Complete,
    Error,
}

impl ProgressStatus {
    /// True for the two statuses that end a job's stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Complete | ProgressStatus::Error)
    }
}

/// Outbound request metrics. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Redacted endpoint, e.g. `POST https://host/v1/messages`.
    pub endpoint: String,
    pub image_count: usize,
    /// Encoded payload size (base64 images + prompt).
    pub payload_bytes: usize,
    /// 1-indexed attempt number.
    pub attempt: u32,
}

/// Inbound response metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub response_bytes: usize,
    pub tokens: u64,
    pub error: Option<String>,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub status: ProgressStatus,
    pub provider: String,
    pub model: String,
    pub message: String,
    pub detail: Option<String>,
    /// Overall completion in `0.0..=1.0`.
    pub progress: f32,
    pub current_batch: usize,
    pub total_batches: usize,
    pub tokens_used: u64,
    pub stage: usize,
    pub total_stages: usize,
    pub elapsed_ms: u64,
    pub request_info: Option<RequestInfo>,
    pub response_info: Option<ResponseInfo>,
}

impl ProgressUpdate {
    pub fn new(status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            provider: String::new(),
            model: String::new(),
            message: message.into(),
            detail: None,
            progress: 0.0,
            current_batch: 0,
            total_batches: 0,
            tokens_used: 0,
            stage: 0,
            total_stages: 0,
            elapsed_ms: 0,
            request_info: None,
            response_info: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn progress(mut self, fraction: f32) -> Self {
        self.progress = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn batch(mut self, current: usize, total: usize) -> Self {
        self.current_batch = current;
        self.total_batches = total;
        self
    }

    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn stage(mut self, stage: usize, total: usize) -> Self {
        self.stage = stage;
        self.total_stages = total;
        self
    }

    pub fn request(mut self, info: RequestInfo) -> Self {
        self.request_info = Some(info);
        self
    }

    pub fn response(mut self, info: ResponseInfo) -> Self {
        self.response_info = Some(info);
        self
    }
}

/// Receiving half of a job's progress channel.
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressUpdate>;

/// Sending half of a job's progress channel.
///
/// Cheap to clone; every clone stamps the same provider/model names and
/// measures elapsed time from the same job start.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    provider: Arc<str>,
    model: Arc<str>,
    started: Instant,
}

/// Create a progress channel for one job.
pub fn channel(
    provider: impl AsRef<str>,
    model: impl AsRef<str>,
) -> (ProgressReporter, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = ProgressReporter {
        tx: Some(tx),
        provider: Arc::from(provider.as_ref()),
        model: Arc::from(model.as_ref()),
        started: Instant::now(),
    };
    (reporter, rx)
}

impl ProgressReporter {
    /// A reporter that drops every event.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            provider: Arc::from(""),
            model: Arc::from(""),
            started: Instant::now(),
        }
    }

    /// Send an update, filling in provider, model and elapsed time.
    pub fn emit(&self, mut update: ProgressUpdate) {
        let Some(tx) = &self.tx else { return };
        if update.provider.is_empty() {
            update.provider = self.provider.to_string();
        }
        if update.model.is_empty() {
            update.model = self.model.to_string();
        }
        update.elapsed_ms = self.started.elapsed().as_millis() as u64;
        // A closed receiver just means nobody is watching.
        let _ = tx.send(update);
    }

    /// Same channel, with provider/model labels filled in where still blank.
    pub fn with_labels(&self, provider: &str, model: &str) -> Self {
        let mut labelled = self.clone();
        if labelled.provider.is_empty() {
            labelled.provider = Arc::from(provider);
        }
        if labelled.model.is_empty() {
            labelled.model = Arc::from(model);
        }
        labelled
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_reporter_does_not_panic() {
        let reporter = ProgressReporter::disabled();
        assert!(!reporter.is_enabled());
        reporter.emit(ProgressUpdate::new(ProgressStatus::Complete, "done"));
    }

    #[test]
    fn emit_stamps_provider_and_model() {
        let (reporter, mut rx) = channel("local", "llava");
        reporter.emit(
            ProgressUpdate::new(ProgressStatus::Processing, "batch")
                .batch(2, 5)
                .progress(1.7),
        );
        let update = rx.try_recv().unwrap();
        assert_eq!(update.provider, "local");
        assert_eq!(update.model, "llava");
        assert_eq!(update.current_batch, 2);
        assert_eq!(update.total_batches, 5);
        assert_eq!(update.progress, 1.0, "progress must be clamped");
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (reporter, rx) = channel("gemini", "gemini-2.0-flash");
        drop(rx);
        assert!(!reporter.is_enabled());
        reporter.emit(ProgressUpdate::new(ProgressStatus::Error, "boom"));
    }

    #[test]
    fn separate_jobs_do_not_share_events() {
        let (a, mut rx_a) = channel("gemini", "m");
        let (b, mut rx_b) = channel("local", "m");
        a.emit(ProgressUpdate::new(ProgressStatus::Planning, "a"));
        b.emit(ProgressUpdate::new(ProgressStatus::Planning, "b"));
        assert_eq!(rx_a.try_recv().unwrap().message, "a");
        assert_eq!(rx_b.try_recv().unwrap().message, "b");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn labels_fill_only_blanks() {
        let (reporter, mut rx) = channel("", "");
        let labelled = reporter.with_labels("enterprise", "claude");
        labelled.emit(ProgressUpdate::new(ProgressStatus::Validating, "v"));
        let update = rx.try_recv().unwrap();
        assert_eq!((update.provider.as_str(), update.model.as_str()), ("enterprise", "claude"));

        let (fixed, _rx) = channel("gemini", "flash");
        let kept = fixed.with_labels("other", "other");
        assert_eq!(&*kept.provider, "gemini");
    }

    #[test]
    fn terminal_statuses() {
        assert!(ProgressStatus::Complete.is_terminal());
        assert!(ProgressStatus::Error.is_terminal());
        assert!(!ProgressStatus::Received.is_terminal());
    }
}
