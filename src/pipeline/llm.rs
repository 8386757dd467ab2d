//! Provider calls: encode a batch, call the model with retry/backoff, parse.
//!
//! [`submit_batch`] is the adapter boundary the executor talks to: batch in,
//! `(pages, tokens)` out. Everything provider-specific sits behind
//! [`VisionProvider::complete`]; this module adds what every backend shares.
//!
//! ## Retry Strategy
//!
//! Retryable failures (network, timeouts, 408/429/5xx, provider error
//! payloads) wait a fixed step from [`RetryPolicy`] (2 s → 4 s → 8 s → 16 s
//! by default, the last step repeating) before trying again. A 429 with a
//! `Retry-After` header waits at least that long. Cancellation is raced
//! against both the backoff sleep and the request itself, so a cancelled job
//! never sits out a backoff.
//!
//! ## Progress
//!
//! Every attempt emits one `Sending` event before the call and one
//! `Received` event after it, success or failure.

use crate::config::TranscriptionConfig;
use crate::error::Img2MdError;
use crate::output::PageContent;
use crate::pipeline::plan::Batch;
use crate::pipeline::{encode, parse};
use crate::progress::{ProgressReporter, ProgressStatus, ProgressUpdate, RequestInfo, ResponseInfo};
use crate::prompts::{vision_prompt, PromptOptions};
use crate::provider::{Completion, ProviderRequest, VisionProvider};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a server-requested `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Retry ceiling plus fixed backoff steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub steps: Vec<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            steps: config.retry_backoff.clone(),
        }
    }

    /// Wait before the 1-indexed `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) as usize - 1).min(self.steps.len().saturating_sub(1));
        self.steps.get(idx).copied().unwrap_or_default()
    }

    fn delay_for(&self, retry: u32, err: &Img2MdError) -> Duration {
        let base = self.delay(retry);
        match err {
            Img2MdError::RateLimitExceeded {
                retry_after_secs: Some(secs),
                ..
            } => base.max(Duration::from_secs(*secs).min(MAX_RETRY_AFTER)),
            _ => base,
        }
    }
}

/// Everything a provider call needs besides the batch itself.
///
/// Built once per job and shared (behind an `Arc`) by all batch workers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Vision model for this job.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
    pub prompt: PromptOptions,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
    /// Number of batches in the job, for progress events.
    pub total_batches: usize,
}

/// Pages and token usage produced by one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutput {
    pub pages: Vec<PageContent>,
    pub tokens: u64,
}

/// Run one batch through the provider and parse the result.
pub async fn submit_batch(
    provider: &dyn VisionProvider,
    batch: &Batch,
    ctx: &RequestContext,
) -> Result<BatchOutput, Img2MdError> {
    if ctx.cancel.is_cancelled() {
        return Err(Img2MdError::Cancelled);
    }

    let images = encode::encode_batch(batch, provider.image_policy()).await?;
    let request = ProviderRequest {
        model: ctx.model.clone(),
        prompt: vision_prompt(&ctx.prompt, batch.len()),
        images,
        temperature: ctx.temperature,
        max_tokens: ctx.max_tokens,
        json_output: true,
    };

    let completion = complete_with_retry(provider, &request, ctx, batch.index + 1).await?;
    let pages = parse::parse_pages(&completion.text, &batch.images);

    let (first, last) = batch.page_range();
    debug!(
        "Batch {}/{}: pages {}..={} → {} page(s), {} tokens",
        batch.index + 1,
        ctx.total_batches,
        first,
        last,
        pages.len(),
        completion.tokens
    );

    Ok(BatchOutput {
        pages,
        tokens: completion.tokens,
    })
}

/// Call the provider, retrying retryable failures with fixed backoff steps.
///
/// `batch_number` is 1-indexed and only used for progress/log labels
/// (0 for requests outside a batch, e.g. refinement).
pub async fn complete_with_retry(
    provider: &dyn VisionProvider,
    request: &ProviderRequest,
    ctx: &RequestContext,
    batch_number: usize,
) -> Result<Completion, Img2MdError> {
    let endpoint = provider.endpoint(&request.model);
    let mut last_err: Option<Img2MdError> = None;

    for attempt in 0..=ctx.retry.max_retries {
        if let Some(err) = &last_err {
            let wait = ctx.retry.delay_for(attempt, err);
            warn!(
                "Batch {}: retry {}/{} after {:?}: {}",
                batch_number, attempt, ctx.retry.max_retries, wait, err
            );
            ctx.progress.emit(
                ProgressUpdate::new(
                    ProgressStatus::Retrying,
                    format!("Retrying in {}s", wait.as_secs()),
                )
                .detail(err.to_string())
                .batch(batch_number, ctx.total_batches),
            );
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(Img2MdError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(Img2MdError::Cancelled);
        }

        ctx.progress.emit(
            ProgressUpdate::new(
                ProgressStatus::Sending,
                format!("Sending {} image(s) to {}", request.images.len(), provider.name()),
            )
            .batch(batch_number, ctx.total_batches)
            .request(RequestInfo {
                endpoint: endpoint.clone(),
                image_count: request.images.len(),
                payload_bytes: request.payload_bytes(),
                attempt: attempt + 1,
            }),
        );

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Img2MdError::Cancelled),
            r = provider.complete(request) => r,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        ctx.progress.emit(received_event(&result, latency_ms, batch_number, ctx.total_batches));

        match result {
            Ok(completion) => return Ok(completion),
            Err(e) if e.is_cancelled() || !e.is_retryable() => return Err(e),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| Img2MdError::Internal("retry loop ended without a result".into())))
}

fn received_event(
    result: &Result<Completion, Img2MdError>,
    latency_ms: u64,
    batch_number: usize,
    total_batches: usize,
) -> ProgressUpdate {
    let (message, info) = match result {
        Ok(c) => (
            format!("Received {} bytes in {latency_ms}ms", c.response_bytes),
            ResponseInfo {
                status_code: Some(c.status_code),
                latency_ms,
                response_bytes: c.response_bytes,
                tokens: c.tokens,
                error: None,
            },
        ),
        Err(e) => (
            format!("Request failed after {latency_ms}ms"),
            ResponseInfo {
                status_code: match e {
                    Img2MdError::ApiStatus { status, .. } => Some(*status),
                    Img2MdError::RateLimitExceeded { .. } => Some(429),
                    _ => None,
                },
                latency_ms,
                response_bytes: 0,
                tokens: 0,
                error: Some(e.to_string()),
            },
        ),
    };
    ProgressUpdate::new(ProgressStatus::Received, message)
        .batch(batch_number, total_batches)
        .response(info)
}
