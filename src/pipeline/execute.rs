//! Batch execution: run planned batches through the provider and merge the
//! pages back into one page-ordered sequence.
//!
//! ```text
//! Idle → Planning → Dispatching ─┬─ Sequential ─┬─ Merging → Done
//!                                └─ Parallel  ──┘          ↘ Failed
//! ```
//!
//! Small jobs (≤ `sequential_threshold` batches) run one batch after another.
//! Larger ones go through a `JoinSet` whose workers share a `Semaphore`, so at
//! most `concurrency` provider calls are in flight. Each worker returns
//! `(position, result)`; the merge step slots results by position, which
//! makes the output order independent of which worker finishes first.
//!
//! The first failing batch fails the job: the remaining workers are cancelled
//! and awaited, and no partial result is returned. Cancelling the caller's
//! token stops dispatch, aborts in-flight calls and yields
//! [`Img2MdError::Cancelled`].

use crate::config::{BatchLimits, TranscriptionConfig};
use crate::error::Img2MdError;
use crate::output::PageContent;
use crate::pipeline::input::ImageDescriptor;
use crate::pipeline::llm::{submit_batch, BatchOutput, RequestContext};
use crate::pipeline::plan::{plan_for, Batch};
use crate::progress::{ProgressStatus, ProgressUpdate};
use crate::provider::VisionProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Executor state, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Idle,
    Planning,
    Dispatching,
    Sequential,
    Parallel,
    Merging,
    Done,
    Failed,
}

/// Tracks the current [`ExecutionPhase`].
#[derive(Debug)]
struct PhaseTracker(ExecutionPhase);

impl PhaseTracker {
    fn new() -> Self {
        Self(ExecutionPhase::Idle)
    }

    fn enter(&mut self, next: ExecutionPhase) {
        debug!("executor: {:?} → {:?}", self.0, next);
        self.0 = next;
    }

    /// Enter `Done` or `Failed` according to `result`.
    fn finish<T>(&mut self, result: Result<T, Img2MdError>) -> Result<T, Img2MdError> {
        self.enter(if result.is_ok() {
            ExecutionPhase::Done
        } else {
            ExecutionPhase::Failed
        });
        result
    }
}

/// Scheduling knobs for one job.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub concurrency: usize,
    pub sequential_threshold: usize,
    pub inter_batch_delay: Duration,
    pub batch_limits: BatchLimits,
    /// Stage label for progress events (1-indexed).
    pub stage: usize,
    pub total_stages: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            sequential_threshold: config.sequential_threshold,
            inter_batch_delay: Duration::from_millis(config.inter_batch_delay_ms),
            batch_limits: config.batch_limits,
            stage: 1,
            total_stages: 1,
        }
    }
}

/// Merged, page-ordered output of all batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub pages: Vec<PageContent>,
    pub tokens: u64,
    pub batches: usize,
}

/// Plan `images` for `provider` and execute the batches.
#[instrument(skip_all, fields(provider = provider.name(), images = images.len()))]
pub async fn execute(
    provider: Arc<dyn VisionProvider>,
    images: &[ImageDescriptor],
    mut ctx: RequestContext,
    settings: &ExecutorSettings,
) -> Result<ExecutionOutput, Img2MdError> {
    let mut phase = PhaseTracker::new();
    phase.enter(ExecutionPhase::Planning);

    if ctx.cancel.is_cancelled() {
        return phase.finish(Err(Img2MdError::Cancelled));
    }

    let batches = plan_for(provider.is_resource_constrained(), images, &settings.batch_limits);
    ctx.total_batches = batches.len();
    info!(
        "Planned {} batch(es) for {} image(s){}",
        batches.len(),
        images.len(),
        if provider.is_resource_constrained() {
            " (one image per batch)"
        } else {
            ""
        }
    );
    ctx.progress.emit(
        ProgressUpdate::new(
            ProgressStatus::Planning,
            format!("Planned {} batch(es) for {} image(s)", batches.len(), images.len()),
        )
        .batch(0, batches.len())
        .stage(settings.stage, settings.total_stages),
    );

    let result = run_batches(&mut phase, provider, batches, Arc::new(ctx), settings).await;
    phase.finish(result)
}

/// Execute already planned batches.
///
/// `batches` must be in page order; the merged output follows their order.
#[instrument(skip_all, fields(batches = batches.len()))]
pub async fn execute_batches(
    provider: Arc<dyn VisionProvider>,
    batches: Vec<Batch>,
    ctx: Arc<RequestContext>,
    settings: &ExecutorSettings,
) -> Result<ExecutionOutput, Img2MdError> {
    let mut phase = PhaseTracker::new();
    let result = run_batches(&mut phase, provider, batches, ctx, settings).await;
    phase.finish(result)
}

async fn run_batches(
    phase: &mut PhaseTracker,
    provider: Arc<dyn VisionProvider>,
    batches: Vec<Batch>,
    ctx: Arc<RequestContext>,
    settings: &ExecutorSettings,
) -> Result<ExecutionOutput, Img2MdError> {
    phase.enter(ExecutionPhase::Dispatching);
    if ctx.cancel.is_cancelled() {
        return Err(Img2MdError::Cancelled);
    }
    if batches.is_empty() {
        phase.enter(ExecutionPhase::Merging);
        return Ok(ExecutionOutput::default());
    }

    let total = batches.len();
    let outputs = if total <= settings.sequential_threshold {
        phase.enter(ExecutionPhase::Sequential);
        run_sequential(provider, &batches, &ctx, settings).await?
    } else {
        phase.enter(ExecutionPhase::Parallel);
        run_parallel(provider, batches, &ctx, settings).await?
    };

    phase.enter(ExecutionPhase::Merging);
    if ctx.cancel.is_cancelled() {
        return Err(Img2MdError::Cancelled);
    }
    Ok(merge(outputs))
}

/// Concatenate batch outputs in batch order.
fn merge(outputs: Vec<BatchOutput>) -> ExecutionOutput {
    let batches = outputs.len();
    let tokens = outputs.iter().map(|o| o.tokens).sum();
    let pages = outputs.into_iter().flat_map(|o| o.pages).collect();
    ExecutionOutput {
        pages,
        tokens,
        batches,
    }
}

fn batch_error(position: usize, total: usize, err: Img2MdError) -> Img2MdError {
    if err.is_cancelled() {
        Img2MdError::Cancelled
    } else {
        Img2MdError::BatchFailed {
            batch: position + 1,
            total,
            source: Box::new(err),
        }
    }
}

fn emit_batch_done(
    ctx: &RequestContext,
    settings: &ExecutorSettings,
    completed: usize,
    total: usize,
    tokens: u64,
) {
    ctx.progress.emit(
        ProgressUpdate::new(
            ProgressStatus::Processing,
            format!("Completed batch {completed}/{total}"),
        )
        .batch(completed, total)
        .progress(completed as f32 / total as f32)
        .tokens(tokens)
        .stage(settings.stage, settings.total_stages),
    );
}

async fn run_sequential(
    provider: Arc<dyn VisionProvider>,
    batches: &[Batch],
    ctx: &RequestContext,
    settings: &ExecutorSettings,
) -> Result<Vec<BatchOutput>, Img2MdError> {
    let total = batches.len();
    let mut outputs = Vec::with_capacity(total);
    let mut tokens = 0u64;

    for (position, batch) in batches.iter().enumerate() {
        if position > 0 && !settings.inter_batch_delay.is_zero() {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(Img2MdError::Cancelled),
                _ = tokio::time::sleep(settings.inter_batch_delay) => {}
            }
        }
        if ctx.cancel.is_cancelled() {
            return Err(Img2MdError::Cancelled);
        }

        let out = submit_batch(provider.as_ref(), batch, ctx)
            .await
            .map_err(|e| batch_error(position, total, e))?;
        tokens += out.tokens;
        outputs.push(out);
        emit_batch_done(ctx, settings, position + 1, total, tokens);
    }

    Ok(outputs)
}

async fn run_parallel(
    provider: Arc<dyn VisionProvider>,
    batches: Vec<Batch>,
    ctx: &Arc<RequestContext>,
    settings: &ExecutorSettings,
) -> Result<Vec<BatchOutput>, Img2MdError> {
    let total = batches.len();
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    // Cancelled by the caller, or by us on the first batch failure.
    let workers_cancel = ctx.cancel.child_token();
    let mut set: JoinSet<(usize, Result<BatchOutput, Img2MdError>)> = JoinSet::new();

    debug!("Dispatching {} batches over {} worker slot(s)", total, settings.concurrency);
    for (position, batch) in batches.into_iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let provider = Arc::clone(&provider);
        let semaphore = Arc::clone(&semaphore);
        let ctx = Arc::clone(ctx);
        let cancel = workers_cancel.clone();

        set.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (position, Err(Img2MdError::Cancelled)),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return (position, Err(Img2MdError::Internal("worker pool closed".into()))),
                },
            };
            if cancel.is_cancelled() {
                return (position, Err(Img2MdError::Cancelled));
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Img2MdError::Cancelled),
                r = submit_batch(provider.as_ref(), &batch, &ctx) => r,
            };
            (position, result)
        });
    }

    let mut slots: Vec<Option<BatchOutput>> = (0..total).map(|_| None).collect();
    let mut completed = 0usize;
    let mut tokens = 0u64;

    loop {
        let joined = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                workers_cancel.cancel();
                set.shutdown().await;
                return Err(Img2MdError::Cancelled);
            }
            joined = set.join_next() => joined,
        };
        let Some(joined) = joined else { break };

        match joined {
            Ok((position, Ok(out))) => {
                completed += 1;
                tokens += out.tokens;
                slots[position] = Some(out);
                emit_batch_done(ctx, settings, completed, total, tokens);
            }
            Ok((position, Err(err))) => {
                workers_cancel.cancel();
                set.shutdown().await;
                if ctx.cancel.is_cancelled() {
                    return Err(Img2MdError::Cancelled);
                }
                warn!("Batch {}/{} failed, aborting job: {}", position + 1, total, err);
                return Err(batch_error(position, total, err));
            }
            Err(join_err) => {
                workers_cancel.cancel();
                set.shutdown().await;
                return Err(Img2MdError::Internal(format!("batch worker failed: {join_err}")));
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(Img2MdError::Cancelled);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(position, slot)| {
            slot.ok_or_else(|| {
                Img2MdError::Internal(format!("batch {} produced no result", position + 1))
            })
        })
        .collect()
}
