//! Job entry points: validate → execute → refine → assemble.
//!
//! [`transcribe`] returns the documents in memory; [`transcribe_to_dir`]
//! also writes them to the request's output directory. Both report through
//! the [`ProgressReporter`] they are given and finish its stream with exactly
//! one `Complete` or `Error` event. Use [`crate::stream::transcribe_stream`]
//! to get the events as a `Stream` from a spawned job instead.

use crate::config::TranscriptionConfig;
use crate::error::Img2MdError;
use crate::output::{write_documents, TranscriptionOutput};
use crate::pipeline::assemble::{assemble, AssembleOptions, OutputMode};
use crate::pipeline::execute::{execute, ExecutorSettings};
use crate::pipeline::input::validate_images;
use crate::pipeline::llm::{RequestContext, RetryPolicy};
use crate::pipeline::refine::refine_pages;
use crate::progress::{ProgressReporter, ProgressStatus, ProgressUpdate};
use crate::prompts::PromptOptions;
use crate::provider::{create_provider, VisionProvider};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to transcribe and how to lay out the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    /// Page images in reading order. Position *i* becomes page *i + 1*.
    pub images: Vec<PathBuf>,
    /// Directory for [`transcribe_to_dir`]. Ignored by [`transcribe`].
    pub output_dir: PathBuf,
    /// Vision model override. Default: the provider's model.
    #[serde(default)]
    pub model: Option<String>,
    /// Output language hint.
    #[serde(default)]
    pub language: Option<String>,
    /// One document per detected chapter. Wins over `combine_pages`.
    #[serde(default)]
    pub detect_chapters: bool,
    /// One document for all pages.
    #[serde(default)]
    pub combine_pages: bool,
    #[serde(default)]
    pub preserve_formatting: bool,
    #[serde(default)]
    pub include_image_descriptions: bool,
    /// Temperature override. Default: [`TranscriptionConfig::temperature`].
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl TranscriptionRequest {
    pub fn new(images: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            images,
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from_flags(self.detect_chapters, self.combine_pages)
    }

    fn prompt_options(&self) -> PromptOptions {
        PromptOptions {
            language: self.language.clone(),
            preserve_formatting: self.preserve_formatting,
            include_image_descriptions: self.include_image_descriptions,
        }
    }
}

/// Pick the provider for a job.
///
/// Priority: a pre-built `config.provider`, then `config.provider_config`,
/// then auto-detection from the environment.
pub fn resolve_provider(config: &TranscriptionConfig) -> Result<Arc<dyn VisionProvider>, Img2MdError> {
    if let Some(provider) = &config.provider {
        return Ok(Arc::clone(provider));
    }
    if let Some(cfg) = &config.provider_config {
        return create_provider(cfg);
    }
    let cfg = crate::config::ProviderConfig::from_env()?;
    info!("Auto-detected {} provider from environment", cfg.kind);
    create_provider(&cfg)
}

/// Transcribe the request's images into Markdown documents.
///
/// # Errors
/// Validation errors, a failed batch ([`Img2MdError::BatchFailed`]) or
/// [`Img2MdError::Cancelled`]. A failed refinement pass is not an error.
pub async fn transcribe(
    request: &TranscriptionRequest,
    config: &TranscriptionConfig,
    progress: ProgressReporter,
    cancel: CancellationToken,
) -> Result<TranscriptionOutput, Img2MdError> {
    run_reported(request, config, progress, cancel, false)
        .await
        .map(|(output, _)| output)
}

/// Like [`transcribe`], then write every document into
/// `request.output_dir`. Returns the output and the written paths.
pub async fn transcribe_to_dir(
    request: &TranscriptionRequest,
    config: &TranscriptionConfig,
    progress: ProgressReporter,
    cancel: CancellationToken,
) -> Result<(TranscriptionOutput, Vec<PathBuf>), Img2MdError> {
    run_reported(request, config, progress, cancel, true).await
}

/// Synchronous wrapper around [`transcribe`].
///
/// Creates a temporary tokio runtime internally; must not be called from
/// inside an async context.
pub fn transcribe_sync(
    request: &TranscriptionRequest,
    config: &TranscriptionConfig,
) -> Result<TranscriptionOutput, Img2MdError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Img2MdError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(transcribe(
            request,
            config,
            ProgressReporter::disabled(),
            CancellationToken::new(),
        ))
}

/// Resolve the provider, label the reporter, run the job and emit the
/// terminal event.
async fn run_reported(
    request: &TranscriptionRequest,
    config: &TranscriptionConfig,
    progress: ProgressReporter,
    cancel: CancellationToken,
    write: bool,
) -> Result<(TranscriptionOutput, Vec<PathBuf>), Img2MdError> {
    let provider = match resolve_provider(config) {
        Ok(p) => p,
        Err(e) => return finish(&progress, Err(e)),
    };
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| provider.model().to_string());
    let progress = progress.with_labels(provider.name(), &model);
    let result = run_job(request, config, provider, model, &progress, &cancel, write).await;
    finish(&progress, result)
}

/// Emit the terminal progress event for `result`.
fn finish<T>(
    progress: &ProgressReporter,
    result: Result<(TranscriptionOutput, T), Img2MdError>,
) -> Result<(TranscriptionOutput, T), Img2MdError> {
    match &result {
        Ok((output, _)) => progress.emit(
            ProgressUpdate::new(
                ProgressStatus::Complete,
                format!(
                    "Transcribed {} page(s) into {} document(s)",
                    output.total_pages,
                    output.documents.len()
                ),
            )
            .progress(1.0)
            .tokens(output.tokens_used),
        ),
        Err(e) => {
            if e.is_cancelled() {
                info!("Transcription cancelled");
            } else {
                warn!("Transcription failed: {}", e);
            }
            progress.emit(
                ProgressUpdate::new(ProgressStatus::Error, e.to_string())
                    .detail(format!("{:?}", e.kind())),
            );
        }
    }
    result
}

async fn run_job(
    request: &TranscriptionRequest,
    config: &TranscriptionConfig,
    provider: Arc<dyn VisionProvider>,
    model: String,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
    write: bool,
) -> Result<(TranscriptionOutput, Vec<PathBuf>), Img2MdError> {
    let started = Instant::now();
    let total_stages = if config.text_model.is_some() { 4 } else { 3 };

    // ── Stage 1: validate ────────────────────────────────────────────────
    progress.emit(
        ProgressUpdate::new(
            ProgressStatus::Validating,
            format!("Validating {} image(s)", request.images.len()),
        )
        .stage(1, total_stages),
    );
    let images = validate_images(&request.images, &config.validation_limits)?;
    info!(
        "Transcribing {} image(s) with {} ({})",
        images.len(),
        provider.name(),
        model
    );
    if cancel.is_cancelled() {
        return Err(Img2MdError::Cancelled);
    }

    // ── Stage 2: plan + execute ──────────────────────────────────────────
    let ctx = RequestContext {
        model,
        temperature: request.temperature.unwrap_or(config.temperature),
        max_tokens: config.max_tokens,
        retry: RetryPolicy::from_config(config),
        prompt: request.prompt_options(),
        progress: progress.clone(),
        cancel: cancel.clone(),
        total_batches: 0,
    };
    let mut settings = ExecutorSettings::from_config(config);
    settings.stage = 2;
    settings.total_stages = total_stages;

    let executed = execute(Arc::clone(&provider), &images, ctx.clone(), &settings).await?;
    if executed.pages.len() != images.len() {
        // Only the raw-text fallback collapses a batch into one page.
        warn!(
            "{} image(s) produced {} page(s); unstructured replies were kept as raw text",
            images.len(),
            executed.pages.len()
        );
    }
    let mut pages = executed.pages;
    let mut tokens = executed.tokens;

    // ── Stage 3: refine (optional) ───────────────────────────────────────
    if let Some(text_model) = &config.text_model {
        progress.emit(
            ProgressUpdate::new(
                ProgressStatus::Refining,
                format!("Refining {} page(s) with {}", pages.len(), text_model),
            )
            .stage(3, total_stages)
            .tokens(tokens),
        );
        let refine_ctx = RequestContext {
            model: text_model.clone(),
            ..ctx
        };
        let refined = refine_pages(provider.as_ref(), pages, &refine_ctx).await?;
        debug!("Refinement applied: {}", refined.applied);
        pages = refined.pages;
        tokens += refined.tokens;
    }

    // ── Stage 4: assemble ────────────────────────────────────────────────
    if cancel.is_cancelled() {
        return Err(Img2MdError::Cancelled);
    }
    progress.emit(
        ProgressUpdate::new(ProgressStatus::Assembling, "Assembling documents")
            .stage(total_stages, total_stages)
            .tokens(tokens),
    );
    let documents = assemble(
        &pages,
        AssembleOptions {
            mode: request.output_mode(),
            include_image_descriptions: request.include_image_descriptions,
        },
    );

    let written = if write {
        progress.emit(
            ProgressUpdate::new(
                ProgressStatus::Writing,
                format!("Writing {} document(s)", documents.len()),
            )
            .detail(request.output_dir.display().to_string()),
        );
        write_documents(&documents, &request.output_dir).await?
    } else {
        Vec::new()
    };

    let output = TranscriptionOutput {
        total_pages: pages.len(),
        documents,
        processing_time: started.elapsed(),
        tokens_used: tokens,
    };
    info!(
        "Transcription complete: {} page(s), {} document(s), {} tokens in {:.1}s",
        output.total_pages,
        output.documents.len(),
        output.tokens_used,
        output.processing_time.as_secs_f64()
    );
    Ok((output, written))
}
