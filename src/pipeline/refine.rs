//! Optional second pass: one text-only request that cleans up OCR artefacts
//! across all transcribed pages.
//!
//! Refinement never fails a job. Any error, an unparseable reply or a reply
//! with the wrong number of pages logs a warning and keeps the unrefined
//! pages. Only cancellation propagates.

use crate::error::Img2MdError;
use crate::output::PageContent;
use crate::pipeline::llm::{complete_with_retry, RequestContext};
use crate::pipeline::parse::{decode_pages, strip_code_fence};
use crate::progress::{ProgressStatus, ProgressUpdate};
use crate::prompts::refinement_prompt;
use crate::provider::{ProviderRequest, VisionProvider};
use tracing::{info, instrument, warn};

/// Result of the refinement pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementOutcome {
    pub pages: Vec<PageContent>,
    pub tokens: u64,
    /// `false` when the original pages were kept.
    pub applied: bool,
}

impl RefinementOutcome {
    fn unchanged(pages: Vec<PageContent>, tokens: u64) -> Self {
        Self {
            pages,
            tokens,
            applied: false,
        }
    }
}

/// Refine `pages` with `ctx.model` (the text model for this job).
#[instrument(skip_all, fields(pages = pages.len()))]
pub async fn refine_pages(
    provider: &dyn VisionProvider,
    pages: Vec<PageContent>,
    ctx: &RequestContext,
) -> Result<RefinementOutcome, Img2MdError> {
    if pages.is_empty() {
        return Ok(RefinementOutcome::unchanged(pages, 0));
    }
    if ctx.cancel.is_cancelled() {
        return Err(Img2MdError::Cancelled);
    }

    let request = ProviderRequest {
        model: ctx.model.clone(),
        prompt: refinement_prompt(&pages, &ctx.prompt),
        images: Vec::new(),
        temperature: ctx.temperature,
        max_tokens: ctx.max_tokens,
        json_output: true,
    };

    let completion = match complete_with_retry(provider, &request, ctx, 0).await {
        Ok(c) => c,
        Err(e) if e.is_cancelled() => return Err(Img2MdError::Cancelled),
        Err(e) => {
            skipped(ctx, format!("refinement request failed: {e}"));
            return Ok(RefinementOutcome::unchanged(pages, 0));
        }
    };

    let Some(refined) = decode_pages(strip_code_fence(&completion.text)) else {
        skipped(ctx, "refinement reply is not structured JSON".to_string());
        return Ok(RefinementOutcome::unchanged(pages, completion.tokens));
    };

    if refined.len() != pages.len() {
        skipped(
            ctx,
            format!(
                "refinement returned {} page(s) for {} input page(s)",
                refined.len(),
                pages.len()
            ),
        );
        return Ok(RefinementOutcome::unchanged(pages, completion.tokens));
    }

    let merged = pages
        .into_iter()
        .zip(refined)
        .map(|(original, refined)| reattach(original, refined))
        .collect();

    info!("Refinement applied ({} tokens)", completion.tokens);
    Ok(RefinementOutcome {
        pages: merged,
        tokens: completion.tokens,
        applied: true,
    })
}

/// Keep the original page number, and the original image descriptions when
/// the refined page dropped them.
fn reattach(original: PageContent, mut refined: PageContent) -> PageContent {
    refined.page_number = original.page_number;
    if refined.images.is_empty() {
        refined.images = original.images;
    }
    if refined.text.trim().is_empty() {
        refined.text = original.text;
    }
    refined
}

fn skipped(ctx: &RequestContext, reason: String) {
    warn!("Keeping unrefined pages: {}", reason);
    ctx.progress.emit(
        ProgressUpdate::new(ProgressStatus::Refining, "Refinement skipped").detail(reason),
    );
}
