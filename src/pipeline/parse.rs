//! Response parsing: model text → one [`PageContent`] per batch image.
//!
//! Models are asked for `{"pages": [...]}` but routinely wrap it in a
//! ```` ```json ```` fence, and occasionally answer in plain Markdown. The
//! parser strips fences, decodes leniently, and when decoding fails keeps
//! the raw text as a single page credited to the batch's first image. A
//! decode failure never fails the job.
//!
//! Page numbers always come from the batch, never from the model: page *i*
//! of the response belongs to `batch[i]`.

use crate::output::PageContent;
use crate::pipeline::input::ImageDescriptor;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

static RE_FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_+\-]*").unwrap());
static RE_FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```$").unwrap());

/// Trim and remove a leading fence marker (with or without a language tag)
/// and a trailing fence marker.
pub fn strip_code_fence(raw: &str) -> &str {
    let s = raw.trim();
    let s = RE_FENCE_OPEN.find(s).map_or(s, |m| &s[m.end()..]);
    let s = RE_FENCE_CLOSE.find(s).map_or(s, |m| &s[..m.start()]);
    s.trim()
}

/// Decode `{"pages": [...]}`, a bare `[...]` or a single page object
/// (`{"text": ...}`). `None` when the payload is not one of those shapes or
/// the page list is empty.
///
/// Pages decode one at a time, so a page with odd fields keeps its position
/// instead of failing the whole list. A bare string in the list becomes a
/// text-only page.
pub fn decode_pages(payload: &str) -> Option<Vec<PageContent>> {
    let items = match serde_json::from_str::<Value>(payload).ok()? {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("pages") {
            Some(Value::Array(items)) => items,
            Some(_) => return None,
            None if map.contains_key("text") => vec![Value::Object(map)],
            None => return None,
        },
        _ => return None,
    };
    let pages: Vec<PageContent> = items.into_iter().map(page_from_value).collect();
    (!pages.is_empty()).then_some(pages)
}

fn page_from_value(value: Value) -> PageContent {
    match value {
        Value::String(text) => PageContent::raw(0, text),
        Value::Object(_) => PageContent::deserialize(value).unwrap_or_else(|e| {
            debug!("Undecodable page entry, keeping an empty page: {}", e);
            PageContent::default()
        }),
        _ => PageContent::default(),
    }
}

/// Parse raw model output for a batch.
///
/// On success the result has exactly one page per image: surplus model pages
/// are dropped and missing ones are filled with empty pages. On failure the
/// result is a single page holding `raw` verbatim, numbered after the first
/// image.
pub fn parse_pages(raw: &str, batch: &[ImageDescriptor]) -> Vec<PageContent> {
    let Some(first) = batch.first() else {
        return Vec::new();
    };

    let Some(mut pages) = decode_pages(strip_code_fence(raw)) else {
        warn!(
            "Model output for pages {}..={} is not structured JSON; keeping raw text on page {}",
            first.page_number(),
            batch.last().map_or(first.page_number(), ImageDescriptor::page_number),
            first.page_number()
        );
        return vec![PageContent::raw(first.page_number(), raw)];
    };

    if pages.len() != batch.len() {
        warn!(
            "Model returned {} page(s) for a batch of {} image(s) starting at page {}",
            pages.len(),
            batch.len(),
            first.page_number()
        );
    }
    pages.truncate(batch.len());
    pages.resize_with(batch.len(), PageContent::default);

    for (page, image) in pages.iter_mut().zip(batch) {
        page.page_number = image.page_number();
    }

    debug!("Parsed {} page(s) starting at page {}", pages.len(), first.page_number());
    pages
}
