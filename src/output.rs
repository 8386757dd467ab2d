//! Output types: per-page content, chapters, and the final documents.
//!
//! [`PageContent`] is what the model returns for one image. It decodes
//! leniently: every field has a default, `null` or a value of the wrong type
//! counts as absent, and both `snake_case` and `camelCase` keys are accepted.

use crate::error::Img2MdError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Structured content extracted from one page image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    /// 1-indexed page number (`page_index + 1`). Always assigned by the
    /// pipeline, never trusted from the model.
    #[serde(default, alias = "pageNumber", deserialize_with = "lenient_number")]
    pub page_number: usize,

    /// Markdown text of the page.
    #[serde(default, deserialize_with = "lenient_text")]
    pub text: String,

    #[serde(default, alias = "hasHeading", deserialize_with = "lenient_flag")]
    pub has_heading: bool,

    #[serde(default, alias = "headingText", deserialize_with = "lenient_text")]
    pub heading_text: String,

    /// Markdown heading level (1 = `#`). 0 when unknown or out of range.
    #[serde(default, alias = "headingLevel", deserialize_with = "lenient_level")]
    pub heading_level: u8,

    #[serde(default, alias = "isChapterStart", deserialize_with = "lenient_flag")]
    pub is_chapter_start: bool,

    #[serde(default, alias = "chapterTitle", deserialize_with = "lenient_text")]
    pub chapter_title: String,

    /// Descriptions of figures/photos on the page.
    #[serde(default, deserialize_with = "image_descriptions")]
    pub images: Vec<String>,
}

impl PageContent {
    /// A page holding only raw text, with no structural hints.
    pub fn raw(page_number: usize, text: impl Into<String>) -> Self {
        Self {
            page_number,
            text: text.into(),
            ..Default::default()
        }
    }

    /// The heading to use as a title, if the page carries one.
    pub fn heading(&self) -> Option<&str> {
        let h = self.heading_text.trim();
        (self.has_heading && !h.is_empty()).then_some(h)
    }
}

// Field decoders below never fail: a value of the wrong type yields the
// field's default.

fn lenient_number<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .unwrap_or_default())
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    })
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    })
}

/// Heading level 1..=6 from a number, a numeric string or a run of `#`.
fn lenient_level<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let level = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            if !s.is_empty() && s.chars().all(|c| c == '#') {
                Some(s.len() as u64)
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    };
    Ok(level
        .filter(|l| (1..=6).contains(l))
        .and_then(|l| u8::try_from(l).ok())
        .unwrap_or(0))
}

/// Accept `["a", "b"]`, `[{"description": "a"}, …]` or a single string.
fn image_descriptions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(values)) => values,
        Some(Value::String(s)) => vec![Value::String(s)],
        _ => Vec::new(),
    };
    Ok(values
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            Value::Object(map) => map
                .get("description")
                .or_else(|| map.get("caption"))
                .and_then(|d| d.as_str())
                .map(str::to_string),
            _ => None,
        })
        .filter(|s| !s.trim().is_empty())
        .collect())
}

/// A run of consecutive pages detected as one chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterInfo {
    pub title: String,
    /// First page (1-indexed, inclusive).
    pub start_page: usize,
    /// Last page (1-indexed, inclusive).
    pub end_page: usize,
    pub level: u8,
}

/// A heading found inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub level: u8,
    pub page: usize,
}

/// One Markdown file produced by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkdownDocument {
    /// File name relative to the output directory, e.g. `01_introduction.md`.
    pub filename: String,
    pub title: String,
    pub content: String,
    /// Inclusive 1-indexed page range `(first, last)`.
    pub page_range: (usize, usize),
    pub sections: Vec<Section>,
}

/// Result of a successful transcription job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub documents: Vec<MarkdownDocument>,
    pub total_pages: usize,
    /// Wall-clock duration of the whole job.
    pub processing_time: Duration,
    /// Tokens reported by the provider(s), refinement included.
    pub tokens_used: u64,
}

/// Write every document into `dir`, creating it if needed.
///
/// Returns the written paths in document order.
pub async fn write_documents(
    documents: &[MarkdownDocument],
    dir: &Path,
) -> Result<Vec<PathBuf>, Img2MdError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Img2MdError::OutputWriteFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let mut written = Vec::with_capacity(documents.len());
    for doc in documents {
        let path = dir.join(&doc.filename);
        tokio::fs::write(&path, doc.content.as_bytes())
            .await
            .map_err(|e| Img2MdError::OutputWriteFailed {
                path: path.clone(),
                source: e,
            })?;
        debug!("Wrote {} ({} bytes)", path.display(), doc.content.len());
        written.push(path);
    }

    info!("Wrote {} document(s) to {}", written.len(), dir.display());
    Ok(written)
}
