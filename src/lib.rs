//! # edgequake-img2md
//!
//! Transcribe batches of page images (scans, photos, screenshots) into
//! Markdown using multimodal LLMs.
//!
//! ## Pipeline Overview
//!
//! ```text
//! images
//!  │
//!  ├─ 1. Validate  existence, size, extension, readability
//!  ├─ 2. Plan      pack pages into batches (≤ 20 images, ≤ 14 MiB payload)
//!  ├─ 3. Execute   batches → provider, ≤ 3 in flight, retry with backoff
//!  ├─ 4. Refine    optional text-only cleanup with a second model
//!  └─ 5. Assemble  per-page, combined or per-chapter Markdown documents
//! ```
//!
//! A job either transcribes every page or fails: the first batch that still
//! fails after its retries cancels the rest of the job.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_img2md::{progress, transcribe_to_dir, TranscriptionConfig, TranscriptionRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / ANTHROPIC_API_KEY / LOCAL_LLM_URL
//!     let config = TranscriptionConfig::default();
//!     let mut request = TranscriptionRequest::new(
//!         vec!["scan/001.png".into(), "scan/002.png".into()],
//!         "out",
//!     );
//!     request.detect_chapters = true;
//!
//!     let (reporter, _updates) = progress::channel("", "");
//!     let (output, paths) =
//!         transcribe_to_dir(&request, &config, reporter, CancellationToken::new()).await?;
//!     eprintln!("{} pages, {} tokens, {} files", output.total_pages, output.tokens_used, paths.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Providers
//!
//! | Kind | Env | Default model | Batching |
//! |------|-----|---------------|----------|
//! | `gemini` | `GEMINI_API_KEY` | `gemini-2.0-flash` | up to 20 images |
//! | `enterprise` | `ANTHROPIC_API_KEY` | `claude-sonnet-4-20250514` | up to 20 images |
//! | `local` | `LOCAL_LLM_URL` | `qwen2.5-vl-7b-instruct` | one image, downscaled |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `img2md` binary (clap + indicatif + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod provider;
pub mod stream;
pub mod transcribe;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    BatchLimits, ProviderConfig, ProviderKind, TranscriptionConfig, TranscriptionConfigBuilder,
    ValidationLimits,
};
pub use error::{ErrorKind, Img2MdError};
pub use output::{ChapterInfo, MarkdownDocument, PageContent, Section, TranscriptionOutput};
pub use pipeline::assemble::OutputMode;
pub use progress::{ProgressReceiver, ProgressReporter, ProgressStatus, ProgressUpdate};
pub use provider::{create_provider, VisionProvider};
pub use stream::{transcribe_stream, TranscriptionHandle};
pub use transcribe::{transcribe, transcribe_sync, transcribe_to_dir, TranscriptionRequest};
