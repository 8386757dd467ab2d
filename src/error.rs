//! Error types for the edgequake-img2md library.
//!
//! A single fatal error type, [`Img2MdError`], covers every way a
//! transcription job can end without a result. Recoverable conditions never
//! reach it: malformed model JSON is absorbed by the response parser's
//! raw-text fallback, and a failing refinement pass is skipped. Everything
//! else aborts the job, so a caller either gets every page back or a single
//! error explaining which batch failed and why.
//!
//! [`Img2MdError::kind`] groups the variants into the coarse classes callers
//! branch on, and [`Img2MdError::is_retryable`] drives the backoff loop in
//! [`crate::pipeline::llm`].

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of an [`Img2MdError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; the pipeline never started.
    Validation,
    /// Network failure, non-2xx status or provider-reported error.
    Transport,
    /// A provider response envelope could not be decoded.
    Decode,
    /// The caller cancelled the job.
    Cancelled,
    /// Invalid or missing configuration.
    Config,
    /// Local file-system failure.
    Io,
    /// Unexpected internal failure.
    Internal,
}

/// All fatal errors returned by the edgequake-img2md library.
#[derive(Debug, Error)]
pub enum Img2MdError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// The request did not contain any image.
    #[error("No images to transcribe.\nPass at least one image file or directory.")]
    NoImages,

    /// More images than the configured ceiling.
    #[error("Too many images: {count} given, at most {max} allowed per job")]
    TooManyImages { count: usize, max: usize },

    /// Input image was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The path points at a directory (or other non-file entry).
    #[error("Not a regular file: '{path}'")]
    NotAFile { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The image exceeds the per-file size ceiling.
    #[error("Image '{path}' is {size} bytes, above the {max} byte limit")]
    FileTooLarge { path: PathBuf, size: u64, max: u64 },

    /// The file extension is not a supported image format.
    #[error("Unsupported image format '{extension}' for '{path}'\nSupported: png, jpg, jpeg, webp, gif")]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// The image could not be read or re-encoded for upload.
    #[error("Failed to encode image '{path}': {detail}")]
    ImageEncoding { path: PathBuf, detail: String },

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The HTTP request never produced a response (DNS, TLS, reset…).
    #[error("Request to provider '{provider}' failed: {detail}")]
    Network { provider: String, detail: String },

    /// The provider answered with a non-2xx status.
    #[error("Provider '{provider}' returned HTTP {status}: {message}")]
    ApiStatus {
        provider: String,
        status: u16,
        message: String,
    },

    /// The provider answered 2xx but the payload carried an error.
    #[error("Provider '{provider}' reported an error: {message}")]
    ProviderError { provider: String, message: String },

    /// Provider returned HTTP 429.
    #[error("Rate limit exceeded for provider '{provider}'")]
    RateLimitExceeded {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// Provider call timed out.
    #[error("Request to provider '{provider}' timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    /// Provider returned an authentication error (401/403). Not retried.
    #[error("Authentication error from provider '{provider}': {detail}")]
    AuthError { provider: String, detail: String },

    /// The response envelope was not the JSON shape the provider documents.
    #[error("Malformed response from provider '{provider}': {detail}")]
    MalformedResponse { provider: String, detail: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// One batch failed after all retries; the whole job is aborted.
    #[error("Batch {batch}/{total} failed: {source}")]
    BatchFailed {
        batch: usize,
        total: usize,
        #[source]
        source: Box<Img2MdError>,
    },

    /// The caller cancelled the job.
    #[error("Transcription cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Img2MdError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        use Img2MdError::*;
        match self {
            NoImages
            | TooManyImages { .. }
            | FileNotFound { .. }
            | NotAFile { .. }
            | PermissionDenied { .. }
            | FileTooLarge { .. }
            | UnsupportedFormat { .. }
            | ImageEncoding { .. } => ErrorKind::Validation,
            Network { .. }
            | ApiStatus { .. }
            | ProviderError { .. }
            | RateLimitExceeded { .. }
            | Timeout { .. }
            | AuthError { .. } => ErrorKind::Transport,
            MalformedResponse { .. } => ErrorKind::Decode,
            BatchFailed { source, .. } => source.kind(),
            Cancelled => ErrorKind::Cancelled,
            ProviderNotConfigured { .. } | InvalidConfig(_) => ErrorKind::Config,
            OutputWriteFailed { .. } => ErrorKind::Io,
            Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the backoff loop should try the same request again.
    ///
    /// Client errors (4xx) are final, except 408 and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            Img2MdError::Network { .. }
            | Img2MdError::Timeout { .. }
            | Img2MdError::RateLimitExceeded { .. }
            | Img2MdError::ProviderError { .. }
            | Img2MdError::MalformedResponse { .. } => true,
            Img2MdError::ApiStatus { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// True for [`Img2MdError::Cancelled`], also when wrapped in a batch failure.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
