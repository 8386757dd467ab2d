//! Configuration types for image-to-Markdown transcription.
//!
//! Job-independent behaviour lives in [`TranscriptionConfig`], built via its
//! [`TranscriptionConfigBuilder`]; provider selection and credentials live in
//! [`ProviderConfig`]. Per-job choices (output mode, language, model override)
//! travel in [`crate::TranscriptionRequest`] instead, so one config can be
//! shared across many jobs and threads.

use crate::error::Img2MdError;
use crate::provider::VisionProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which backend family to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Cloud multimodal API (Gemini `generateContent`).
    Gemini,
    /// Local OpenAI-compatible server (LM Studio, Ollama, vLLM…).
    Local,
    /// Enterprise Claude-compatible Messages API.
    Enterprise,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::Local => "local",
            ProviderKind::Enterprise => "enterprise",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini-2.0-flash",
            ProviderKind::Local => "qwen2.5-vl-7b-instruct",
            ProviderKind::Enterprise => "claude-sonnet-4-20250514",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com",
            ProviderKind::Local => "http://localhost:1234/v1",
            ProviderKind::Enterprise => "https://api.anthropic.com",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Img2MdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" | "cloud" => Ok(ProviderKind::Gemini),
            "local" | "lmstudio" | "ollama" | "openai-compatible" => Ok(ProviderKind::Local),
            "enterprise" | "anthropic" | "claude" => Ok(ProviderKind::Enterprise),
            other => Err(Img2MdError::InvalidConfig(format!(
                "unknown provider '{other}' (expected gemini, local or enterprise)"
            ))),
        }
    }
}

/// Connection settings for one provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Vision model. Defaults to [`ProviderKind::default_model`].
    pub model: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Defaults to [`ProviderKind::default_base_url`].
    pub base_url: Option<String>,
    /// Per-request HTTP timeout in seconds. Default: 120.
    pub timeout_secs: u64,
    /// Longest image edge sent to resource-constrained providers. Default: 1024.
    pub max_image_dimension: u32,
    /// JPEG quality used when re-encoding for resource-constrained providers. Default: 85.
    pub jpeg_quality: u8,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            model: None,
            api_key: None,
            base_url: None,
            timeout_secs: 120,
            max_image_dimension: 1024,
            jpeg_quality: 85,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs.max(1);
        self
    }

    /// The model that will actually be used.
    pub fn resolved_model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(self.kind.default_model())
    }

    /// The base URL that will actually be used, without a trailing slash.
    pub fn resolved_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(self.kind.default_base_url())
            .trim_end_matches('/')
    }

    /// Auto-detect a provider from the environment.
    ///
    /// Priority: `GEMINI_API_KEY`, then `ANTHROPIC_API_KEY` (with optional
    /// `ANTHROPIC_BASE_URL`), then `LOCAL_LLM_URL`.
    pub fn from_env() -> Result<Self, Img2MdError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Img2MdError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("GEMINI_API_KEY") {
            return Ok(Self::new(ProviderKind::Gemini).api_key(key));
        }
        if let Some(key) = get("ANTHROPIC_API_KEY") {
            let mut cfg = Self::new(ProviderKind::Enterprise).api_key(key);
            cfg.base_url = get("ANTHROPIC_BASE_URL");
            return Ok(cfg);
        }
        if let Some(url) = get("LOCAL_LLM_URL") {
            let mut cfg = Self::new(ProviderKind::Local).base_url(url);
            cfg.api_key = get("LOCAL_LLM_API_KEY");
            return Ok(cfg);
        }

        Err(Img2MdError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: "No provider could be auto-detected from environment.\n\
                   Set GEMINI_API_KEY, ANTHROPIC_API_KEY, or LOCAL_LLM_URL."
                .to_string(),
        })
    }
}

/// Dual ceilings used by the batch planner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum images per provider request. Default: 20.
    pub max_images_per_batch: usize,
    /// Maximum estimated encoded payload per request in bytes. Default: 14 MiB.
    pub max_batch_bytes: u64,
    /// Growth factor from raw file size to request size (base64 + JSON
    /// framing). Default: 1.4.
    pub encoding_overhead: f64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_images_per_batch: 20,
            max_batch_bytes: 14 * 1024 * 1024,
            encoding_overhead: 1.4,
        }
    }
}

/// Input ceilings enforced by the image validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLimits {
    /// Maximum images per job. Default: 500.
    pub max_images: usize,
    /// Maximum size of one image file in bytes. Default: 20 MiB.
    pub max_file_size: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_images: 500,
            max_file_size: 20 * 1024 * 1024,
        }
    }
}

/// Configuration for transcription jobs.
///
/// # Example
/// ```rust
/// use edgequake_img2md::{ProviderConfig, ProviderKind, TranscriptionConfig};
///
/// let config = TranscriptionConfig::builder()
///     .provider_config(ProviderConfig::new(ProviderKind::Gemini).api_key("k"))
///     .concurrency(3)
///     .text_model("gemini-2.0-flash-lite")
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 3);
/// ```
#[derive(Clone)]
pub struct TranscriptionConfig {
    /// Provider settings. If None along with `provider`, uses
    /// [`ProviderConfig::from_env`].
    pub provider_config: Option<ProviderConfig>,

    /// Pre-constructed provider. Takes precedence over `provider_config`.
    pub provider: Option<Arc<dyn VisionProvider>>,

    /// Secondary text model. When set, the refinement stage runs after
    /// vision transcription.
    pub text_model: Option<String>,

    /// Worker-pool size for parallel batch execution. Default: 3.
    pub concurrency: usize,

    /// Jobs with at most this many batches run sequentially. Default: 2.
    pub sequential_threshold: usize,

    pub batch_limits: BatchLimits,
    pub validation_limits: ValidationLimits,

    /// Maximum retry attempts on a retryable provider failure. Default: 3.
    pub max_retries: u32,

    /// Backoff before retry *n* is `retry_backoff[n - 1]`; the last step
    /// repeats. Default: 2 s, 4 s, 8 s, 16 s.
    pub retry_backoff: Vec<Duration>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per request. Default: 8192.
    pub max_tokens: u32,

    /// Pause between batches in sequential mode, in milliseconds. Default: 500.
    pub inter_batch_delay_ms: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider_config: None,
            provider: None,
            text_model: None,
            concurrency: 3,
            sequential_threshold: 2,
            batch_limits: BatchLimits::default(),
            validation_limits: ValidationLimits::default(),
            max_retries: 3,
            retry_backoff: [2, 4, 8, 16].map(Duration::from_secs).to_vec(),
            temperature: 0.1,
            max_tokens: 8192,
            inter_batch_delay_ms: 500,
        }
    }
}

impl fmt::Debug for TranscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscriptionConfig")
            .field("provider_config", &self.provider_config)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn VisionProvider>"))
            .field("text_model", &self.text_model)
            .field("concurrency", &self.concurrency)
            .field("sequential_threshold", &self.sequential_threshold)
            .field("batch_limits", &self.batch_limits)
            .field("validation_limits", &self.validation_limits)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("inter_batch_delay_ms", &self.inter_batch_delay_ms)
            .finish()
    }
}

impl TranscriptionConfig {
    pub fn builder() -> TranscriptionConfigBuilder {
        TranscriptionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`TranscriptionConfig`].
#[derive(Debug)]
pub struct TranscriptionConfigBuilder {
    config: TranscriptionConfig,
}

impl TranscriptionConfigBuilder {
    pub fn provider_config(mut self, cfg: ProviderConfig) -> Self {
        self.config.provider_config = Some(cfg);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn VisionProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_model = Some(model.into());
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn sequential_threshold(mut self, n: usize) -> Self {
        self.config.sequential_threshold = n;
        self
    }

    pub fn batch_limits(mut self, limits: BatchLimits) -> Self {
        self.config.batch_limits = limits;
        self
    }

    pub fn validation_limits(mut self, limits: ValidationLimits) -> Self {
        self.config.validation_limits = limits;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff(mut self, steps: Vec<Duration>) -> Self {
        self.config.retry_backoff = steps;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn inter_batch_delay_ms(mut self, ms: u64) -> Self {
        self.config.inter_batch_delay_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<TranscriptionConfig, Img2MdError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(Img2MdError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.batch_limits.max_images_per_batch == 0 {
            return Err(Img2MdError::InvalidConfig(
                "max_images_per_batch must be ≥ 1".into(),
            ));
        }
        if c.batch_limits.max_batch_bytes == 0 {
            return Err(Img2MdError::InvalidConfig(
                "max_batch_bytes must be > 0".into(),
            ));
        }
        let overhead = c.batch_limits.encoding_overhead;
        if overhead.is_nan() || overhead < 1.0 {
            return Err(Img2MdError::InvalidConfig(format!(
                "encoding_overhead must be ≥ 1.0, got {}",
                c.batch_limits.encoding_overhead
            )));
        }
        if c.validation_limits.max_images == 0 {
            return Err(Img2MdError::InvalidConfig("max_images must be ≥ 1".into()));
        }
        if c.retry_backoff.is_empty() && c.max_retries > 0 {
            return Err(Img2MdError::InvalidConfig(
                "retry_backoff needs at least one step when retries are enabled".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(Img2MdError::InvalidConfig("max_tokens must be > 0".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let c = TranscriptionConfig::default();
        assert_eq!(c.concurrency, 3);
        assert_eq!(c.sequential_threshold, 2);
        assert_eq!(c.batch_limits.max_images_per_batch, 20);
        assert_eq!(c.batch_limits.max_batch_bytes, 14 * 1024 * 1024);
        assert_eq!(c.max_retries, 3);
        assert!(c.text_model.is_none());
    }

    #[test]
    fn build_rejects_bad_overhead() {
        let err = TranscriptionConfig::builder()
            .batch_limits(BatchLimits {
                encoding_overhead: 0.5,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("encoding_overhead"));
    }

    #[test]
    fn build_clamps_concurrency() {
        let c = TranscriptionConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!("Claude".parse::<ProviderKind>().unwrap(), ProviderKind::Enterprise);
        assert_eq!("lmstudio".parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Gemini);
        assert!("mistral".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn provider_debug_redacts_key() {
        let cfg = ProviderConfig::new(ProviderKind::Gemini).api_key("sk-secret");
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn resolved_values_fall_back_to_defaults() {
        let cfg = ProviderConfig::new(ProviderKind::Local).base_url("http://box:8080/v1/");
        assert_eq!(cfg.resolved_model(), "qwen2.5-vl-7b-instruct");
        assert_eq!(cfg.resolved_base_url(), "http://box:8080/v1");
    }

    #[test]
    fn env_detection_priority() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "a"),
            ("ANTHROPIC_BASE_URL", "https://llm.corp"),
            ("LOCAL_LLM_URL", "http://localhost:1234/v1"),
        ]
        .into_iter()
        .collect();
        let cfg =
            ProviderConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.kind, ProviderKind::Enterprise);
        assert_eq!(cfg.resolved_base_url(), "https://llm.corp");

        let none = ProviderConfig::from_lookup(|_| None);
        assert!(matches!(
            none,
            Err(Img2MdError::ProviderNotConfigured { .. })
        ));
    }
}
