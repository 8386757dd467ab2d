//! Vision-model backends.
//!
//! Every backend implements [`VisionProvider`]: one HTTP round-trip turning a
//! [`ProviderRequest`] (prompt + base64 images) into a [`Completion`] (raw
//! model text + token count). Wire formats, authentication and response
//! envelopes stay inside each implementation; retries, progress events and
//! JSON page parsing are shared and live in [`crate::pipeline::llm`].
//!
//! | Backend | Wire format | Images |
//! |---------|-------------|--------|
//! | [`GeminiProvider`] | `generateContent`, `inline_data` parts | original bytes |
//! | [`LocalProvider`] | OpenAI chat completions, `image_url` data URLs | downscaled JPEG, one per batch |
//! | [`EnterpriseProvider`] | Messages API, base64 `image` blocks | original bytes |
//!
//! [`create_provider`] picks the implementation from [`ProviderConfig::kind`].

mod enterprise;
mod gemini;
mod local;

pub use enterprise::EnterpriseProvider;
pub use gemini::GeminiProvider;
pub use local::LocalProvider;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::Img2MdError;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How images must be prepared before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePolicy {
    /// Send the file bytes unchanged.
    Original,
    /// Downscale so the longest edge is at most `max_dimension`, then
    /// re-encode as JPEG.
    Downscale { max_dimension: u32, jpeg_quality: u8 },
}

/// One base64-encoded image ready to embed in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    /// Standard base64, no data-URL prefix.
    pub data: String,
    /// Source file name, for logs.
    pub source: String,
}

impl EncodedImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// A provider-neutral completion request.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub prompt: String,
    /// Empty for text-only (refinement) requests.
    pub images: Vec<EncodedImage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the backend for a JSON response where it supports that natively.
    pub json_output: bool,
}

impl ProviderRequest {
    /// Approximate request size: prompt plus encoded images.
    pub fn payload_bytes(&self) -> usize {
        self.prompt.len() + self.images.iter().map(|i| i.data.len()).sum::<usize>()
    }
}

/// Raw model output from one successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens: u64,
    pub status_code: u16,
    pub response_bytes: usize,
}

/// A backend capable of turning images + a prompt into text.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Short provider name used in logs and progress events.
    fn name(&self) -> &str;

    /// Default vision model.
    fn model(&self) -> &str;

    /// Redacted endpoint description for `model` (no keys, no query string).
    fn endpoint(&self, model: &str) -> String;

    fn image_policy(&self) -> ImagePolicy {
        ImagePolicy::Original
    }

    /// Small-context backends get one image per batch.
    fn is_resource_constrained(&self) -> bool {
        false
    }

    /// Perform exactly one request. Retries are the caller's business.
    async fn complete(&self, request: &ProviderRequest) -> Result<Completion, Img2MdError>;
}

/// Build the provider selected by `cfg.kind`.
pub fn create_provider(cfg: &ProviderConfig) -> Result<Arc<dyn VisionProvider>, Img2MdError> {
    debug!("Creating {} provider ({})", cfg.kind, cfg.resolved_model());
    Ok(match cfg.kind {
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(cfg)?),
        ProviderKind::Local => Arc::new(LocalProvider::new(cfg)?),
        ProviderKind::Enterprise => Arc::new(EnterpriseProvider::new(cfg)?),
    })
}

// ── Shared HTTP plumbing ─────────────────────────────────────────────────

/// reqwest client plus the bits every backend needs for error mapping.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    provider: &'static str,
    timeout_secs: u64,
}

/// Body of a successful (2xx) HTTP exchange.
pub(crate) struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpTransport {
    pub fn new(provider: &'static str, timeout_secs: u64) -> Result<Self, Img2MdError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Img2MdError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            provider,
            timeout_secs,
        })
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.post(url)
    }

    /// Send a request and map every non-2xx outcome onto [`Img2MdError`].
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<HttpReply, Img2MdError> {
        let response = request.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.map_err(|e| self.map_reqwest(e))?;

        if status.is_success() {
            return Ok(HttpReply {
                status: status.as_u16(),
                body,
            });
        }

        let message = error_message(&body);
        Err(match status.as_u16() {
            429 => Img2MdError::RateLimitExceeded {
                provider: self.provider.to_string(),
                retry_after_secs: retry_after,
            },
            401 | 403 => Img2MdError::AuthError {
                provider: self.provider.to_string(),
                detail: message,
            },
            code => Img2MdError::ApiStatus {
                provider: self.provider.to_string(),
                status: code,
                message,
            },
        })
    }

    fn map_reqwest(&self, e: reqwest::Error) -> Img2MdError {
        if e.is_timeout() {
            Img2MdError::Timeout {
                provider: self.provider.to_string(),
                secs: self.timeout_secs,
            }
        } else {
            Img2MdError::Network {
                provider: self.provider.to_string(),
                detail: e.to_string(),
            }
        }
    }

    pub fn malformed(&self, detail: impl Into<String>) -> Img2MdError {
        Img2MdError::MalformedResponse {
            provider: self.provider.to_string(),
            detail: detail.into(),
        }
    }

    pub fn provider_error(&self, message: impl Into<String>) -> Img2MdError {
        Img2MdError::ProviderError {
            provider: self.provider.to_string(),
            message: message.into(),
        }
    }
}

/// `{"error": {"message": …}}`, `{"error": "…"}` or `{"message": …}`.
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<serde_json::Value>,
    message: Option<String>,
}

/// Best-effort human-readable message from an error body.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(env) = serde_json::from_str::<ErrorEnvelope>(body) {
        match env.error {
            Some(serde_json::Value::String(s)) => return s,
            Some(serde_json::Value::Object(map)) => {
                if let Some(m) = map.get("message").and_then(|m| m.as_str()) {
                    return m.to_string();
                }
            }
            _ => {}
        }
        if let Some(m) = env.message {
            return m;
        }
    }
    truncate(body.trim(), 300)
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Strip credentials and query string from a URL for display.
pub(crate) fn redact_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.split_once("://") {
        Some((scheme, rest)) => {
            let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
            format!("{scheme}://{rest}")
        }
        None => without_query.to_string(),
    }
}

pub(crate) fn require_key(cfg: &ProviderConfig, env_var: &str) -> Result<String, Img2MdError> {
    cfg.api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| Img2MdError::ProviderNotConfigured {
            provider: cfg.kind.to_string(),
            hint: format!("Set {env_var} or pass an API key explicitly."),
        })
}
