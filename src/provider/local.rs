//! Local OpenAI-compatible backend (LM Studio, Ollama, vLLM, llama.cpp…).
//!
//! Local vision models run with small context windows, so this backend
//! declares itself resource-constrained: the planner sends one image per
//! batch and the encoder downscales each image to a bounded JPEG before it is
//! embedded as a `data:` URL.

use super::{
    redact_url, Completion, HttpTransport, ImagePolicy, ProviderRequest, VisionProvider,
};
use crate::config::ProviderConfig;
use crate::error::Img2MdError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

pub struct LocalProvider {
    http: HttpTransport,
    api_key: Option<String>,
    base_url: String,
    model: String,
    max_dimension: u32,
    jpeg_quality: u8,
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_dimension", &self.max_dimension)
            .finish()
    }
}

impl LocalProvider {
    /// No API key is required; one is sent as a bearer token if configured.
    pub fn new(cfg: &ProviderConfig) -> Result<Self, Img2MdError> {
        Ok(Self {
            http: HttpTransport::new("local", cfg.timeout_secs)?,
            api_key: cfg.api_key.clone().filter(|k| !k.trim().is_empty()),
            base_url: cfg.resolved_base_url().to_string(),
            model: cfg.resolved_model().to_string(),
            max_dimension: cfg.max_image_dimension.max(64),
            jpeg_quality: cfg.jpeg_quality.clamp(1, 100),
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Request body for `/chat/completions`.
pub(crate) fn build_body(request: &ProviderRequest) -> Value {
    let content = if request.images.is_empty() {
        json!(request.prompt)
    } else {
        let mut parts = vec![json!({ "type": "text", "text": request.prompt })];
        parts.extend(request.images.iter().map(|img| {
            json!({
                "type": "image_url",
                "image_url": { "url": img.data_url() }
            })
        }));
        Value::Array(parts)
    };

    json!({
        "model": request.model,
        "messages": [{ "role": "user", "content": content }],
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "stream": false,
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    total_tokens: Option<u64>,
}

/// Extract `(text, tokens)` from a chat-completion response body.
pub(crate) fn parse_body(http: &HttpTransport, body: &str) -> Result<(String, u64), Img2MdError> {
    let resp: ChatResponse =
        serde_json::from_str(body).map_err(|e| http.malformed(e.to_string()))?;

    if let Some(err) = resp.error {
        let message = match &err {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        return Err(http.provider_error(message));
    }

    let tokens = resp
        .usage
        .map(|u| u.total_tokens.unwrap_or(u.prompt_tokens + u.completion_tokens))
        .unwrap_or(0);

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| http.malformed("response has no choices"))?;

    let text = choice.message.and_then(|m| m.content).unwrap_or_default();
    if text.trim().is_empty() {
        let reason = choice.finish_reason.unwrap_or_else(|| "unknown".into());
        return Err(http.provider_error(format!("empty completion (finish reason {reason})")));
    }

    Ok((text, tokens))
}

#[async_trait]
impl VisionProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, _model: &str) -> String {
        format!("POST {}", redact_url(&self.url()))
    }

    fn image_policy(&self) -> ImagePolicy {
        ImagePolicy::Downscale {
            max_dimension: self.max_dimension,
            jpeg_quality: self.jpeg_quality,
        }
    }

    fn is_resource_constrained(&self) -> bool {
        true
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<Completion, Img2MdError> {
        let body = build_body(request);
        let mut builder = self.http.post(&self.url()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let reply = self.http.send(builder).await?;

        let (text, tokens) = parse_body(&self.http, &reply.body)?;
        debug!("local: {} chars, {} tokens", text.len(), tokens);
        Ok(Completion {
            text,
            tokens,
            status_code: reply.status,
            response_bytes: reply.body.len(),
        })
    }
}
