//! Enterprise Claude-compatible backend (Messages API).
//!
//! Works against the public Anthropic endpoint or any gateway exposing the
//! same `/v1/messages` contract. Images are sent as native base64 `image`
//! blocks ahead of the instruction text.

use super::{
    redact_url, require_key, Completion, HttpTransport, ProviderRequest, VisionProvider,
};
use crate::config::ProviderConfig;
use crate::error::Img2MdError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct EnterpriseProvider {
    http: HttpTransport,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for EnterpriseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnterpriseProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl EnterpriseProvider {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, Img2MdError> {
        Ok(Self {
            http: HttpTransport::new("enterprise", cfg.timeout_secs)?,
            api_key: require_key(cfg, "ANTHROPIC_API_KEY")?,
            base_url: cfg.resolved_base_url().to_string(),
            model: cfg.resolved_model().to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

/// Request body for `/v1/messages`.
pub(crate) fn build_body(request: &ProviderRequest) -> Value {
    let mut content: Vec<Value> = request
        .images
        .iter()
        .map(|img| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": img.mime_type,
                    "data": img.data,
                }
            })
        })
        .collect();
    content.push(json!({ "type": "text", "text": request.prompt }));

    json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "messages": [{ "role": "user", "content": content }],
    })
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
    stop_reason: Option<String>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

/// Extract `(text, tokens)` from a Messages API response body.
pub(crate) fn parse_body(http: &HttpTransport, body: &str) -> Result<(String, u64), Img2MdError> {
    let resp: MessagesResponse =
        serde_json::from_str(body).map_err(|e| http.malformed(e.to_string()))?;

    if resp.kind.as_deref() == Some("error") || resp.error.is_some() {
        let (kind, message) = resp
            .error
            .map(|e| (e.kind.unwrap_or_default(), e.message.unwrap_or_default()))
            .unwrap_or_default();
        return Err(http.provider_error(format!("{kind}: {message}")));
    }

    let tokens = resp
        .usage
        .map(|u| u.input_tokens + u.output_tokens)
        .unwrap_or(0);

    let text: String = resp
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        let reason = resp.stop_reason.unwrap_or_else(|| "unknown".into());
        return Err(http.provider_error(format!("no text content (stop reason {reason})")));
    }

    Ok((text, tokens))
}

#[async_trait]
impl VisionProvider for EnterpriseProvider {
    fn name(&self) -> &str {
        "enterprise"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, _model: &str) -> String {
        format!("POST {}", redact_url(&self.url()))
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<Completion, Img2MdError> {
        let body = build_body(request);
        let reply = self
            .http
            .send(
                self.http
                    .post(&self.url())
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body),
            )
            .await?;

        let (text, tokens) = parse_body(&self.http, &reply.body)?;
        debug!("enterprise: {} chars, {} tokens", text.len(), tokens);
        Ok(Completion {
            text,
            tokens,
            status_code: reply.status,
            response_bytes: reply.body.len(),
        })
    }
}
