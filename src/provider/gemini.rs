//! Cloud multimodal backend (Gemini `generateContent`).
//!
//! Images travel as `inline_data` parts next to the prompt text. The API key
//! goes in the `x-goog-api-key` header rather than the `?key=` query
//! parameter so it can never leak into a logged URL.

use super::{
    redact_url, require_key, Completion, HttpTransport, ProviderRequest, VisionProvider,
};
use crate::config::ProviderConfig;
use crate::error::Img2MdError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

pub struct GeminiProvider {
    http: HttpTransport,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiProvider {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, Img2MdError> {
        Ok(Self {
            http: HttpTransport::new("gemini", cfg.timeout_secs)?,
            api_key: require_key(cfg, "GEMINI_API_KEY")?,
            base_url: cfg.resolved_base_url().to_string(),
            model: cfg.resolved_model().to_string(),
        })
    }

    fn url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

/// Request body for `generateContent`.
pub(crate) fn build_body(request: &ProviderRequest) -> Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    parts.extend(request.images.iter().map(|img| {
        json!({
            "inline_data": {
                "mime_type": img.mime_type,
                "data": img.data,
            }
        })
    }));

    let mut generation = json!({
        "temperature": request.temperature,
        "maxOutputTokens": request.max_tokens,
    });
    if request.json_output {
        generation["responseMimeType"] = json!("application/json");
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": generation,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    status: Option<String>,
}

/// Extract `(text, tokens)` from a `generateContent` response body.
pub(crate) fn parse_body(http: &HttpTransport, body: &str) -> Result<(String, u64), Img2MdError> {
    let resp: GenerateResponse =
        serde_json::from_str(body).map_err(|e| http.malformed(e.to_string()))?;

    if let Some(err) = resp.error {
        let status = err.status.unwrap_or_default();
        let message = err.message.unwrap_or_else(|| "unknown error".into());
        return Err(http.provider_error(format!("{status} {message}").trim().to_string()));
    }

    if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(http.provider_error(format!("prompt blocked: {reason}")));
    }

    let tokens = resp
        .usage_metadata
        .map(|u| {
            u.total_token_count
                .unwrap_or(u.prompt_token_count + u.candidates_token_count)
        })
        .unwrap_or(0);

    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| http.malformed("response has no candidates"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".into());
        return Err(http.provider_error(format!("empty candidate (finish reason {reason})")));
    }

    Ok((text, tokens))
}

#[async_trait]
impl VisionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, model: &str) -> String {
        format!("POST {}", redact_url(&self.url(model)))
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<Completion, Img2MdError> {
        let body = build_body(request);
        let reply = self
            .http
            .send(
                self.http
                    .post(&self.url(&request.model))
                    .header("x-goog-api-key", &self.api_key)
                    .json(&body),
            )
            .await?;

        let (text, tokens) = parse_body(&self.http, &reply.body)?;
        debug!("gemini: {} chars, {} tokens", text.len(), tokens);
        Ok(Completion {
            text,
            tokens,
            status_code: reply.status,
            response_bytes: reply.body.len(),
        })
    }
}
