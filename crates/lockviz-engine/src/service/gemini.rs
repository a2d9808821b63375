use std::env;
use std::time::Duration;

use anyhow::bail;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{GenerationResponse, GenerationService, ResponsePart, ServiceError};
use crate::error::{error_chain_text, truncate_text};
use crate::request::{GenerationRequest, RequestPart};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const PROVIDER: &str = "gemini";
const ERROR_BODY_MAX_CHARS: usize = 512;

/// Gemini `generateContent` transport.
pub struct GeminiService {
    api_base: String,
    api_key: String,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiService {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
            http: HttpClient::new(),
        }
    }

    /// Reads `GEMINI_API_KEY` (or `GOOGLE_API_KEY`) and `GEMINI_API_BASE`.
    pub fn from_env(model: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let Some(api_key) = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
        else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let api_base =
            non_empty_env("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string());
        Ok(Self::new(api_base, api_key, model, timeout))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub fn build_payload(request: &GenerationRequest) -> Value {
        let parts: Vec<Value> = request
            .parts()
            .iter()
            .map(|part| match part {
                RequestPart::InlineImage { mime_type, data } => json!({
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": BASE64.encode(data),
                    }
                }),
                RequestPart::Text(text) => json!({ "text": text }),
            })
            .collect();
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["TEXT", "IMAGE"],
            },
        })
    }

    /// Flattens every candidate's parts, first candidate first.
    pub fn parse_response(payload: &Value) -> Result<GenerationResponse, ServiceError> {
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut parts = Vec::new();

        for candidate in candidates {
            let rows = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for row in rows {
                if let Some(text) = row.get("text").and_then(Value::as_str) {
                    parts.push(ResponsePart::Text(text.to_string()));
                    continue;
                }
                let Some(inline) = row
                    .get("inlineData")
                    .or_else(|| row.get("inline_data"))
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .map_err(|err| invalid_response(format!("image base64 decode failed: {err}")))?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string();
                parts.push(ResponsePart::InlineImage {
                    mime_type,
                    data: bytes,
                });
            }
        }

        Ok(GenerationResponse::new(parts))
    }
}

impl GenerationService for GeminiService {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ServiceError> {
        let endpoint = self.endpoint();
        let payload = Self::build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ServiceError::Transport {
                provider: PROVIDER.to_string(),
                message: error_chain_text(&err, ERROR_BODY_MAX_CHARS),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| ServiceError::Transport {
            provider: PROVIDER.to_string(),
            message: format!(
                "response body read failed: {}",
                error_chain_text(&err, ERROR_BODY_MAX_CHARS)
            ),
        })?;
        if !status.is_success() {
            return Err(ServiceError::Http {
                provider: PROVIDER.to_string(),
                status: status.as_u16(),
                body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|err| invalid_response(format!("invalid JSON: {err}")))?;
        Self::parse_response(&parsed)
    }
}

fn invalid_response(message: String) -> ServiceError {
    ServiceError::InvalidResponse {
        provider: PROVIDER.to_string(),
        message,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
