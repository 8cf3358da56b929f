use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{NovelError, Result};

/// Credentials and model names picked for one call. Resolution order is
/// user config, then system defaults, then environment; the gateway caches
/// a resolved config across a fan-out so siblings skip re-resolution.
#[derive(Debug, Clone)]
pub struct ResolvedLlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub embedding_model: String,
    /// True when the call rides on system credentials, which is the case
    /// where the daily quota applies.
    pub using_system_key: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub json_response: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// Transport seam of the engine. The production implementation speaks an
/// OpenAI-compatible wire format over reqwest; tests substitute a scripted
/// fake. Implementations map transport faults to `LlmTransient` so the
/// gateway knows what it may retry.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, config: &ResolvedLlmConfig, request: &ChatRequest)
        -> Result<RawCompletion>;

    async fn embed(&self, config: &ResolvedLlmConfig, model: &str, text: &str)
        -> Result<Vec<f32>>;
}

pub struct HttpProvider {
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for HttpProvider {
    async fn chat(
        &self,
        config: &ResolvedLlmConfig,
        request: &ChatRequest,
    ) -> Result<RawCompletion> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(WireMessage {
                role: "system",
                content: &request.system,
            });
        }
        for m in &request.messages {
            messages.push(WireMessage {
                role: &m.role,
                content: &m.content,
            });
        }

        let body = ChatCompletionRequest {
            model: &config.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_response
                .then(|| WireResponseFormat { kind: "json_object" }),
        };

        debug!(model = %config.model, "sending chat completion request");

        let response = self
            .client
            .post(format!("{}/chat/completions", config.base_url))
            .bearer_auth(&config.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &text));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| NovelError::Parse(format!("completion response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(NovelError::LlmEmpty)?;

        Ok(RawCompletion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }

    async fn embed(
        &self,
        config: &ResolvedLlmConfig,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>> {
        let body = EmbeddingRequest { model, input: text };

        let response = self
            .client
            .post(format!("{}/embeddings", config.base_url))
            .bearer_auth(&config.api_key)
            .timeout(Duration::from_secs(60))
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &text));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| NovelError::Parse(format!("embedding response: {}", e)))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(NovelError::LlmEmpty)
    }
}

/// Connection-level faults are retryable; anything else bubbles as-is.
fn classify_reqwest_error(err: reqwest::Error) -> NovelError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        NovelError::LlmTransient(err.to_string())
    } else {
        NovelError::Http(err)
    }
}

/// Non-2xx classification. A 5xx is transient unless the body names a
/// provider internal error, which the upstream will keep returning.
fn classify_api_error(status: reqwest::StatusCode, body: &str) -> NovelError {
    let detail = serde_json::from_str::<WireError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(200).collect());

    if status.is_server_error() {
        if detail.to_lowercase().contains("internal error")
            || detail.to_lowercase().contains("internal_error")
        {
            NovelError::LlmProvider(detail)
        } else {
            NovelError::LlmTransient(format!("{}: {}", status, detail))
        }
    } else if status.as_u16() == 429 {
        NovelError::LlmTransient(format!("provider throttled: {}", detail))
    } else {
        NovelError::LlmProvider(format!("{}: {}", status, detail))
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    message: String,
}
