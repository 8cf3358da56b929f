use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::{NovelError, Result};
use crate::llm::provider::{
    ChatMessage, ChatProvider, ChatRequest, RawCompletion, ResolvedLlmConfig,
};

const MAX_RETRIES: usize = 2;
const BASE_BACKOFF: Duration = Duration::from_secs(2);

/// One chat completion call. Defaults match the common case; the chapter
/// generator flips the skip knobs during fan-out and passes the config it
/// resolved once up front.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub user_id: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub json_response: bool,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
    pub skip_usage_tracking: bool,
    pub skip_quota_check: bool,
    pub cached_config: Option<ResolvedLlmConfig>,
}

impl CompletionParams {
    pub fn new(user_id: &str, system_prompt: impl Into<String>, user_content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            system_prompt: system_prompt.into(),
            messages: vec![ChatMessage::user(user_content)],
            temperature: 0.7,
            json_response: false,
            max_tokens: None,
            timeout: Duration::from_secs(300),
            skip_usage_tracking: false,
            skip_quota_check: false,
            cached_config: None,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

/// Uniform async entry point for every model call the engine makes.
/// Owns config resolution, daily-quota accounting, retry with backoff, and
/// content cleanup; callers only ever see finished assistant text.
#[derive(Clone)]
pub struct Gateway {
    db: Database,
    provider: Arc<dyn ChatProvider>,
    config: Config,
}

impl Gateway {
    pub fn new(db: Database, provider: Arc<dyn ChatProvider>, config: Config) -> Self {
        Self {
            db,
            provider,
            config,
        }
    }

    /// User config with an api key wins; otherwise admin-stored system
    /// defaults; otherwise whatever the environment supplied.
    pub async fn resolve_config(&self, user_id: &str) -> Result<ResolvedLlmConfig> {
        if let Some(user) = self.db.get_user_llm_config(user_id).await? {
            if user.active && !user.api_key.is_empty() {
                return Ok(ResolvedLlmConfig {
                    base_url: non_empty_or(&user.base_url, &self.config.llm_base_url),
                    api_key: user.api_key,
                    model: non_empty_or(&user.model, &self.config.llm_model),
                    embedding_model: non_empty_or(
                        &user.embedding_model,
                        &self.config.embedding_model,
                    ),
                    using_system_key: false,
                });
            }
        }

        if let Some(system) = self.db.system_llm_defaults().await? {
            if !system.api_key.is_empty() {
                return Ok(ResolvedLlmConfig {
                    base_url: non_empty_or(&system.base_url, &self.config.llm_base_url),
                    api_key: system.api_key,
                    model: non_empty_or(&system.model, &self.config.llm_model),
                    embedding_model: non_empty_or(
                        &system.embedding_model,
                        &self.config.embedding_model,
                    ),
                    using_system_key: true,
                });
            }
        }

        Ok(ResolvedLlmConfig {
            base_url: self.config.llm_base_url.clone(),
            api_key: self.config.llm_api_key.clone(),
            model: self.config.llm_model.clone(),
            embedding_model: self.config.embedding_model.clone(),
            using_system_key: true,
        })
    }

    /// Reject when the user's day counter has reached the admin limit.
    /// The chapter generator calls this once before a fan-out and issues
    /// the individual calls with `skip_quota_check`.
    pub async fn precheck_quota(&self, user_id: &str, config: &ResolvedLlmConfig) -> Result<()> {
        if !config.using_system_key {
            return Ok(());
        }
        let limit = self.db.admin_daily_quota(self.config.daily_quota).await?;
        let used = self.db.usage_today(user_id).await?;
        if used >= limit {
            warn!(user_id, used, limit, "daily quota exhausted");
            return Err(NovelError::RateLimited { limit });
        }
        Ok(())
    }

    /// Post-hoc usage accounting for batched calls.
    pub async fn track_usage(
        &self,
        user_id: &str,
        config: &ResolvedLlmConfig,
        calls: i64,
    ) -> Result<()> {
        if config.using_system_key && calls > 0 {
            self.db.increment_usage(user_id, calls).await?;
        }
        Ok(())
    }

    pub async fn complete(&self, params: CompletionParams) -> Result<String> {
        let config = match params.cached_config.clone() {
            Some(c) => c,
            None => self.resolve_config(&params.user_id).await?,
        };

        if !params.skip_quota_check {
            self.precheck_quota(&params.user_id, &config).await?;
        }

        let request = ChatRequest {
            system: params.system_prompt.clone(),
            messages: params.messages.clone(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            json_response: params.json_response,
            timeout: params.timeout,
        };

        let completion = self.call_with_retry(&config, &request).await?;

        if completion.finish_reason.as_deref() == Some("length") {
            return Err(NovelError::LlmTruncated);
        }

        let content = clean_content(&completion.content);
        if content.is_empty() {
            return Err(NovelError::LlmEmpty);
        }

        if !params.skip_usage_tracking {
            self.track_usage(&params.user_id, &config, 1).await?;
        }

        Ok(content)
    }

    pub async fn embed(&self, text: &str, user_id: &str, model: Option<&str>) -> Result<Vec<f32>> {
        let config = self.resolve_config(user_id).await?;
        let model = model.unwrap_or(&config.embedding_model).to_string();

        let mut attempt = 0;
        loop {
            match self.provider.embed(&config, &model, text).await {
                Ok(embedding) => return Ok(embedding),
                Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                    let delay = BASE_BACKOFF * 2u32.pow(attempt as u32);
                    warn!(attempt, "embedding call failed transiently, retrying: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Embed with a pre-resolved config, for batch ingestion paths.
    pub async fn embed_with_config(
        &self,
        config: &ResolvedLlmConfig,
        text: &str,
    ) -> Result<Vec<f32>> {
        let mut attempt = 0;
        loop {
            match self
                .provider
                .embed(config, &config.embedding_model, text)
                .await
            {
                Ok(embedding) => return Ok(embedding),
                Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                    let delay = BASE_BACKOFF * 2u32.pow(attempt as u32);
                    warn!(attempt, "embedding call failed transiently, retrying: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_with_retry(
        &self,
        config: &ResolvedLlmConfig,
        request: &ChatRequest,
    ) -> Result<RawCompletion> {
        let mut attempt = 0;
        loop {
            match self.provider.chat(config, request).await {
                Ok(completion) => {
                    if attempt > 0 {
                        info!(attempt, "chat call succeeded after retry");
                    }
                    return Ok(completion);
                }
                Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                    let delay = BASE_BACKOFF * 2u32.pow(attempt as u32);
                    warn!(attempt, delay_secs = delay.as_secs(), "transient LLM failure, retrying: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// Strip a leading `<think>…</think>` preamble and unwrap a markdown code
/// fence, leaving the assistant payload itself.
fn clean_content(raw: &str) -> String {
    let mut s = raw.trim();

    if let Some(rest) = s.strip_prefix("<think>") {
        if let Some(pos) = rest.find("</think>") {
            s = rest[pos + "</think>".len()..].trim();
        }
    }

    if s.starts_with("```") {
        let body = match s.split_once('\n') {
            Some((_, rest)) => rest,
            None => "",
        };
        let body = match body.rfind("```") {
            Some(idx) => &body[..idx],
            None => body,
        };
        return body.trim().to_string();
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_think_preamble() {
        let raw = "<think>推理过程，不应外泄</think>\n正文开始了。";
        assert_eq!(clean_content(raw), "正文开始了。");
    }

    #[test]
    fn unwraps_json_fence() {
        let raw = "```json\n{\"title\": \"第一章\"}\n```";
        assert_eq!(clean_content(raw), "{\"title\": \"第一章\"}");
    }

    #[test]
    fn think_then_fence() {
        let raw = "<think>plan</think>```json\n{\"a\":1}\n```";
        assert_eq!(clean_content(raw), "{\"a\":1}");
    }

    #[test]
    fn plain_content_untouched() {
        assert_eq!(clean_content("  他抬起头。  "), "他抬起头。");
    }
}
