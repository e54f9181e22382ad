//! Chat-completion client for the orchestrator's classification step.
//!
//! Speaks the OpenAI-compatible `/chat/completions` shape. Requests retry
//! with exponential backoff on transport errors and 5xx responses; 4xx
//! responses never retry. An optional secondary provider takes over when
//! the primary is exhausted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics::ControlPlaneMetrics;
use crate::types::LlmError;

/// One provider endpoint.
#[derive(Clone)]
pub struct LlmProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl std::fmt::Debug for LlmProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmProviderConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProviderConfig,
    /// Secondary provider used when the primary is exhausted.
    pub fallback: Option<LlmProviderConfig>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmConfig {
    pub fn new(provider: LlmProviderConfig) -> Self {
        Self {
            provider,
            fallback: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat-completion client with retry and provider fallback.
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    metrics: std::sync::Arc<ControlPlaneMetrics>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, metrics: std::sync::Arc<ControlPlaneMetrics>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        info!(model = %config.provider.model, "LLM client initialised");
        Self {
            http,
            config,
            metrics,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.provider.model
    }

    /// Run a chat completion, retrying and falling back as configured.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        match self.chat_with(&self.config.provider, messages).await {
            Ok(content) => Ok(content),
            Err(primary_err) => {
                let Some(fallback) = &self.config.fallback else {
                    return Err(primary_err);
                };
                warn!(error = %primary_err, model = %fallback.model,
                      "primary LLM provider exhausted, using fallback");
                self.metrics.record_llm_fallback();
                self.chat_with(fallback, messages).await
            }
        }
    }

    async fn chat_with(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<String, LlmError> {
        let mut last_error = LlmError::Unconfigured;
        for attempt in 0..self.config.max_retries.max(1) {
            if attempt > 0 {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt - 1));
                debug!(attempt, backoff_secs = backoff.as_secs(), "retrying LLM request");
                tokio::time::sleep(backoff).await;
            }

            match self.complete_once(provider, messages).await {
                Ok(content) => return Ok(content),
                // 4xx is the caller's fault; retrying cannot help.
                Err(LlmError::Api { status, message }) if (400..500).contains(&status) => {
                    return Err(LlmError::Api { status, message });
                }
                Err(err) => {
                    warn!(attempt, error = %err, "LLM request failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn complete_once(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
    ) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": provider.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let started = std::time::Instant::now();
        let response = self
            .http
            .post(format!("{}/chat/completions", provider.base_url))
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: truncate(&message, 200),
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        if let Some(usage) = &parsed.usage {
            debug!(
                model = %provider.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                latency_ms = started.elapsed().as_millis() as u64,
                "LLM usage"
            );
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| LlmError::Malformed("no content in response choices".to_string()))
    }
}

fn truncate(input: &str, max: usize) -> String {
    if input.len() <= max {
        input.to_string()
    } else {
        let mut end = max;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &input[..end])
    }
}
