//! Runtime configuration assembled from environment variables.
//!
//! Every knob has a production default; `from_env` only fails on values
//! that are present but unparseable.

use std::path::PathBuf;
use std::time::Duration;

use crate::api::HttpApiConfig;
use crate::auth::AuthConfig;
use crate::governance::GovernanceConfig;
use crate::llm::{LlmConfig, LlmProviderConfig};
use crate::orchestrator::{DispatcherConfig, OrchestratorConfig};
use crate::policy::PolicyEngineConfig;
use crate::ratelimit::{RateLimit, RateLimitConfig};
use crate::registry::RegistryConfig;
use crate::store::RedisStoreConfig;
use crate::types::ConfigError;

/// Full control-plane configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub service_name: String,
    pub store: RedisStoreConfig,
    pub auth: AuthConfig,
    pub rate_limits: RateLimitConfig,
    pub registry: RegistryConfig,
    /// Worker heartbeat period.
    pub heartbeat_interval: Duration,
    pub governance: GovernanceConfig,
    pub dispatcher: DispatcherConfig,
    pub orchestrator: OrchestratorConfig,
    pub llm: Option<LlmConfig>,
    pub policy: PolicyEngineConfig,
    pub api: HttpApiConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "conductor".to_string(),
            store: RedisStoreConfig::default(),
            auth: AuthConfig::default(),
            rate_limits: RateLimitConfig::default(),
            registry: RegistryConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            governance: GovernanceConfig::default(),
            dispatcher: DispatcherConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            llm: None,
            policy: PolicyEngineConfig::default(),
            api: HttpApiConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.service_name = env_string("SERVICE_NAME", &config.service_name);
        config.store.url = env_string("STORE_URL", &config.store.url);

        config.auth.proxy_url = env_string("AUTH_PROXY_URL", &config.auth.proxy_url);
        config.auth.timeout = env_secs("AUTH_TIMEOUT", config.auth.timeout)?;
        config.auth.cache_ttl = env_secs("TOKEN_CACHE_TTL", config.auth.cache_ttl)?;

        config.rate_limits.global = RateLimit::new(
            env_parse("RATE_LIMIT_REQUESTS", config.rate_limits.global.requests)?,
            env_parse("RATE_LIMIT_WINDOW", config.rate_limits.global.window_secs)?,
        );
        config.rate_limits.user = RateLimit::new(
            env_parse("USER_RATE_LIMIT_REQUESTS", config.rate_limits.user.requests)?,
            env_parse("USER_RATE_LIMIT_WINDOW", config.rate_limits.user.window_secs)?,
        );
        config.rate_limits.tool = RateLimit::new(
            env_parse("TOOL_RATE_LIMIT_REQUESTS", config.rate_limits.tool.requests)?,
            env_parse("TOOL_RATE_LIMIT_WINDOW", config.rate_limits.tool.window_secs)?,
        );
        config.rate_limits.burst = env_parse("RATE_LIMIT_BURST", config.rate_limits.burst)?;

        config.registry.record_ttl = env_secs("REGISTRY_TTL", config.registry.record_ttl)?;
        config.heartbeat_interval = env_secs("HEARTBEAT_INTERVAL", config.heartbeat_interval)?;

        config.governance.tool_timeout = env_secs("TOOL_TIMEOUT", config.governance.tool_timeout)?;
        config.dispatcher.timeout = env_secs("AGENT_TIMEOUT", config.dispatcher.timeout)?;
        config.dispatcher.max_retries = env_parse("MAX_RETRIES", config.dispatcher.max_retries)?;

        config.llm = llm_from_env()?;

        config.policy.yaml_path = std::env::var("POLICY_FILE").ok().map(PathBuf::from);

        config.api.bind_address = env_string("BIND_ADDRESS", &config.api.bind_address);
        config.api.port = env_parse("PORT", config.api.port)?;

        Ok(config)
    }
}

fn llm_from_env() -> Result<Option<LlmConfig>, ConfigError> {
    let Ok(base_url) = std::env::var("LLM_BASE_URL") else {
        return Ok(None);
    };
    let api_key = std::env::var("LLM_API_KEY").unwrap_or_default();
    let model = env_string("LLM_MODEL", "gpt-4o-mini");

    let mut llm = LlmConfig::new(LlmProviderConfig {
        base_url,
        api_key,
        model,
    });
    llm.timeout = env_secs("LLM_TIMEOUT", llm.timeout)?;
    llm.max_retries = env_parse("MAX_RETRIES", llm.max_retries)?;

    if let Ok(fallback_url) = std::env::var("LLM_FALLBACK_BASE_URL") {
        llm.fallback = Some(LlmProviderConfig {
            base_url: fallback_url,
            api_key: std::env::var("LLM_FALLBACK_API_KEY").unwrap_or_default(),
            model: env_string("LLM_FALLBACK_MODEL", llm.provider.model.as_str()),
        });
    }
    Ok(Some(llm))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}
