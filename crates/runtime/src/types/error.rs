//! Error types for the control plane.

use thiserror::Error;

/// Top-level control-plane error type.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Orchestration error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },
}

/// Shared-store errors. The store is an advisory dependency: callers on the
/// request path fail open and record a metric instead of surfacing these.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store backend unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation failed: {0}")]
    Operation(String),

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),
}

/// Authentication errors against the external auth proxy.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Auth proxy request failed: {0}")]
    Upstream(String),

    #[error("Auth proxy timed out")]
    Timeout,

    #[error("Auth proxy rejected the request: status {status}")]
    Rejected { status: u16 },

    #[error("Malformed auth proxy response: {0}")]
    Malformed(String),
}

/// Agent registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Agent not found: {agent_id}")]
    NotFound { agent_id: String },

    #[error("Invalid agent record: {reason}")]
    InvalidRecord { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tool catalog errors.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool {name} failed: {message}")]
    Execution { name: String, message: String },
}

/// Policy engine errors. Evaluation itself never fails — misconfiguration
/// fails closed — so these only surface from load/reload paths.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy document could not be parsed: {0}")]
    Parse(String),

    #[error("Policy source unavailable: {0}")]
    SourceUnavailable(String),
}

/// LLM provider errors.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Transport(String),

    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed LLM response: {0}")]
    Malformed(String),

    #[error("No LLM provider configured")]
    Unconfigured,
}

/// Errors dispatching to a downstream worker agent.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Agent {agent_id} timed out after {timeout_secs}s")]
    Timeout { agent_id: String, timeout_secs: u64 },

    #[error("Agent {agent_id} unreachable: {reason}")]
    Unavailable { agent_id: String, reason: String },

    #[error("Agent {agent_id} returned status {status}")]
    Upstream { agent_id: String, status: u16 },

    #[error("Agent {agent_id} reported failure: {message}")]
    AgentFailure { agent_id: String, message: String },

    #[error("Malformed response from agent {agent_id}: {reason}")]
    Malformed { agent_id: String, reason: String },
}

/// Orchestration errors.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No agent available for this request")]
    NoAgentAvailable,

    #[error("Agent classification failed: {reason}")]
    Classification { reason: String },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Access denied for agent {agent_id}: {reason}")]
    Denied { agent_id: String, reason: String },

    #[error("Rate limited for agent {agent_id}: {reason}")]
    RateLimited {
        agent_id: String,
        reason: String,
        retry_after_secs: u64,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result alias used throughout the runtime.
pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;
