//! HTTP dispatch to downstream worker agents.
//!
//! Workers expose `POST {endpoint_url}/process_request` and identify the
//! acting subject through the `X-User-ID` header. Transport failures and
//! 5xx responses retry with exponential backoff; 4xx responses and
//! agent-reported failures do not.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::metrics::ControlPlaneMetrics;
use crate::types::{AgentRecord, DispatchError};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Calls worker agents over HTTP.
pub struct AgentDispatcher {
    http: reqwest::Client,
    config: DispatcherConfig,
    metrics: std::sync::Arc<ControlPlaneMetrics>,
}

impl AgentDispatcher {
    pub fn new(config: DispatcherConfig, metrics: std::sync::Arc<ControlPlaneMetrics>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            config,
            metrics,
        }
    }

    /// Send one request to an agent, retrying retryable failures.
    pub async fn call(
        &self,
        agent: &AgentRecord,
        subject_id: &str,
        query: &str,
        context: Option<&Value>,
    ) -> Result<Value, DispatchError> {
        let url = format!("{}/process_request", agent.endpoint_url);
        let body = json!({
            "query": query,
            "context": context,
        });

        let mut last_error = DispatchError::Unavailable {
            agent_id: agent.agent_id.clone(),
            reason: "no attempt made".to_string(),
        };

        for attempt in 0..self.config.max_retries.max(1) {
            if attempt > 0 {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt - 1));
                debug!(agent_id = %agent.agent_id, attempt, backoff_secs = backoff.as_secs(),
                       "retrying agent dispatch");
                self.metrics.record_dispatch_retry();
                tokio::time::sleep(backoff).await;
            }

            let response = match self
                .http
                .post(&url)
                .header("X-User-ID", subject_id)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    // Connection errors and timeouts are retryable.
                    last_error = if err.is_timeout() {
                        DispatchError::Timeout {
                            agent_id: agent.agent_id.clone(),
                            timeout_secs: self.config.timeout.as_secs(),
                        }
                    } else {
                        DispatchError::Unavailable {
                            agent_id: agent.agent_id.clone(),
                            reason: err.to_string(),
                        }
                    };
                    warn!(agent_id = %agent.agent_id, attempt, error = %last_error,
                          "agent dispatch transport failure");
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                last_error = DispatchError::Upstream {
                    agent_id: agent.agent_id.clone(),
                    status: status.as_u16(),
                };
                warn!(agent_id = %agent.agent_id, attempt, status = status.as_u16(),
                      "agent returned server error");
                continue;
            }
            if !status.is_success() {
                // Client errors are not retried.
                return Err(DispatchError::Upstream {
                    agent_id: agent.agent_id.clone(),
                    status: status.as_u16(),
                });
            }

            let reply: AgentReply = response.json().await.map_err(|e| {
                DispatchError::Malformed {
                    agent_id: agent.agent_id.clone(),
                    reason: e.to_string(),
                }
            })?;

            if !reply.success {
                return Err(DispatchError::AgentFailure {
                    agent_id: agent.agent_id.clone(),
                    message: reply.error.unwrap_or_else(|| "unspecified failure".to_string()),
                });
            }
            return Ok(reply.result.unwrap_or(Value::Null));
        }

        Err(last_error)
    }
}
