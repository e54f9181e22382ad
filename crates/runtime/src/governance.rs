//! Governance pipeline: the single choke-point for tool invocations.
//!
//! Every externally-triggered tool call flows through [`GovernancePipeline::gate`]:
//! authenticate, evaluate policy (which applies the rate windows), execute,
//! audit. Violations, counters and spans are emitted here and only here —
//! tool bodies carry none of this logic.
//!
//! An unauthenticated request never reaches the policy engine. Tool errors
//! are caught at this boundary and surfaced with sanitised messages; raw
//! tokens and internal details never appear in responses.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info_span, warn, Instrument};

use crate::auth::AuthValidator;
use crate::catalog::ToolCatalog;
use crate::metrics::ControlPlaneMetrics;
use crate::policy::{DenialKind, PolicyEngine};
use crate::types::{CatalogError, ResourceType, Subject};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    /// Hard ceiling on tool execution; exceeding it aborts with a timeout.
    pub tool_timeout: Duration,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of gating one invocation.
#[derive(Debug)]
pub enum GateOutcome {
    /// The call was authorised, executed, and audited.
    Ok {
        result: Value,
        subject_id: String,
        elapsed: Duration,
    },
    /// Token missing, invalid or expired.
    Unauthenticated,
    /// Role or deny-list rejection.
    Denied { reason: String },
    /// A rate window was exhausted.
    RateLimited {
        reason: String,
        retry_after_secs: u64,
    },
    /// Parameter rejected by policy or schema.
    ParameterViolation { reason: String },
    /// No such tool.
    NotFound { resource_id: String },
    /// Execution exceeded the hard timeout.
    Timeout { resource_id: String },
    /// Execution failed; message is sanitised.
    Internal { message: String },
}

/// The authenticate → policy → execute → audit pipeline.
pub struct GovernancePipeline {
    auth: Arc<AuthValidator>,
    policy: Arc<PolicyEngine>,
    catalog: Arc<ToolCatalog>,
    metrics: Arc<ControlPlaneMetrics>,
    config: GovernanceConfig,
}

impl GovernancePipeline {
    pub fn new(
        auth: Arc<AuthValidator>,
        policy: Arc<PolicyEngine>,
        catalog: Arc<ToolCatalog>,
        metrics: Arc<ControlPlaneMetrics>,
        config: GovernanceConfig,
    ) -> Self {
        Self {
            auth,
            policy,
            catalog,
            metrics,
            config,
        }
    }

    /// Authenticate a bearer token without touching the policy engine.
    pub async fn authenticate(&self, token: &str) -> Option<Subject> {
        self.auth.validate(token).await
    }

    /// Gate one tool invocation end to end.
    pub async fn gate(
        &self,
        token: &str,
        resource_id: &str,
        action: &str,
        params: &Value,
    ) -> GateOutcome {
        self.metrics.record_gate();

        let Some(subject) = self.auth.validate(token).await else {
            return GateOutcome::Unauthenticated;
        };

        let descriptor = self.catalog.lookup(resource_id);
        let category = descriptor.as_ref().map(|d| d.category.clone());

        let params_map = match params {
            Value::Null => None,
            Value::Object(map) => Some(map),
            _ => {
                return GateOutcome::ParameterViolation {
                    reason: "parameters must be a JSON object".to_string(),
                }
            }
        };

        let decision = self
            .policy
            .evaluate(
                &subject,
                ResourceType::Tool,
                resource_id,
                action,
                params_map,
                category.as_deref(),
            )
            .await;

        if !decision.allowed {
            return match decision.denial {
                Some(DenialKind::RateLimited { retry_after_secs }) => GateOutcome::RateLimited {
                    reason: decision.reason,
                    retry_after_secs,
                },
                Some(DenialKind::ParameterViolation) => GateOutcome::ParameterViolation {
                    reason: decision.reason,
                },
                _ => GateOutcome::Denied {
                    reason: decision.reason,
                },
            };
        }

        let span = info_span!(
            "tool_execution",
            subject_id = %subject.subject_id,
            tool = resource_id,
            action,
        );
        self.execute_tool(subject, resource_id, action, params, decision)
            .instrument(span)
            .await
    }

    async fn execute_tool(
        &self,
        subject: Subject,
        resource_id: &str,
        action: &str,
        params: &Value,
        decision: crate::policy::PolicyDecision,
    ) -> GateOutcome {
        self.metrics.record_tool_invocation();
        let started = Instant::now();
        let invocation = self.catalog.invoke(resource_id, params, &subject);
        let result = tokio::time::timeout(self.config.tool_timeout, invocation).await;
        let elapsed = started.elapsed();

        // Soft restriction check: an overrun is audited but the result
        // still returns to the caller.
        if let Some(limit_secs) = decision.restrictions.max_execution_time {
            if elapsed > Duration::from_secs(limit_secs) {
                self.policy.record_execution_overrun(
                    &subject,
                    ResourceType::Tool,
                    resource_id,
                    action,
                    elapsed,
                    limit_secs,
                );
            }
        }

        match result {
            Ok(Ok(value)) => GateOutcome::Ok {
                result: value,
                subject_id: subject.subject_id,
                elapsed,
            },
            Ok(Err(CatalogError::NotFound { name })) => GateOutcome::NotFound { resource_id: name },
            Ok(Err(CatalogError::InvalidArguments { reason, .. })) => {
                GateOutcome::ParameterViolation { reason }
            }
            Ok(Err(CatalogError::Execution { name, message })) => {
                error!(tool = %name, error = %message, "tool execution failed");
                GateOutcome::Internal {
                    message: format!("tool {name} failed"),
                }
            }
            Err(_) => {
                warn!(tool = resource_id, timeout_secs = self.config.tool_timeout.as_secs(),
                      "tool execution timed out");
                self.policy.record_execution_overrun(
                    &subject,
                    ResourceType::Tool,
                    resource_id,
                    action,
                    elapsed,
                    self.config.tool_timeout.as_secs(),
                );
                GateOutcome::Timeout {
                    resource_id: resource_id.to_string(),
                }
            }
        }
    }
}
