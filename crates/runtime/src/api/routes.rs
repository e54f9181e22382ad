//! Ingress route handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::types::{
    AgentsResponse, ErrorResponse, HealthResponse, PatternsResponse, ProcessResponse,
    ToolResponse,
};
use crate::catalog::ToolCatalog;
use crate::governance::{GateOutcome, GovernancePipeline};
use crate::metrics::ControlPlaneMetrics;
use crate::orchestrator::{DispatchPattern, Orchestrator, RequestEnvelope};
use crate::policy::PolicyEngine;
use crate::registry::{AgentFilter, AgentRegistry};
use crate::types::{AgentStatus, DispatchError, OrchestratorError};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<GovernancePipeline>,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<AgentRegistry>,
    pub catalog: Arc<ToolCatalog>,
    pub policy: Arc<PolicyEngine>,
    pub metrics: Arc<ControlPlaneMetrics>,
    pub service_name: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    let available = match state
        .registry
        .list(&AgentFilter::default().with_status(AgentStatus::Healthy))
        .await
    {
        Ok(agents) => agents.len(),
        Err(_) => 0,
    };
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.service_name.clone(),
        agents_available: available,
    })
    .into_response()
}

/// POST /process
pub async fn process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<RequestEnvelope>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return ErrorResponse::unauthenticated().into_response();
    };
    let Some(subject) = state.pipeline.authenticate(token).await else {
        return ErrorResponse::unauthenticated().into_response();
    };

    match state.orchestrator.process(&subject, envelope).await {
        Ok(result) => {
            let transaction_id = result.transaction_id.clone();
            Json(ProcessResponse {
                success: true,
                result,
                transaction_id,
            })
            .into_response()
        }
        Err(err) => orchestrator_error(err).into_response(),
    }
}

/// GET /agents
pub async fn list_agents(State(state): State<AppState>) -> Response {
    match state.registry.list(&AgentFilter::default()).await {
        Ok(agents) => {
            let agents: Vec<String> = agents.into_iter().map(|a| a.agent_id).collect();
            Json(AgentsResponse {
                count: agents.len(),
                agents,
            })
            .into_response()
        }
        Err(err) => ErrorResponse::internal(err.to_string()).into_response(),
    }
}

/// GET /patterns
pub async fn patterns() -> Response {
    let mut descriptions = std::collections::BTreeMap::new();
    let mut names = Vec::new();
    for pattern in DispatchPattern::all() {
        let name = serde_json::to_value(pattern)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        descriptions.insert(name.clone(), pattern.describe().to_string());
        names.push(name);
    }
    Json(PatternsResponse {
        patterns: names,
        descriptions,
    })
    .into_response()
}

/// POST /tool/{name}
pub async fn invoke_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return ErrorResponse::unauthenticated().into_response();
    };
    let params = body.map(|Json(value)| value).unwrap_or(Value::Null);

    let outcome = state.pipeline.gate(token, &name, "execute", &params).await;
    gate_outcome(outcome)
}

fn gate_outcome(outcome: GateOutcome) -> Response {
    match outcome {
        GateOutcome::Ok {
            result, elapsed, ..
        } => Json(ToolResponse {
            success: true,
            result,
            elapsed_ms: elapsed.as_millis() as u64,
        })
        .into_response(),
        GateOutcome::Unauthenticated => ErrorResponse::unauthenticated().into_response(),
        GateOutcome::Denied { reason } => ErrorResponse::denied(reason).into_response(),
        GateOutcome::RateLimited {
            reason,
            retry_after_secs,
        } => ErrorResponse::rate_limited(reason, retry_after_secs).into_response(),
        GateOutcome::ParameterViolation { reason } => {
            ErrorResponse::parameter_violation(reason).into_response()
        }
        GateOutcome::NotFound { resource_id } => {
            ErrorResponse::not_found(format!("tool not found: {resource_id}")).into_response()
        }
        GateOutcome::Timeout { resource_id } => {
            ErrorResponse::upstream_timeout(format!("tool timed out: {resource_id}"))
                .into_response()
        }
        GateOutcome::Internal { message } => ErrorResponse::internal(message).into_response(),
    }
}

/// GET /tools — governed tool metadata listing.
pub async fn list_tools(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return ErrorResponse::unauthenticated().into_response();
    };
    if state.pipeline.authenticate(token).await.is_none() {
        return ErrorResponse::unauthenticated().into_response();
    }
    Json(serde_json::json!({
        "tools": state.catalog.list(None),
        "categories": state.catalog.categories(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    50
}

/// GET /compliance/metrics
pub async fn compliance_metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return ErrorResponse::unauthenticated().into_response();
    };
    if state.pipeline.authenticate(token).await.is_none() {
        return ErrorResponse::unauthenticated().into_response();
    }
    Json(state.policy.compliance_report()).into_response()
}

/// GET /compliance/audit?limit=N
pub async fn audit_trail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return ErrorResponse::unauthenticated().into_response();
    };
    if state.pipeline.authenticate(token).await.is_none() {
        return ErrorResponse::unauthenticated().into_response();
    }
    let entries = state.policy.audit_trail(query.limit);
    Json(serde_json::json!({
        "count": entries.len(),
        "entries": entries,
    }))
    .into_response()
}

/// POST /policies/reload — admin-only.
pub async fn reload_policies(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return ErrorResponse::unauthenticated().into_response();
    };
    let Some(subject) = state.pipeline.authenticate(token).await else {
        return ErrorResponse::unauthenticated().into_response();
    };
    if !subject.has_role("admin") {
        return ErrorResponse::denied("policy reload requires the admin role").into_response();
    }

    match state.policy.reload().await {
        Ok(source) => {
            debug!(?source, "policies reloaded via API");
            Json(serde_json::json!({ "reloaded": true, "source": source })).into_response()
        }
        Err(err) => ErrorResponse::internal(err.to_string()).into_response(),
    }
}

/// GET /metrics
pub async fn metrics_snapshot(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return ErrorResponse::unauthenticated().into_response();
    };
    if state.pipeline.authenticate(token).await.is_none() {
        return ErrorResponse::unauthenticated().into_response();
    }
    Json(state.metrics.snapshot()).into_response()
}

fn orchestrator_error(err: OrchestratorError) -> ErrorResponse {
    match err {
        OrchestratorError::NoAgentAvailable => {
            ErrorResponse::not_found("no agent available for this request")
        }
        OrchestratorError::AgentNotFound { agent_id } => {
            ErrorResponse::not_found(format!("agent not found: {agent_id}"))
        }
        OrchestratorError::Denied { reason, .. } => ErrorResponse::denied(reason),
        OrchestratorError::RateLimited {
            reason,
            retry_after_secs,
            ..
        } => ErrorResponse::rate_limited(reason, retry_after_secs),
        OrchestratorError::Classification { reason } => {
            ErrorResponse::internal(format!("agent classification failed: {reason}"))
        }
        OrchestratorError::Dispatch(DispatchError::Timeout {
            agent_id,
            timeout_secs,
        }) => ErrorResponse::upstream_timeout(format!(
            "agent {agent_id} timed out after {timeout_secs}s"
        )),
        OrchestratorError::Dispatch(err) => ErrorResponse::internal(err.to_string()),
        OrchestratorError::Registry(err) => ErrorResponse::internal(err.to_string()),
    }
}
