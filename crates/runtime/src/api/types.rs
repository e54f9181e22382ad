//! Request and response DTOs for the ingress API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::orchestrator::OrchestrationResult;

/// Successful `/process` response.
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub result: OrchestrationResult,
    pub transaction_id: String,
}

/// `/health` response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub agents_available: usize,
}

/// `/agents` response.
#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<String>,
    pub count: usize,
}

/// `/patterns` response.
#[derive(Debug, Serialize)]
pub struct PatternsResponse {
    pub patterns: Vec<String>,
    pub descriptions: std::collections::BTreeMap<String, String>,
}

/// Successful `/tool/{name}` response.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub result: serde_json::Value,
    pub elapsed_ms: u64,
}

/// Common error shape across every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            retry_after: None,
            status,
        }
    }

    pub fn unauthenticated() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "Missing, invalid or expired bearer token",
        )
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "access_denied", message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: u64) -> Self {
        let mut response = Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message);
        response.retry_after = Some(retry_after);
        response
    }

    pub fn parameter_violation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "parameter_violation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_serialises_only_when_set() {
        let plain = ErrorResponse::denied("no");
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("retry_after").is_none());

        let limited = ErrorResponse::rate_limited("slow down", 60);
        let json = serde_json::to_value(&limited).unwrap();
        assert_eq!(json["retry_after"], 60);
        assert_eq!(json["error"], "rate_limited");
    }
}
