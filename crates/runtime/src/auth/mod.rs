//! Bearer-token validation against the external auth proxy.
//!
//! Validation results are cached by token fingerprint for a bounded TTL;
//! a cache hit performs no proxy call. Proxy failures of any kind map to
//! "not authenticated" with a metric bump — the proxy's reasons are never
//! surfaced to callers and raw tokens are never logged.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::metrics::ControlPlaneMetrics;
use crate::types::{AuthError, Subject};

mod token_cache;

pub use token_cache::{fingerprint, TokenCache};

/// Auth proxy connection settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Base URL of the auth proxy (no trailing slash).
    pub proxy_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// How long a validated token stays cached.
    pub cache_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            proxy_url: "http://localhost:8180".to_string(),
            timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    user_id: String,
    #[serde(default)]
    roles: Vec<String>,
}

/// Successful login payload from the proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    #[serde(default)]
    has_permission: bool,
}

#[derive(Debug, Deserialize)]
struct RolesResponse {
    #[serde(default)]
    roles: Vec<String>,
}

/// Validates bearer tokens and answers permission/role queries.
pub struct AuthValidator {
    http: reqwest::Client,
    config: AuthConfig,
    cache: TokenCache,
    metrics: Arc<ControlPlaneMetrics>,
}

impl AuthValidator {
    pub fn new(
        config: AuthConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<ControlPlaneMetrics>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        let cache = TokenCache::new(config.cache_ttl, clock);
        Self {
            http,
            config,
            cache,
            metrics,
        }
    }

    /// Validate a bearer token, serving from cache when possible.
    ///
    /// Returns `None` for missing, invalid or expired tokens and for any
    /// proxy failure; negative results are never cached.
    pub async fn validate(&self, token: &str) -> Option<Subject> {
        if token.is_empty() {
            self.metrics.record_auth_failure();
            return None;
        }

        let token_hash = fingerprint(token);
        if let Some(subject) = self.cache.get(&token_hash) {
            self.metrics.record_auth_cache_hit();
            return Some(subject);
        }

        self.metrics.record_auth_proxy_call();
        match self.validate_remote(token).await {
            Ok(subject) => {
                debug!(subject_id = %subject.subject_id, "token validated");
                self.cache.insert(token_hash, subject.clone());
                Some(subject)
            }
            Err(err) => {
                warn!(error = %err, "token validation failed");
                self.metrics.record_auth_failure();
                None
            }
        }
    }

    /// Drop a token from the cache so the next validation hits the proxy.
    pub fn invalidate(&self, token: &str) -> bool {
        self.cache.invalidate(&fingerprint(token))
    }

    /// Authenticate a user by credentials.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let response = self
            .http
            .post(format!("{}/auth/login", self.config.proxy_url))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            self.metrics.record_auth_failure();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }
        response
            .json::<LoginResponse>()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }

    /// Ask the proxy whether a user may execute a tool. Defaults to deny on
    /// any failure.
    pub async fn check_permission(
        &self,
        user_id: &str,
        tool_name: &str,
        roles: &[String],
    ) -> bool {
        let result = self
            .http
            .post(format!("{}/auth/check-permission", self.config.proxy_url))
            .json(&serde_json::json!({
                "user_id": user_id,
                "tool_name": tool_name,
                "user_roles": roles,
            }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => response
                .json::<PermissionResponse>()
                .await
                .map(|p| p.has_permission)
                .unwrap_or(false),
            Ok(response) => {
                warn!(status = %response.status(), user_id, tool_name, "permission check rejected");
                false
            }
            Err(err) => {
                warn!(error = %err, user_id, tool_name, "permission check failed");
                false
            }
        }
    }

    /// Fetch a user's roles; falls back to the viewer role on failure.
    pub async fn user_roles(&self, user_id: &str) -> Vec<String> {
        let result = self
            .http
            .get(format!(
                "{}/auth/user/{}/roles",
                self.config.proxy_url, user_id
            ))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => response
                .json::<RolesResponse>()
                .await
                .map(|r| r.roles)
                .unwrap_or_else(|_| vec!["viewer".to_string()]),
            _ => vec!["viewer".to_string()],
        }
    }

    async fn validate_remote(&self, token: &str) -> Result<Subject, AuthError> {
        let response = self
            .http
            .post(format!("{}/auth/validate", self.config.proxy_url))
            .json(&ValidateRequest { token })
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        Ok(Subject::new(body.user_id, body.roles))
    }
}

fn request_error(err: reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::Timeout
    } else {
        AuthError::Upstream(err.to_string())
    }
}
