//! Policy engine: role access, rate windows, parameter validation, audit.
//!
//! Every governed call asks [`PolicyEngine::evaluate`] for a verdict. The
//! document is swapped atomically on reload — in-flight decisions keep the
//! reference they loaded, future calls see the new document. Source
//! priority: document store, then YAML file, then built-in defaults.
//! Misconfiguration fails closed: the built-in defaults deny.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

use crate::clock::Clock;
use crate::ratelimit::{RateDecision, RateDimension, SlidingWindowLimiter};
use crate::store::SharedStore;
use crate::types::{PolicyError, ResourceType, Subject};

mod document;
mod violations;

pub use document::{
    DefaultDecision, PolicyDocument, RateLimitsSection, ResourcePolicy, Restrictions, RoleAccess,
};
pub use violations::{ViolationKind, ViolationLog, ViolationRecord};

/// Where the active document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    DocumentStore,
    YamlFile,
    BuiltinDefaults,
}

/// Why a request was denied, shaped for transport mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialKind {
    AccessDenied,
    RateLimited { retry_after_secs: u64 },
    ParameterViolation,
}

/// Per-call verdict. Never persisted.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub restrictions: Restrictions,
    pub expires_at: Option<DateTime<Utc>>,
    pub denial: Option<DenialKind>,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>, restrictions: Restrictions) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            restrictions,
            expires_at: None,
            denial: None,
        }
    }

    fn deny(reason: impl Into<String>, denial: DenialKind) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            restrictions: Restrictions::default(),
            expires_at: None,
            denial: Some(denial),
        }
    }
}

/// Compliance monitoring rollup.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    /// Percentage of evaluated requests that were allowed.
    pub compliance_rate: f64,
    pub policy_violations: u64,
    pub rate_limit_hits: u64,
    pub execution_time_violations: u64,
    pub parameter_violations: u64,
    pub violations_by_type: BTreeMap<String, u64>,
    pub violations_by_user: BTreeMap<String, u64>,
    pub violations_by_resource: BTreeMap<String, u64>,
    pub policy_source: PolicySource,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct PolicyEngineConfig {
    /// YAML fallback path, consulted when the document store has no policy.
    pub yaml_path: Option<PathBuf>,
    /// Document-store key holding the JSON policy document.
    pub store_key: String,
    /// Violation ring capacity.
    pub violation_capacity: usize,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            yaml_path: None,
            store_key: "policy:document".to_string(),
            violation_capacity: 1024,
        }
    }
}

/// The policy engine.
pub struct PolicyEngine {
    document: ArcSwap<PolicyDocument>,
    source: Mutex<PolicySource>,
    limiter: Arc<SlidingWindowLimiter>,
    violations: ViolationLog,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: PolicyEngineConfig,
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl PolicyEngine {
    /// Load the engine from its sources. Never fails: when the store and
    /// the YAML file are both unavailable, built-in (deny-by-default)
    /// policies apply.
    pub async fn load(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        limiter: Arc<SlidingWindowLimiter>,
        config: PolicyEngineConfig,
    ) -> Self {
        let (document, source) = Self::load_document(&*store, &config).await;
        info!(?source, "policy engine initialised");
        Self {
            document: ArcSwap::from_pointee(document),
            source: Mutex::new(source),
            limiter,
            violations: ViolationLog::new(config.violation_capacity),
            store,
            clock,
            config,
            total: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    /// Atomically swap in a freshly loaded document.
    pub async fn reload(&self) -> Result<PolicySource, PolicyError> {
        let (document, source) = Self::load_document(&*self.store, &self.config).await;
        self.document.store(Arc::new(document));
        *self.source.lock() = source;
        info!(?source, "policies reloaded");
        Ok(source)
    }

    /// The active document (readers hold the reference for one decision).
    pub fn document(&self) -> Arc<PolicyDocument> {
        self.document.load_full()
    }

    pub fn source(&self) -> PolicySource {
        *self.source.lock()
    }

    /// Evaluate whether `subject` may perform `action` on a resource.
    pub async fn evaluate(
        &self,
        subject: &Subject,
        resource_type: ResourceType,
        resource_id: &str,
        action: &str,
        params: Option<&serde_json::Map<String, serde_json::Value>>,
        category: Option<&str>,
    ) -> PolicyDecision {
        let span = info_span!(
            "policy_evaluate",
            subject_id = %subject.subject_id,
            resource_type = %resource_type,
            resource_id,
            action,
        );
        self.evaluate_inner(subject, resource_type, resource_id, action, params, category)
            .instrument(span)
            .await
    }

    async fn evaluate_inner(
        &self,
        subject: &Subject,
        resource_type: ResourceType,
        resource_id: &str,
        action: &str,
        params: Option<&serde_json::Map<String, serde_json::Value>>,
        category: Option<&str>,
    ) -> PolicyDecision {
        // Full reference: the document is held for the whole decision and
        // must not pin the swap slot across suspension points.
        let doc = self.document.load_full();
        self.total.fetch_add(1, Ordering::Relaxed);

        if !doc.enabled {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return PolicyDecision::allow("Policy engine disabled", Restrictions::default());
        }

        // Role access; deny lists override everything.
        if !self.role_grants(&doc, subject, resource_type, resource_id) {
            self.denied.fetch_add(1, Ordering::Relaxed);
            self.record_violation(
                subject,
                resource_type,
                resource_id,
                action,
                ViolationKind::AccessDenied,
                json!({ "roles": subject.roles }),
            );
            return PolicyDecision::deny("Access denied by policy", DenialKind::AccessDenied);
        }

        let restrictions = doc.restrictions_for(resource_type, resource_id, category);

        // Rate windows, in order: global, per-subject, per-resource.
        let checks = [
            (
                RateDimension::Global,
                "global".to_string(),
                Some(doc.rate_limits.global),
            ),
            (
                RateDimension::User,
                subject.subject_id.clone(),
                Some(doc.rate_limits.per_user),
            ),
            (
                RateDimension::Tool,
                resource_id.to_string(),
                Some(restrictions.rate_limit.unwrap_or(doc.rate_limits.per_tool)),
            ),
        ];
        for (dimension, id, limit) in checks {
            let decision = self.limiter.check_with(dimension, &id, limit).await;
            if !decision.allowed {
                self.denied.fetch_add(1, Ordering::Relaxed);
                self.record_violation(
                    subject,
                    resource_type,
                    resource_id,
                    action,
                    ViolationKind::RateLimitExceeded,
                    rate_details(dimension, &decision),
                );
                return PolicyDecision::deny(
                    "Rate limit exceeded",
                    DenialKind::RateLimited {
                        retry_after_secs: decision.window_secs,
                    },
                );
            }
        }

        // Parameter validation against the merged restrictions.
        if let Some(params) = params {
            if let Some(offending) = self.parameter_violation(&restrictions, params) {
                self.denied.fetch_add(1, Ordering::Relaxed);
                self.record_violation(
                    subject,
                    resource_type,
                    resource_id,
                    action,
                    ViolationKind::ParameterViolation,
                    json!({ "parameter": offending.0 }),
                );
                return PolicyDecision::deny(offending.1, DenialKind::ParameterViolation);
            }
        }

        self.allowed.fetch_add(1, Ordering::Relaxed);
        PolicyDecision::allow("Access granted", restrictions)
    }

    /// Record that a governed execution overran its time restriction.
    pub fn record_execution_overrun(
        &self,
        subject: &Subject,
        resource_type: ResourceType,
        resource_id: &str,
        action: &str,
        elapsed: Duration,
        limit_secs: u64,
    ) {
        warn!(
            subject_id = %subject.subject_id,
            resource_id,
            elapsed_secs = elapsed.as_secs_f64(),
            limit_secs,
            "execution time restriction exceeded"
        );
        self.record_violation(
            subject,
            resource_type,
            resource_id,
            action,
            ViolationKind::ExecutionTimeViolation,
            json!({
                "elapsed_secs": elapsed.as_secs_f64(),
                "limit_secs": limit_secs,
            }),
        );
    }

    /// Newest-first audit trail, at most `limit` entries.
    pub fn audit_trail(&self, limit: usize) -> Vec<ViolationRecord> {
        self.violations.newest_first(limit)
    }

    pub fn compliance_report(&self) -> ComplianceReport {
        let total = self.total.load(Ordering::Relaxed);
        let allowed = self.allowed.load(Ordering::Relaxed);
        let denied = self.denied.load(Ordering::Relaxed);
        let compliance_rate = if total > 0 {
            allowed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        ComplianceReport {
            total_requests: total,
            allowed_requests: allowed,
            denied_requests: denied,
            compliance_rate,
            policy_violations: self.violations.total_recorded(),
            rate_limit_hits: self.violations.count(ViolationKind::RateLimitExceeded),
            execution_time_violations: self
                .violations
                .count(ViolationKind::ExecutionTimeViolation),
            parameter_violations: self.violations.count(ViolationKind::ParameterViolation),
            violations_by_type: self.violations.by_kind(),
            violations_by_user: self.violations.by_subject(),
            violations_by_resource: self.violations.by_resource(),
            policy_source: self.source(),
        }
    }

    fn role_grants(
        &self,
        doc: &PolicyDocument,
        subject: &Subject,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> bool {
        let resource_policy = doc.resource(resource_type);
        if resource_policy.deny_list.iter().any(|d| d == resource_id) {
            return false;
        }

        let granted = subject
            .roles
            .iter()
            .filter_map(|role| doc.roles.get(role))
            .flat_map(|access| access.for_resource(resource_type))
            .chain(resource_policy.allow_list.iter())
            .any(|entry| entry == "*" || entry == resource_id);

        granted || doc.default_decision == DefaultDecision::Allow
    }

    fn parameter_violation(
        &self,
        restrictions: &Restrictions,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<(String, String)> {
        if restrictions.constrains_allowed() {
            if let Some(allowed) = &restrictions.allowed_parameters {
                for key in params.keys() {
                    if !allowed.iter().any(|a| a == key || a == "*") {
                        return Some((
                            key.clone(),
                            format!("Parameter violation: parameter '{key}' not allowed"),
                        ));
                    }
                }
            }
        }
        for key in params.keys() {
            if restrictions.forbidden_parameters.iter().any(|f| f == key) {
                return Some((
                    key.clone(),
                    format!("Parameter violation: parameter '{key}' is forbidden"),
                ));
            }
        }
        None
    }

    fn record_violation(
        &self,
        subject: &Subject,
        resource_type: ResourceType,
        resource_id: &str,
        action: &str,
        kind: ViolationKind,
        details: serde_json::Value,
    ) {
        warn!(
            subject_id = %subject.subject_id,
            resource_type = %resource_type,
            resource_id,
            violation = %kind,
            "policy violation recorded"
        );
        self.violations.record(ViolationRecord {
            timestamp: self.clock.now_utc(),
            subject_id: subject.subject_id.clone(),
            resource_type,
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            kind,
            details,
        });
    }

    async fn load_document(
        store: &dyn SharedStore,
        config: &PolicyEngineConfig,
    ) -> (PolicyDocument, PolicySource) {
        match store.get(&config.store_key).await {
            Ok(Some(raw)) => match PolicyDocument::from_json_str(&raw) {
                Ok(document) => return (document, PolicySource::DocumentStore),
                Err(err) => {
                    warn!(error = %err, "stored policy document is invalid, trying YAML");
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "document store unavailable, trying YAML");
            }
        }

        if let Some(path) = &config.yaml_path {
            match PolicyDocument::from_yaml_file(path) {
                Ok(document) => return (document, PolicySource::YamlFile),
                Err(err) => {
                    warn!(path = %path.display(), error = %err,
                          "policy YAML unavailable, using built-in defaults");
                }
            }
        }

        (PolicyDocument::builtin_defaults(), PolicySource::BuiltinDefaults)
    }
}

fn rate_details(dimension: RateDimension, decision: &RateDecision) -> serde_json::Value {
    json!({
        "dimension": dimension.as_str(),
        "limit": decision.limit,
        "window_secs": decision.window_secs,
        "reset_at": decision.reset_at,
    })
}
