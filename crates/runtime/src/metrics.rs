//! In-process counters for control-plane health.
//!
//! Counters are separate from tracing spans and emitted independently; the
//! snapshot is served over the API and can be scraped or exported by an
//! outer process.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counter set. Cheap to clone behind an `Arc`; all increments are
/// relaxed since counters only need eventual accuracy.
#[derive(Debug, Default)]
pub struct ControlPlaneMetrics {
    auth_proxy_calls: AtomicU64,
    auth_failures: AtomicU64,
    auth_cache_hits: AtomicU64,
    store_failures: AtomicU64,
    agent_registrations: AtomicU64,
    agent_lookups: AtomicU64,
    requests_gated: AtomicU64,
    tool_invocations: AtomicU64,
    dispatch_retries: AtomicU64,
    llm_fallbacks: AtomicU64,
}

impl ControlPlaneMetrics {
    pub fn record_auth_proxy_call(&self) {
        self.auth_proxy_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_cache_hit(&self) {
        self.auth_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration(&self) {
        self.agent_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self) {
        self.agent_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gate(&self) {
        self.requests_gated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_invocation(&self) {
        self.tool_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_retry(&self) {
        self.dispatch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_fallback(&self) {
        self.llm_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            auth_proxy_calls: self.auth_proxy_calls.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            auth_cache_hits: self.auth_cache_hits.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            agent_registrations: self.agent_registrations.load(Ordering::Relaxed),
            agent_lookups: self.agent_lookups.load(Ordering::Relaxed),
            requests_gated: self.requests_gated.load(Ordering::Relaxed),
            tool_invocations: self.tool_invocations.load(Ordering::Relaxed),
            dispatch_retries: self.dispatch_retries.load(Ordering::Relaxed),
            llm_fallbacks: self.llm_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Serialisable counter snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub auth_proxy_calls: u64,
    pub auth_failures: u64,
    pub auth_cache_hits: u64,
    pub store_failures: u64,
    pub agent_registrations: u64,
    pub agent_lookups: u64,
    pub requests_gated: u64,
    pub tool_invocations: u64,
    pub dispatch_retries: u64,
    pub llm_fallbacks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ControlPlaneMetrics::default();
        metrics.record_auth_failure();
        metrics.record_auth_failure();
        metrics.record_store_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.auth_failures, 2);
        assert_eq!(snap.store_failures, 1);
        assert_eq!(snap.requests_gated, 0);
    }

    #[test]
    fn snapshot_serialises() {
        let metrics = ControlPlaneMetrics::default();
        metrics.record_gate();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["requests_gated"], 1);
    }
}
