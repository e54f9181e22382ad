//! Sliding-window rate limiter backed by the shared store.
//!
//! Each `(dimension, id)` scope keeps a sorted set of request timestamps
//! under `rate_limit:{dimension}:{id}`. A check trims entries older than
//! the window, counts what remains, then appends the current request.
//!
//! The limiter **fails open**: when the store errors, the request is
//! allowed and the failure is recorded as a metric. Governed traffic must
//! never block on a store outage. Ordering under contention is best-effort,
//! so overshoot is bounded by the number of concurrent checkers.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::metrics::ControlPlaneMetrics;
use crate::store::SharedStore;

/// The scope a window applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateDimension {
    Global,
    User,
    Tool,
}

impl RateDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateDimension::Global => "global",
            RateDimension::User => "user",
            RateDimension::Tool => "tool",
        }
    }
}

impl std::fmt::Display for RateDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One window: at most `requests` calls per `window` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u64,
    #[serde(rename = "window")]
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(requests: u64, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-dimension limits plus the global burst allowance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub global: RateLimit,
    pub user: RateLimit,
    pub tool: RateLimit,
    /// Extra allowance applied on top of the global limit.
    #[serde(default)]
    pub burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: RateLimit::new(1000, 3600),
            user: RateLimit::new(100, 3600),
            tool: RateLimit::new(50, 3600),
            burst: 0,
        }
    }
}

impl RateLimitConfig {
    fn limit_for(&self, dimension: RateDimension) -> RateLimit {
        match dimension {
            RateDimension::Global => self.global,
            RateDimension::User => self.user,
            RateDimension::Tool => self.tool,
        }
    }

    /// Burst allowance applies to the global dimension only.
    fn with_burst(&self, dimension: RateDimension, limit: RateLimit) -> RateLimit {
        match dimension {
            RateDimension::Global => RateLimit::new(
                limit.requests.saturating_add(self.burst),
                limit.window_secs,
            ),
            _ => limit,
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub window_secs: u64,
    pub remaining: u64,
    /// Epoch seconds after which the window fully resets.
    pub reset_at: u64,
}

impl RateDecision {
    fn open(limit: RateLimit, now: f64) -> Self {
        Self {
            allowed: true,
            limit: limit.requests,
            window_secs: limit.window_secs,
            remaining: limit.requests,
            reset_at: now as u64 + limit.window_secs,
        }
    }
}

/// Sliding-window limiter over the shared store.
pub struct SlidingWindowLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    metrics: Arc<ControlPlaneMetrics>,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
        metrics: Arc<ControlPlaneMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            metrics,
        }
    }

    fn key(dimension: RateDimension, id: &str) -> String {
        format!("rate_limit:{}:{}", dimension.as_str(), id)
    }

    /// Check and consume one request in the scope's window.
    pub async fn check(&self, dimension: RateDimension, id: &str) -> RateDecision {
        self.check_with(dimension, id, None).await
    }

    /// Like [`check`](Self::check) but with a per-resource limit override
    /// from a policy restriction.
    pub async fn check_with(
        &self,
        dimension: RateDimension,
        id: &str,
        override_limit: Option<RateLimit>,
    ) -> RateDecision {
        let base = override_limit.unwrap_or_else(|| self.config.limit_for(dimension));
        let limit = self.config.with_burst(dimension, base);
        let now = self.clock.epoch_secs();

        match self.consume(dimension, id, limit, now).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    dimension = %dimension,
                    id,
                    error = %err,
                    "rate limit backend failed, allowing request"
                );
                self.metrics.record_store_failure();
                RateDecision::open(limit, now)
            }
        }
    }

    /// Report the current window state without consuming a request.
    pub async fn peek(&self, dimension: RateDimension, id: &str) -> RateDecision {
        let limit = self
            .config
            .with_burst(dimension, self.config.limit_for(dimension));
        let now = self.clock.epoch_secs();
        let key = Self::key(dimension, id);
        let window_start = now - limit.window_secs as f64;

        let count = match self.store.zset_count(&key, window_start, now).await {
            Ok(count) => count,
            Err(err) => {
                warn!(dimension = %dimension, id, error = %err, "rate limit peek failed");
                self.metrics.record_store_failure();
                0
            }
        };

        RateDecision {
            allowed: count < limit.requests,
            limit: limit.requests,
            window_secs: limit.window_secs,
            remaining: limit.requests.saturating_sub(count),
            reset_at: now as u64 + limit.window_secs,
        }
    }

    async fn consume(
        &self,
        dimension: RateDimension,
        id: &str,
        limit: RateLimit,
        now: f64,
    ) -> Result<RateDecision, crate::types::StoreError> {
        let key = Self::key(dimension, id);
        let window_start = now - limit.window_secs as f64;

        self.store
            .zset_remove_by_score(&key, f64::NEG_INFINITY, window_start)
            .await?;
        let count = self.store.zset_card(&key).await?;

        // Member carries a nonce so two checks in the same instant both land.
        let nonce: u32 = rand::thread_rng().gen();
        let member = format!("{now:.6}:{nonce:08x}");
        self.store.zset_add(&key, now, &member).await?;
        self.store.expire(&key, limit.window()).await?;

        let allowed = count < limit.requests;
        if !allowed {
            debug!(dimension = %dimension, id, count, limit = limit.requests, "rate limit exceeded");
        }

        Ok(RateDecision {
            allowed,
            limit: limit.requests,
            window_secs: limit.window_secs,
            remaining: limit.requests.saturating_sub(count).saturating_sub(1),
            reset_at: now as u64 + limit.window_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter(config: RateLimitConfig) -> (Arc<ManualClock>, Arc<MemoryStore>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = SlidingWindowLimiter::new(
            store.clone(),
            clock.clone(),
            config,
            Arc::new(ControlPlaneMetrics::default()),
        );
        (clock, store, limiter)
    }

    fn tool_config(requests: u64, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            tool: RateLimit::new(requests, window_secs),
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn allows_until_limit_then_denies() {
        let (_, _, limiter) = limiter(tool_config(3, 60));

        for _ in 0..3 {
            let decision = limiter.check(RateDimension::Tool, "t1").await;
            assert!(decision.allowed);
        }
        let fourth = limiter.check(RateDimension::Tool, "t1").await;
        assert!(!fourth.allowed);
        assert_eq!(fourth.remaining, 0);
    }

    #[tokio::test]
    async fn window_slides() {
        let (clock, _, limiter) = limiter(tool_config(2, 60));

        assert!(limiter.check(RateDimension::Tool, "t1").await.allowed);
        assert!(limiter.check(RateDimension::Tool, "t1").await.allowed);
        assert!(!limiter.check(RateDimension::Tool, "t1").await.allowed);

        clock.advance(Duration::from_secs(61));
        assert!(limiter.check(RateDimension::Tool, "t1").await.allowed);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let (_, _, limiter) = limiter(tool_config(1, 60));

        assert!(limiter.check(RateDimension::Tool, "t1").await.allowed);
        assert!(limiter.check(RateDimension::Tool, "t2").await.allowed);
        assert!(!limiter.check(RateDimension::Tool, "t1").await.allowed);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let (_, store, limiter) = limiter(tool_config(1, 60));
        store.set_failing(true);

        for _ in 0..5 {
            let decision = limiter.check(RateDimension::Tool, "t1").await;
            assert!(decision.allowed);
        }
    }

    #[tokio::test]
    async fn burst_extends_global_only() {
        let config = RateLimitConfig {
            global: RateLimit::new(1, 60),
            user: RateLimit::new(1, 60),
            burst: 2,
            ..RateLimitConfig::default()
        };
        let (_, _, limiter) = limiter(config);

        for _ in 0..3 {
            assert!(limiter.check(RateDimension::Global, "global").await.allowed);
        }
        assert!(!limiter.check(RateDimension::Global, "global").await.allowed);

        assert!(limiter.check(RateDimension::User, "u1").await.allowed);
        assert!(!limiter.check(RateDimension::User, "u1").await.allowed);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (_, _, limiter) = limiter(tool_config(2, 60));

        for _ in 0..10 {
            assert!(limiter.peek(RateDimension::Tool, "t1").await.allowed);
        }
        assert!(limiter.check(RateDimension::Tool, "t1").await.allowed);

        let info = limiter.peek(RateDimension::Tool, "t1").await;
        assert!(info.allowed);
        assert_eq!(info.remaining, 1);
    }

    #[tokio::test]
    async fn override_limit_wins() {
        let (_, _, limiter) = limiter(tool_config(100, 60));
        let tight = Some(RateLimit::new(1, 60));

        assert!(
            limiter
                .check_with(RateDimension::Tool, "t1", tight)
                .await
                .allowed
        );
        assert!(
            !limiter
                .check_with(RateDimension::Tool, "t1", tight)
                .await
                .allowed
        );
    }
}
