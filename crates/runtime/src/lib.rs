//! Conductor control-plane runtime.
//!
//! The control plane for a fleet of LLM-backed worker agents: a dynamic
//! agent registry with capability-aware routing, a governance pipeline
//! (authentication → rate limiting → policy → execution → audit) fronting
//! every tool call, and an orchestrator that classifies and dispatches
//! user requests across the fleet.

pub mod api;
pub mod auth;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod governance;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod ratelimit;
pub mod registry;
pub mod store;
pub mod tools;
pub mod types;

// Re-export the types most embedders need.
pub use api::{AppState, HttpApiConfig};
pub use auth::{AuthConfig, AuthValidator, TokenCache};
pub use catalog::{ParameterSpec, Tool, ToolCatalog, ToolDescriptor};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RuntimeConfig;
pub use governance::{GateOutcome, GovernanceConfig, GovernancePipeline};
pub use llm::{ChatMessage, LlmClient, LlmConfig, LlmProviderConfig};
pub use metrics::{ControlPlaneMetrics, MetricsSnapshot};
pub use orchestrator::{
    AgentDispatcher, DispatchOverrides, DispatchPattern, DispatcherConfig, OrchestrationResult,
    Orchestrator, OrchestratorConfig, RequestEnvelope,
};
pub use policy::{
    ComplianceReport, PolicyDecision, PolicyDocument, PolicyEngine, PolicyEngineConfig,
    PolicySource, ViolationKind,
};
pub use ratelimit::{RateDecision, RateDimension, RateLimit, RateLimitConfig, SlidingWindowLimiter};
pub use registry::{
    AgentFilter, AgentRegistry, HeartbeatHandle, HeartbeatLoop, RegistryConfig, RegistryEvent,
};
pub use store::{MemoryStore, RedisStore, RedisStoreConfig, SharedStore};
pub use types::*;

use std::sync::Arc;

/// Fully assembled control plane: clock, store, limiter, auth, registry,
/// catalog, policy engine, governance pipeline and orchestrator, built
/// once at startup and threaded through explicitly.
pub struct ControlPlane {
    pub config: RuntimeConfig,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn SharedStore>,
    pub metrics: Arc<ControlPlaneMetrics>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub auth: Arc<AuthValidator>,
    pub registry: Arc<AgentRegistry>,
    pub catalog: Arc<ToolCatalog>,
    pub policy: Arc<PolicyEngine>,
    pub pipeline: Arc<GovernancePipeline>,
    pub orchestrator: Arc<Orchestrator>,
}

impl ControlPlane {
    /// Construct against the production Redis-backed store.
    pub async fn new(config: RuntimeConfig) -> Result<Self, ControlPlaneError> {
        let store = Arc::new(
            RedisStore::connect(RedisStoreConfig {
                url: config.store.url.clone(),
                ..RedisStoreConfig::default()
            })
            .await?,
        );
        Self::with_store(config, store, Arc::new(SystemClock)).await
    }

    /// Construct against any store/clock pair (tests use the in-memory
    /// store with a manual clock).
    pub async fn with_store(
        config: RuntimeConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ControlPlaneError> {
        let metrics = Arc::new(ControlPlaneMetrics::default());

        let limiter = Arc::new(SlidingWindowLimiter::new(
            store.clone(),
            clock.clone(),
            config.rate_limits.clone(),
            metrics.clone(),
        ));

        let auth = Arc::new(AuthValidator::new(
            config.auth.clone(),
            clock.clone(),
            metrics.clone(),
        ));

        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            clock.clone(),
            config.registry.clone(),
            metrics.clone(),
        ));

        let catalog = Arc::new(ToolCatalog::new());
        tools::register_builtin_tools(&catalog, registry.clone());

        let policy = Arc::new(
            PolicyEngine::load(
                store.clone(),
                clock.clone(),
                limiter.clone(),
                config.policy.clone(),
            )
            .await,
        );

        let pipeline = Arc::new(GovernancePipeline::new(
            auth.clone(),
            policy.clone(),
            catalog.clone(),
            metrics.clone(),
            config.governance.clone(),
        ));

        let llm = config
            .llm
            .clone()
            .map(|llm_config| Arc::new(LlmClient::new(llm_config, metrics.clone())));

        let dispatcher = AgentDispatcher::new(config.dispatcher.clone(), metrics.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            policy.clone(),
            llm,
            dispatcher,
            config.orchestrator.clone(),
        ));

        Ok(Self {
            config,
            clock,
            store,
            metrics,
            limiter,
            auth,
            registry,
            catalog,
            policy,
            pipeline,
            orchestrator,
        })
    }

    /// Shared state handed to the HTTP layer.
    pub fn app_state(&self) -> AppState {
        AppState {
            pipeline: self.pipeline.clone(),
            orchestrator: self.orchestrator.clone(),
            registry: self.registry.clone(),
            catalog: self.catalog.clone(),
            policy: self.policy.clone(),
            metrics: self.metrics.clone(),
            service_name: self.config.service_name.clone(),
        }
    }

    /// Serve the ingress API until shutdown.
    pub async fn serve(&self) -> Result<(), ControlPlaneError> {
        api::serve(self.app_state(), self.config.api.clone()).await
    }

    /// Register an embedded worker agent and keep it announcing itself on
    /// the configured heartbeat interval.
    pub async fn spawn_heartbeat(
        &self,
        record: AgentRecord,
    ) -> Result<HeartbeatHandle, ControlPlaneError> {
        let heartbeat = HeartbeatLoop::new(
            self.registry.clone(),
            record,
            self.config.heartbeat_interval,
        );
        heartbeat.spawn().await.map_err(ControlPlaneError::Registry)
    }
}
