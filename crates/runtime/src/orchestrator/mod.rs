//! Request orchestration: classify, policy-gate, dispatch, aggregate.
//!
//! Each request selects one or more agents — by explicit override or by
//! LLM classification with a keyword fallback — passes the
//! orchestrator→agent edge through the policy engine, and dispatches per
//! the requested pattern. Dispatch bumps the selected agent's load counter
//! for the duration of the call, including on cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::llm::{ChatMessage, LlmClient};
use crate::policy::{DenialKind, PolicyEngine};
use crate::registry::{AgentFilter, AgentRegistry};
use crate::types::{
    AgentRecord, AgentStatus, OrchestratorError, ResourceType, Subject, TransactionId,
};

mod dispatch;

pub use dispatch::{AgentDispatcher, DispatcherConfig};

/// Dispatch patterns supported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPattern {
    #[default]
    Simple,
    Sequential,
    Parallel,
    Loop,
}

impl DispatchPattern {
    pub fn all() -> [DispatchPattern; 4] {
        [
            DispatchPattern::Simple,
            DispatchPattern::Sequential,
            DispatchPattern::Parallel,
            DispatchPattern::Loop,
        ]
    }

    pub fn describe(&self) -> &'static str {
        match self {
            DispatchPattern::Simple => "Route to the single best agent",
            DispatchPattern::Sequential => "Chain agents, feeding each result into the next",
            DispatchPattern::Parallel => "Fan out to all requested agents concurrently",
            DispatchPattern::Loop => "Iterate one agent until done or the hop limit",
        }
    }
}

/// Caller-supplied routing overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchOverrides {
    pub pattern: Option<DispatchPattern>,
    pub agents: Option<Vec<String>>,
    pub agent_sequence: Option<Vec<String>>,
    pub max_hops: Option<u32>,
}

/// Orchestrator ingress payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub query: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub overrides: Option<DispatchOverrides>,
}

/// Per-agent outcome inside an aggregate response.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The orchestrator's answer for one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub transaction_id: String,
    pub pattern: DispatchPattern,
    pub selected_agent: Option<String>,
    pub selected_agents: Vec<String>,
    pub reasoning: String,
    pub response: Value,
    pub timestamp: DateTime<Utc>,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hop ceiling for the loop pattern when no override is given.
    pub loop_max_hops: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { loop_max_hops: 5 }
    }
}

#[derive(Debug, Deserialize)]
struct AgentSelection {
    agent: String,
    #[serde(default)]
    reasoning: String,
}

/// The orchestrator.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    llm: Option<Arc<LlmClient>>,
    dispatcher: AgentDispatcher,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        policy: Arc<PolicyEngine>,
        llm: Option<Arc<LlmClient>>,
        dispatcher: AgentDispatcher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            llm,
            dispatcher,
            config,
        }
    }

    /// Process one authenticated request end to end.
    pub async fn process(
        &self,
        subject: &Subject,
        envelope: RequestEnvelope,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let transaction_id = TransactionId::new().to_string();
        let overrides = envelope.overrides.clone().unwrap_or_default();
        let pattern = overrides.pattern.unwrap_or_default();

        let span = info_span!(
            "orchestration",
            %transaction_id,
            subject_id = %subject.subject_id,
            pattern = ?pattern,
        );

        let run = async {
            match pattern {
                DispatchPattern::Simple => self.run_simple(subject, &envelope, &overrides).await,
                DispatchPattern::Sequential => {
                    self.run_sequential(subject, &envelope, &overrides).await
                }
                DispatchPattern::Parallel => {
                    self.run_parallel(subject, &envelope, &overrides).await
                }
                DispatchPattern::Loop => self.run_loop(subject, &envelope, &overrides, None).await,
            }
        };
        let (selected, reasoning, response) = run.instrument(span).await?;

        Ok(OrchestrationResult {
            transaction_id,
            pattern,
            selected_agent: selected.first().cloned(),
            selected_agents: selected,
            reasoning,
            response,
            timestamp: Utc::now(),
        })
    }

    /// Loop pattern with a caller-supplied termination predicate, for
    /// programmatic embedding. The HTTP surface uses the default
    /// predicate (`response.done == true`).
    pub async fn process_loop_with(
        &self,
        subject: &Subject,
        envelope: RequestEnvelope,
        predicate: &(dyn Fn(&Value) -> bool + Send + Sync),
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let overrides = envelope.overrides.clone().unwrap_or_default();
        let transaction_id = TransactionId::new().to_string();
        let (selected, reasoning, response) = self
            .run_loop(subject, &envelope, &overrides, Some(predicate))
            .await?;
        Ok(OrchestrationResult {
            transaction_id,
            pattern: DispatchPattern::Loop,
            selected_agent: selected.first().cloned(),
            selected_agents: selected,
            reasoning,
            response,
            timestamp: Utc::now(),
        })
    }

    async fn run_simple(
        &self,
        subject: &Subject,
        envelope: &RequestEnvelope,
        overrides: &DispatchOverrides,
    ) -> Result<(Vec<String>, String, Value), OrchestratorError> {
        let (agent, reasoning) = match explicit_agents(overrides) {
            Some(ids) => {
                let agent_id = ids[0].clone();
                let agent = self.require_agent(&agent_id).await?;
                (agent, "Explicit agent override".to_string())
            }
            None => self.classify(&envelope.query).await?,
        };

        self.authorize(subject, &agent.agent_id).await?;

        let result = self
            .dispatch_with_load(subject, &agent, &envelope.query, envelope.context.as_ref())
            .await?;
        Ok((vec![agent.agent_id], reasoning, result))
    }

    async fn run_sequential(
        &self,
        subject: &Subject,
        envelope: &RequestEnvelope,
        overrides: &DispatchOverrides,
    ) -> Result<(Vec<String>, String, Value), OrchestratorError> {
        let ids = overrides
            .agent_sequence
            .clone()
            .or_else(|| overrides.agents.clone())
            .filter(|ids| !ids.is_empty())
            .ok_or(OrchestratorError::NoAgentAvailable)?;

        let mut agents = Vec::with_capacity(ids.len());
        for agent_id in &ids {
            let agent = self.require_agent(agent_id).await?;
            self.authorize(subject, agent_id).await?;
            agents.push(agent);
        }

        let mut steps = Vec::with_capacity(agents.len());
        let mut carried = envelope.context.clone();
        let mut last = Value::Null;
        for agent in &agents {
            let result = self
                .dispatch_with_load(subject, agent, &envelope.query, carried.as_ref())
                .await?;
            steps.push(json!({ "agent_id": agent.agent_id, "result": result }));
            carried = Some(json!({
                "context": envelope.context,
                "previous_response": result,
            }));
            last = result;
        }

        Ok((
            ids,
            "Sequential pipeline over explicit agents".to_string(),
            json!({ "steps": steps, "final": last }),
        ))
    }

    async fn run_parallel(
        &self,
        subject: &Subject,
        envelope: &RequestEnvelope,
        overrides: &DispatchOverrides,
    ) -> Result<(Vec<String>, String, Value), OrchestratorError> {
        let ids = explicit_agents(overrides).ok_or(OrchestratorError::NoAgentAvailable)?;

        let calls = ids.iter().map(|agent_id| {
            let agent_id = agent_id.clone();
            async move {
                let outcome = self
                    .call_one_best_effort(subject, &agent_id, envelope)
                    .await;
                (agent_id, outcome)
            }
        });

        let outcomes = join_all(calls).await;
        let mut by_agent = serde_json::Map::new();
        let mut results = Vec::with_capacity(outcomes.len());
        for (agent_id, outcome) in outcomes {
            by_agent.insert(agent_id.clone(), serde_json::to_value(&outcome).unwrap_or_default());
            results.push(outcome);
        }

        let succeeded = results.iter().filter(|o| o.success).count();
        Ok((
            ids,
            format!("Parallel fan-out: {succeeded}/{} agents succeeded", results.len()),
            json!({ "results": by_agent }),
        ))
    }

    async fn run_loop(
        &self,
        subject: &Subject,
        envelope: &RequestEnvelope,
        overrides: &DispatchOverrides,
        predicate: Option<&(dyn Fn(&Value) -> bool + Send + Sync)>,
    ) -> Result<(Vec<String>, String, Value), OrchestratorError> {
        let (agent, reasoning) = match explicit_agents(overrides) {
            Some(ids) => {
                let agent = self.require_agent(&ids[0]).await?;
                (agent, "Explicit agent override".to_string())
            }
            None => self.classify(&envelope.query).await?,
        };
        self.authorize(subject, &agent.agent_id).await?;

        let max_hops = overrides.max_hops.unwrap_or(self.config.loop_max_hops).max(1);
        let done = |value: &Value| -> bool {
            match predicate {
                Some(predicate) => predicate(value),
                None => value
                    .get("done")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }
        };

        let mut last = Value::Null;
        let mut hops = 0;
        let mut terminated = false;
        for hop in 0..max_hops {
            let context = json!({
                "context": envelope.context,
                "previous_response": if hop == 0 { Value::Null } else { last.clone() },
                "iteration": hop,
            });
            last = self
                .dispatch_with_load(subject, &agent, &envelope.query, Some(&context))
                .await?;
            hops = hop + 1;
            if done(&last) {
                terminated = true;
                break;
            }
        }

        Ok((
            vec![agent.agent_id],
            reasoning,
            json!({
                "iterations": hops,
                "terminated": terminated,
                "final": last,
            }),
        ))
    }

    /// Select an agent for a query: LLM classification with strict-JSON
    /// output, falling back to a capability keyword match.
    async fn classify(&self, query: &str) -> Result<(AgentRecord, String), OrchestratorError> {
        let agents = self.routable_agents().await?;
        if agents.is_empty() {
            return Err(OrchestratorError::NoAgentAvailable);
        }

        if let Some(llm) = &self.llm {
            match self.classify_llm(llm, query, &agents).await {
                Ok(selection) => return Ok(selection),
                Err(err) => {
                    warn!(error = %err, "LLM classification failed, using keyword fallback");
                }
            }
        }

        keyword_fallback(query, &agents).ok_or(OrchestratorError::NoAgentAvailable)
    }

    async fn classify_llm(
        &self,
        llm: &LlmClient,
        query: &str,
        agents: &[AgentRecord],
    ) -> Result<(AgentRecord, String), OrchestratorError> {
        let roster: Vec<Value> = agents
            .iter()
            .map(|a| {
                json!({
                    "agent_id": a.agent_id,
                    "description": a.description,
                    "capabilities": a.capabilities.iter().map(|c| json!({
                        "name": c.name,
                        "description": c.description,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();

        let system = "You are the routing brain of a multi-agent platform. \
                      Select the most appropriate agent for the user's request. \
                      Respond with strict JSON: {\"agent\": \"<agent_id>\", \"reasoning\": \"<why>\"} \
                      and nothing else.";
        let user = format!(
            "Request: {query}\n\nAvailable agents:\n{}",
            serde_json::to_string_pretty(&roster).unwrap_or_default()
        );

        let content = llm
            .chat(&[ChatMessage::system(system), ChatMessage::user(user)])
            .await
            .map_err(|e| OrchestratorError::Classification {
                reason: e.to_string(),
            })?;

        let selection: AgentSelection =
            serde_json::from_str(content.trim()).map_err(|e| OrchestratorError::Classification {
                reason: format!("selection was not strict JSON: {e}"),
            })?;

        let agent = agents
            .iter()
            .find(|a| a.agent_id == selection.agent)
            .cloned()
            .ok_or_else(|| OrchestratorError::AgentNotFound {
                agent_id: selection.agent.clone(),
            })?;

        debug!(agent_id = %agent.agent_id, "LLM selected agent");
        Ok((agent, selection.reasoning))
    }

    async fn routable_agents(&self) -> Result<Vec<AgentRecord>, OrchestratorError> {
        let all = self.registry.list(&AgentFilter::default()).await?;
        Ok(all.into_iter().filter(|a| a.status.routable()).collect())
    }

    async fn require_agent(&self, agent_id: &str) -> Result<AgentRecord, OrchestratorError> {
        let agent = self
            .registry
            .get(agent_id)
            .await?
            .ok_or_else(|| OrchestratorError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        if !agent.status.routable() {
            return Err(OrchestratorError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }
        Ok(agent)
    }

    /// Policy-gate the orchestrator→agent edge.
    async fn authorize(&self, subject: &Subject, agent_id: &str) -> Result<(), OrchestratorError> {
        let decision = self
            .policy
            .evaluate(subject, ResourceType::Agent, agent_id, "invoke", None, None)
            .await;
        if decision.allowed {
            return Ok(());
        }
        match decision.denial {
            Some(DenialKind::RateLimited { retry_after_secs }) => {
                Err(OrchestratorError::RateLimited {
                    agent_id: agent_id.to_string(),
                    reason: decision.reason,
                    retry_after_secs,
                })
            }
            _ => Err(OrchestratorError::Denied {
                agent_id: agent_id.to_string(),
                reason: decision.reason,
            }),
        }
    }

    async fn call_one_best_effort(
        &self,
        subject: &Subject,
        agent_id: &str,
        envelope: &RequestEnvelope,
    ) -> AgentOutcome {
        let attempt = async {
            let agent = self.require_agent(agent_id).await?;
            self.authorize(subject, agent_id).await?;
            self.dispatch_with_load(subject, &agent, &envelope.query, envelope.context.as_ref())
                .await
        };
        match attempt.await {
            Ok(result) => AgentOutcome {
                agent_id: agent_id.to_string(),
                success: true,
                result: Some(result),
                error: None,
            },
            Err(err) => AgentOutcome {
                agent_id: agent_id.to_string(),
                success: false,
                result: None,
                error: Some(err.to_string()),
            },
        }
    }

    /// Dispatch holding the agent's load counter; released on completion
    /// and, via the guard, on cancellation.
    async fn dispatch_with_load(
        &self,
        subject: &Subject,
        agent: &AgentRecord,
        query: &str,
        context: Option<&Value>,
    ) -> Result<Value, OrchestratorError> {
        let _load = LoadGuard::acquire(self.registry.clone(), &agent.agent_id).await;
        let result = self
            .dispatcher
            .call(agent, &subject.subject_id, query, context)
            .await?;
        Ok(result)
    }
}

fn explicit_agents(overrides: &DispatchOverrides) -> Option<Vec<String>> {
    overrides
        .agents
        .clone()
        .or_else(|| overrides.agent_sequence.clone())
        .filter(|ids| !ids.is_empty())
}

/// First healthy agent with a capability keyword appearing in the query;
/// degraded agents are considered when no healthy agent matches.
fn keyword_fallback(query: &str, agents: &[AgentRecord]) -> Option<(AgentRecord, String)> {
    let query = query.to_lowercase();
    for wanted in [AgentStatus::Healthy, AgentStatus::Degraded] {
        for agent in agents.iter().filter(|a| a.status == wanted) {
            for capability in &agent.capabilities {
                let matched = capability
                    .name
                    .split('_')
                    .chain(std::iter::once(capability.name.as_str()))
                    .any(|token| token.len() > 2 && query.contains(&token.to_lowercase()));
                if matched {
                    return Some((
                        agent.clone(),
                        format!(
                            "Fallback selection: capability '{}' matches the query",
                            capability.name
                        ),
                    ));
                }
            }
        }
    }
    None
}

/// Holds one unit of an agent's load; released asynchronously on drop so
/// cancelled dispatches also free the counter.
struct LoadGuard {
    registry: Arc<AgentRegistry>,
    agent_id: String,
}

impl LoadGuard {
    async fn acquire(registry: Arc<AgentRegistry>, agent_id: &str) -> Self {
        if let Err(err) = registry.adjust_load(agent_id, 1).await {
            warn!(agent_id, error = %err, "failed to bump agent load");
        }
        Self {
            registry,
            agent_id: agent_id.to_string(),
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let agent_id = std::mem::take(&mut self.agent_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = registry.adjust_load(&agent_id, -1).await;
            });
        }
    }
}
