//! Dynamic agent registry with capability-aware selection.
//!
//! Records live in the shared store under `agent:{id}` with secondary
//! indices `capability:{name}` and `tag:{name}`. Records carry a TTL
//! (default 300 s) refreshed on every heartbeat; an agent that stops
//! heartbeating is lazily evicted the next time it is read. Index
//! mutations are best-effort — a partial failure logs and continues, and
//! the next heartbeat or re-register reconciles.
//!
//! Registration and deregistration publish events on the `agent_events`
//! channel, best-effort and unordered across publishers.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::metrics::ControlPlaneMetrics;
use crate::store::SharedStore;
use crate::types::{
    AgentCapability, AgentRecord, AgentResources, AgentStatus, RegistryError, StoreError,
};

mod heartbeat;

pub use heartbeat::{HeartbeatHandle, HeartbeatLoop};

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// TTL on agent records; refreshed by heartbeats.
    pub record_ttl: Duration,
    /// Pub/sub channel for registration events.
    pub events_channel: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(300),
            events_channel: "agent_events".to_string(),
        }
    }
}

/// Event published when the registry's membership changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registration {
        agent_id: String,
        agent_name: String,
        timestamp: DateTime<Utc>,
    },
    Unregistration {
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Filter for [`AgentRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub tags: Vec<String>,
    pub capability: Option<String>,
}

impl AgentFilter {
    pub fn by_capability(name: impl Into<String>) -> Self {
        Self {
            capability: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// The shared agent registry.
pub struct AgentRegistry {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    metrics: Arc<ControlPlaneMetrics>,
}

fn agent_key(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

fn capability_key(name: &str) -> String {
    format!("capability:{name}")
}

fn tag_key(name: &str) -> String {
    format!("tag:{name}")
}

impl AgentRegistry {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
        metrics: Arc<ControlPlaneMetrics>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            metrics,
        }
    }

    pub fn record_ttl(&self) -> Duration {
        self.config.record_ttl
    }

    /// Register an agent, replacing any previous record with the same id.
    ///
    /// The record hash, capability and tag indices are written and the TTL
    /// armed; a registration event is published. Index failures log and
    /// continue — the next heartbeat reconciles.
    pub async fn register(&self, mut record: AgentRecord) -> Result<(), RegistryError> {
        if record.agent_id.is_empty() {
            return Err(RegistryError::InvalidRecord {
                reason: "agent_id must not be empty".to_string(),
            });
        }
        if record.current_load > record.max_concurrent {
            return Err(RegistryError::InvalidRecord {
                reason: format!(
                    "current_load {} exceeds max_concurrent {}",
                    record.current_load, record.max_concurrent
                ),
            });
        }

        record.last_heartbeat = self.clock.now_utc();

        // Replacement: clear index entries the new record no longer claims.
        if let Ok(Some(previous)) = self.read_record(&record.agent_id).await {
            self.remove_stale_indices(&previous, &record).await;
        }

        let key = agent_key(&record.agent_id);
        self.store
            .hash_set(&key, &record_to_fields(&record))
            .await?;

        for capability in &record.capabilities {
            if let Err(err) = self
                .store
                .set_add(&capability_key(&capability.name), &record.agent_id)
                .await
            {
                warn!(agent_id = %record.agent_id, capability = %capability.name, error = %err,
                      "capability index update failed");
            }
        }
        for tag in &record.tags {
            if let Err(err) = self.store.set_add(&tag_key(tag), &record.agent_id).await {
                warn!(agent_id = %record.agent_id, tag = %tag, error = %err,
                      "tag index update failed");
            }
        }

        if let Err(err) = self.store.expire(&key, self.config.record_ttl).await {
            warn!(agent_id = %record.agent_id, error = %err, "failed to arm record TTL");
        }

        self.publish_event(RegistryEvent::Registration {
            agent_id: record.agent_id.clone(),
            agent_name: record.name.clone(),
            timestamp: self.clock.now_utc(),
        })
        .await;

        self.metrics.record_registration();
        info!(agent_id = %record.agent_id, name = %record.name, "agent registered");
        Ok(())
    }

    /// Refresh an agent's status, heartbeat timestamp and optionally its
    /// load. Fails when the record is gone — the caller must re-register.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_load: Option<u32>,
    ) -> Result<(), RegistryError> {
        let record = self
            .read_record(agent_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                agent_id: agent_id.to_string(),
            })?;

        let mut fields = vec![
            ("status".to_string(), status.as_str().to_string()),
            (
                "last_heartbeat".to_string(),
                self.clock.now_utc().to_rfc3339(),
            ),
        ];
        if let Some(load) = current_load {
            let load = load.min(record.max_concurrent);
            fields.push(("current_load".to_string(), load.to_string()));
        }

        let key = agent_key(agent_id);
        self.store.hash_set(&key, &fields).await?;
        self.store.expire(&key, self.config.record_ttl).await?;
        debug!(agent_id, status = %status, "heartbeat accepted");
        Ok(())
    }

    /// Remove an agent from the registry and all indices. Returns false
    /// when no record existed.
    pub async fn deregister(&self, agent_id: &str) -> Result<bool, RegistryError> {
        // Raw read: deregistration must also clean up stale records, so no
        // freshness check here.
        let Some(record) = self.load_raw(agent_id).await? else {
            return Ok(false);
        };

        for capability in &record.capabilities {
            if let Err(err) = self
                .store
                .set_remove(&capability_key(&capability.name), agent_id)
                .await
            {
                warn!(agent_id, capability = %capability.name, error = %err,
                      "capability index cleanup failed");
            }
        }
        for tag in &record.tags {
            if let Err(err) = self.store.set_remove(&tag_key(tag), agent_id).await {
                warn!(agent_id, tag = %tag, error = %err, "tag index cleanup failed");
            }
        }
        self.store.del(&agent_key(agent_id)).await?;

        self.publish_event(RegistryEvent::Unregistration {
            agent_id: agent_id.to_string(),
            timestamp: self.clock.now_utc(),
        })
        .await;

        info!(agent_id, "agent deregistered");
        Ok(true)
    }

    /// Snapshot of one agent record, `None` if absent or expired.
    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError> {
        self.metrics.record_lookup();
        self.read_record(agent_id).await
    }

    /// Snapshot of agents matching the filter.
    ///
    /// The capability filter intersects the capability index, the tag
    /// filter intersects across all requested tags, and the status filter
    /// applies after records are loaded.
    pub async fn list(&self, filter: &AgentFilter) -> Result<Vec<AgentRecord>, RegistryError> {
        self.metrics.record_lookup();

        let mut candidate_ids: Option<HashSet<String>> = None;

        if let Some(capability) = &filter.capability {
            let members = self.store.set_members(&capability_key(capability)).await?;
            candidate_ids = Some(members);
        }

        for tag in &filter.tags {
            let members = self.store.set_members(&tag_key(tag)).await?;
            candidate_ids = Some(match candidate_ids {
                Some(ids) => ids.intersection(&members).cloned().collect(),
                None => members,
            });
        }

        let ids: Vec<String> = match candidate_ids {
            Some(ids) => ids.into_iter().collect(),
            None => {
                let keys = self.store.keys("agent:").await?;
                keys.into_iter()
                    .filter_map(|k| k.strip_prefix("agent:").map(str::to_string))
                    .collect()
            }
        };

        let mut agents = Vec::with_capacity(ids.len());
        for agent_id in ids {
            match self.read_record(&agent_id).await? {
                Some(record) => {
                    if filter.status.is_none_or(|s| record.status == s) {
                        agents.push(record);
                    }
                }
                None => {
                    // Stale index entry for an evicted record; clean up the
                    // indices this lookup actually consulted.
                    if let Some(capability) = &filter.capability {
                        let _ = self
                            .store
                            .set_remove(&capability_key(capability), &agent_id)
                            .await;
                    }
                    for tag in &filter.tags {
                        let _ = self.store.set_remove(&tag_key(tag), &agent_id).await;
                    }
                }
            }
        }

        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    /// Pick the best agent for a capability.
    ///
    /// Healthy candidates are preferred; degraded candidates are a
    /// fallback. Scoring balances capability complexity, load headroom,
    /// priority and absolute load. Deterministic: ties break toward the
    /// lexicographically lower agent id.
    pub async fn find_best(
        &self,
        required_capability: &str,
        _context: Option<&serde_json::Value>,
    ) -> Result<Option<AgentRecord>, RegistryError> {
        let mut candidates = self
            .list(
                &AgentFilter::by_capability(required_capability)
                    .with_status(AgentStatus::Healthy),
            )
            .await?;
        if candidates.is_empty() {
            candidates = self
                .list(
                    &AgentFilter::by_capability(required_capability)
                        .with_status(AgentStatus::Degraded),
                )
                .await?;
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(f64, AgentRecord)> = None;
        // Candidates arrive sorted by agent_id, so strict comparison keeps
        // the lowest id on ties.
        for candidate in candidates {
            let score = selection_score(&candidate, required_capability);
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, candidate));
            }
        }

        if let Some((score, ref chosen)) = best {
            debug!(agent_id = %chosen.agent_id, score, capability = required_capability,
                   "selected best agent");
        }
        Ok(best.map(|(_, record)| record))
    }

    /// Adjust an agent's load counter by `delta`, clamped to
    /// `0..=max_concurrent`. Returns the new load.
    pub async fn adjust_load(&self, agent_id: &str, delta: i64) -> Result<u32, RegistryError> {
        let record = self
            .read_record(agent_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                agent_id: agent_id.to_string(),
            })?;

        let new_load = (i64::from(record.current_load) + delta)
            .clamp(0, i64::from(record.max_concurrent)) as u32;
        self.store
            .hash_set(
                &agent_key(agent_id),
                &[("current_load".to_string(), new_load.to_string())],
            )
            .await?;
        Ok(new_load)
    }

    /// Subscribe to registration/unregistration events.
    pub async fn subscribe_events(&self) -> Result<mpsc::Receiver<RegistryEvent>, RegistryError> {
        let mut raw = self.store.subscribe(&self.config.events_channel).await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(message) = raw.recv().await {
                match serde_json::from_str::<RegistryEvent>(&message) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable registry event");
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn publish_event(&self, event: RegistryEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode registry event");
                return;
            }
        };
        if let Err(err) = self
            .store
            .publish(&self.config.events_channel, &payload)
            .await
        {
            warn!(error = %err, "failed to publish registry event");
        }
    }

    async fn remove_stale_indices(&self, previous: &AgentRecord, next: &AgentRecord) {
        let next_caps: HashSet<&str> =
            next.capabilities.iter().map(|c| c.name.as_str()).collect();
        for capability in &previous.capabilities {
            if !next_caps.contains(capability.name.as_str()) {
                let _ = self
                    .store
                    .set_remove(&capability_key(&capability.name), &previous.agent_id)
                    .await;
            }
        }
        for tag in previous.tags.difference(&next.tags) {
            let _ = self.store.set_remove(&tag_key(tag), &previous.agent_id).await;
        }
    }

    /// Decode a record without any freshness check.
    async fn load_raw(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError> {
        let fields = self.store.hash_get_all(&agent_key(agent_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(&fields)
            .map(Some)
            .map_err(RegistryError::Store)
    }

    /// Load a record, lazily evicting it when its heartbeat is stale.
    async fn read_record(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError> {
        let Some(record) = self.load_raw(agent_id).await? else {
            return Ok(None);
        };

        let age = self.clock.now_utc() - record.last_heartbeat;
        if age > chrono::Duration::from_std(self.config.record_ttl).unwrap_or(chrono::Duration::MAX)
        {
            debug!(agent_id, "evicting stale agent record");
            let _ = self.deregister(agent_id).await;
            return Ok(None);
        }
        Ok(Some(record))
    }
}

/// Scoring used by `find_best`: 40% capability fit, 30% load headroom,
/// 20% priority, 10% absolute load.
fn selection_score(record: &AgentRecord, required_capability: &str) -> f64 {
    let capability_score = record
        .capability(required_capability)
        .map(|c| {
            if c.complexity_score > 0.0 {
                1.0 / c.complexity_score
            } else {
                1.0
            }
        })
        .unwrap_or(0.0);

    capability_score * 0.4
        + (1.0 - record.load_factor()) * 0.3
        + (f64::from(record.priority) / 10.0) * 0.2
        + (1.0 / f64::from(record.current_load + 1)) * 0.1
}

fn record_to_fields(record: &AgentRecord) -> Vec<(String, String)> {
    let capabilities =
        serde_json::to_string(&record.capabilities).unwrap_or_else(|_| "[]".to_string());
    let tags = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());
    let resources = serde_json::to_string(&record.resources)
        .unwrap_or_else(|_| r#"{"cpu_cores":1.0,"memory_gb":1.0}"#.to_string());

    vec![
        ("agent_id".to_string(), record.agent_id.clone()),
        ("name".to_string(), record.name.clone()),
        ("version".to_string(), record.version.clone()),
        ("description".to_string(), record.description.clone()),
        ("endpoint_url".to_string(), record.endpoint_url.clone()),
        (
            "health_check_url".to_string(),
            record.health_check_url.clone(),
        ),
        ("capabilities".to_string(), capabilities),
        (
            "max_concurrent".to_string(),
            record.max_concurrent.to_string(),
        ),
        ("current_load".to_string(), record.current_load.to_string()),
        ("resources".to_string(), resources),
        ("service_name".to_string(), record.service_name.clone()),
        ("namespace".to_string(), record.namespace.clone()),
        ("cluster".to_string(), record.cluster.clone()),
        ("tags".to_string(), tags),
        ("priority".to_string(), record.priority.to_string()),
        (
            "registered_at".to_string(),
            record.registered_at.to_rfc3339(),
        ),
        (
            "last_heartbeat".to_string(),
            record.last_heartbeat.to_rfc3339(),
        ),
        ("status".to_string(), record.status.as_str().to_string()),
    ]
}

fn record_from_fields(
    fields: &std::collections::HashMap<String, String>,
) -> Result<AgentRecord, StoreError> {
    fn field<'a>(
        fields: &'a std::collections::HashMap<String, String>,
        name: &str,
    ) -> Result<&'a str, StoreError> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Decode(format!("missing field {name}")))
    }

    fn parse<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, StoreError> {
        value
            .parse()
            .map_err(|_| StoreError::Decode(format!("invalid {name}: {value}")))
    }

    fn parse_time(value: &str, name: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| StoreError::Decode(format!("invalid {name}: {value}")))
    }

    let capabilities: Vec<AgentCapability> = serde_json::from_str(field(fields, "capabilities")?)
        .map_err(|e| StoreError::Decode(format!("invalid capabilities: {e}")))?;
    let tags: BTreeSet<String> = serde_json::from_str(field(fields, "tags")?)
        .map_err(|e| StoreError::Decode(format!("invalid tags: {e}")))?;
    let resources: AgentResources = serde_json::from_str(field(fields, "resources")?)
        .map_err(|e| StoreError::Decode(format!("invalid resources: {e}")))?;

    Ok(AgentRecord {
        agent_id: field(fields, "agent_id")?.to_string(),
        name: field(fields, "name")?.to_string(),
        version: field(fields, "version")?.to_string(),
        description: field(fields, "description")?.to_string(),
        endpoint_url: field(fields, "endpoint_url")?.to_string(),
        health_check_url: field(fields, "health_check_url")?.to_string(),
        capabilities,
        max_concurrent: parse(field(fields, "max_concurrent")?, "max_concurrent")?,
        current_load: parse(field(fields, "current_load")?, "current_load")?,
        resources,
        service_name: field(fields, "service_name")?.to_string(),
        namespace: field(fields, "namespace")?.to_string(),
        cluster: field(fields, "cluster")?.to_string(),
        tags,
        priority: parse(field(fields, "priority")?, "priority")?,
        registered_at: parse_time(field(fields, "registered_at")?, "registered_at")?,
        last_heartbeat: parse_time(field(fields, "last_heartbeat")?, "last_heartbeat")?,
        status: parse(field(fields, "status")?, "status")?,
    })
}
