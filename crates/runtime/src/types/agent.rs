//! Agent data model: capabilities, resources, and the registry record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Unhealthy => "unhealthy",
            AgentStatus::Offline => "offline",
        }
    }

    /// Offline agents are never eligible for routing.
    pub fn routable(&self) -> bool {
        !matches!(self, AgentStatus::Offline)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(AgentStatus::Healthy),
            "degraded" => Ok(AgentStatus::Degraded),
            "unhealthy" => Ok(AgentStatus::Unhealthy),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// A named operation an agent can perform. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub output_schema: serde_json::Value,
    /// Relative cost of running this capability; used by `find_best` scoring.
    #[serde(default = "default_complexity")]
    pub complexity_score: f64,
    /// Rough wall-clock estimate in seconds.
    #[serde(default = "default_duration")]
    pub estimated_duration_secs: f64,
}

fn default_complexity() -> f64 {
    1.0
}

fn default_duration() -> f64 {
    1.0
}

impl AgentCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
            complexity_score: default_complexity(),
            estimated_duration_secs: default_duration(),
        }
    }

    pub fn with_complexity(mut self, score: f64) -> Self {
        self.complexity_score = score;
        self
    }
}

/// Declared resource footprint of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentResources {
    pub cpu_cores: f64,
    pub memory_gb: f64,
}

impl Default for AgentResources {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_gb: 1.0,
        }
    }
}

/// The registry's record for one agent. Written only through
/// register/heartbeat/deregister; readable by anyone as a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub endpoint_url: String,
    pub health_check_url: String,
    pub capabilities: Vec<AgentCapability>,
    pub max_concurrent: u32,
    pub current_load: u32,
    pub resources: AgentResources,
    pub service_name: String,
    pub namespace: String,
    pub cluster: String,
    pub tags: BTreeSet<String>,
    /// Higher wins in `find_best` scoring.
    pub priority: i32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
}

impl AgentRecord {
    /// Minimal record with sensible defaults; callers fill in the rest.
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        endpoint_url: impl Into<String>,
    ) -> Self {
        let endpoint_url = endpoint_url.into();
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            description: String::new(),
            health_check_url: format!("{endpoint_url}/health"),
            endpoint_url,
            capabilities: Vec::new(),
            max_concurrent: 10,
            current_load: 0,
            resources: AgentResources::default(),
            service_name: String::new(),
            namespace: "default".to_string(),
            cluster: "default".to_string(),
            tags: BTreeSet::new(),
            priority: 1,
            registered_at: now,
            last_heartbeat: now,
            status: AgentStatus::Offline,
        }
    }

    pub fn with_capability(mut self, capability: AgentCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// The capability matching `name`, if this agent advertises it.
    pub fn capability(&self, name: &str) -> Option<&AgentCapability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    /// Fraction of concurrency budget in use, in `[0, 1]`.
    pub fn load_factor(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_concurrent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_and_prints() {
        for status in [
            AgentStatus::Healthy,
            AgentStatus::Degraded,
            AgentStatus::Unhealthy,
            AgentStatus::Offline,
        ] {
            let parsed: AgentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn offline_is_not_routable() {
        assert!(AgentStatus::Healthy.routable());
        assert!(AgentStatus::Degraded.routable());
        assert!(!AgentStatus::Offline.routable());
    }

    #[test]
    fn record_defaults() {
        let record = AgentRecord::new("a1", "search", "http://localhost:9000");
        assert_eq!(record.health_check_url, "http://localhost:9000/health");
        assert_eq!(record.namespace, "default");
        assert_eq!(record.status, AgentStatus::Offline);
        assert_eq!(record.current_load, 0);
    }

    #[test]
    fn load_factor_handles_zero_budget() {
        let mut record = AgentRecord::new("a1", "search", "http://localhost:9000");
        record.max_concurrent = 0;
        assert_eq!(record.load_factor(), 1.0);

        record.max_concurrent = 10;
        record.current_load = 5;
        assert_eq!(record.load_factor(), 0.5);
    }

    #[test]
    fn capability_lookup() {
        let record = AgentRecord::new("a1", "search", "http://localhost:9000")
            .with_capability(AgentCapability::new("data_search", "search data"));
        assert!(record.capability("data_search").is_some());
        assert!(record.capability("reporting").is_none());
    }
}
