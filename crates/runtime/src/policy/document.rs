//! Policy document model.
//!
//! Loaded from the document store with a YAML-file fallback and built-in
//! defaults behind both. A reload replaces the whole document — there is
//! no partial merge.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimit;
use crate::types::{PolicyError, ResourceType};

/// Verdict applied when no rule grants or denies explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultDecision {
    Allow,
    #[default]
    Deny,
}

/// Execution restrictions attached to a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Restrictions {
    /// Soft ceiling on execution time, in seconds. Exceeding it records an
    /// execution-time violation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u64>,
    /// When set and not `["*"]`, only these parameters may be supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_parameters: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_parameters: Vec<String>,
    /// Resource-specific rate window overriding the document default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl Restrictions {
    /// Layer `over` on top of `self`: scalar fields from `over` win,
    /// forbidden parameter lists union.
    pub fn overlay(&self, over: &Restrictions) -> Restrictions {
        let mut forbidden = self.forbidden_parameters.clone();
        for parameter in &over.forbidden_parameters {
            if !forbidden.contains(parameter) {
                forbidden.push(parameter.clone());
            }
        }
        Restrictions {
            max_execution_time: over.max_execution_time.or(self.max_execution_time),
            allowed_parameters: over
                .allowed_parameters
                .clone()
                .or_else(|| self.allowed_parameters.clone()),
            forbidden_parameters: forbidden,
            rate_limit: over.rate_limit.or(self.rate_limit),
        }
    }

    /// Whether the allowed-parameter list actually constrains anything.
    pub fn constrains_allowed(&self) -> bool {
        match &self.allowed_parameters {
            Some(list) => !list.is_empty() && list.iter().any(|p| p != "*"),
            None => false,
        }
    }
}

/// Allow/deny lists and per-resource restrictions for one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub deny_list: Vec<String>,
    /// Keyed by resource id, or `category:{name}` for tool categories.
    #[serde(default)]
    pub restrictions: BTreeMap<String, Restrictions>,
}

/// Resources a role may reach.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleAccess {
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl RoleAccess {
    pub fn for_resource(&self, resource_type: ResourceType) -> &[String] {
        match resource_type {
            ResourceType::Agent => &self.agents,
            ResourceType::Tool => &self.tools,
        }
    }
}

/// Per-dimension rate windows. The legacy `per_agent` key is an alias of
/// `per_tool` — the resource dimension covers both kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitsSection {
    #[serde(default = "default_global_limit")]
    pub global: RateLimit,
    #[serde(default = "default_user_limit")]
    pub per_user: RateLimit,
    #[serde(default = "default_tool_limit", alias = "per_agent")]
    pub per_tool: RateLimit,
}

fn default_global_limit() -> RateLimit {
    RateLimit::new(1000, 3600)
}

fn default_user_limit() -> RateLimit {
    RateLimit::new(100, 3600)
}

fn default_tool_limit() -> RateLimit {
    RateLimit::new(50, 3600)
}

impl Default for RateLimitsSection {
    fn default() -> Self {
        Self {
            global: default_global_limit(),
            per_user: default_user_limit(),
            per_tool: default_tool_limit(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// The governance policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub default_decision: DefaultDecision,
    #[serde(default)]
    pub agents: ResourcePolicy,
    #[serde(default)]
    pub tools: ResourcePolicy,
    /// Role name to reachable resources.
    #[serde(default)]
    pub roles: BTreeMap<String, RoleAccess>,
    #[serde(default)]
    pub rate_limits: RateLimitsSection,
    /// Global execution limits layered under every resource restriction.
    #[serde(default)]
    pub execution_limits: Restrictions,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            enabled: true,
            default_decision: DefaultDecision::Deny,
            agents: ResourcePolicy::default(),
            tools: ResourcePolicy::default(),
            roles: BTreeMap::new(),
            rate_limits: RateLimitsSection::default(),
            execution_limits: Restrictions::default(),
        }
    }
}

/// YAML file wrapper: the document sits under a `governance:` root key.
#[derive(Debug, Deserialize)]
struct GovernanceFile {
    governance: PolicyDocument,
}

impl PolicyDocument {
    /// Built-in defaults used when no source is available: deny by
    /// default, admin sees everything, five-minute execution ceiling.
    pub fn builtin_defaults() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            "admin".to_string(),
            RoleAccess {
                agents: vec!["*".to_string()],
                tools: vec!["*".to_string()],
            },
        );
        roles.insert("agent_user".to_string(), RoleAccess::default());
        roles.insert("tool_user".to_string(), RoleAccess::default());

        Self {
            roles,
            execution_limits: Restrictions {
                max_execution_time: Some(300),
                ..Restrictions::default()
            },
            ..Self::default()
        }
    }

    pub fn resource(&self, resource_type: ResourceType) -> &ResourcePolicy {
        match resource_type {
            ResourceType::Agent => &self.agents,
            ResourceType::Tool => &self.tools,
        }
    }

    /// Parse a document from YAML. Accepts either a `governance:` wrapped
    /// file or a bare document.
    pub fn from_yaml_str(input: &str) -> Result<Self, PolicyError> {
        if let Ok(wrapped) = serde_yaml::from_str::<GovernanceFile>(input) {
            return Ok(wrapped.governance);
        }
        serde_yaml::from_str(input).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, PolicyError> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::SourceUnavailable(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&input)
    }

    /// Parse a document from its JSON form in the document store.
    pub fn from_json_str(input: &str) -> Result<Self, PolicyError> {
        serde_json::from_str(input).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Effective restrictions for one resource: global execution limits,
    /// overlaid by category restrictions (tools only), overlaid by the
    /// resource's own entry.
    pub fn restrictions_for(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        category: Option<&str>,
    ) -> Restrictions {
        let resource_policy = self.resource(resource_type);
        let mut merged = self.execution_limits.clone();
        if let Some(category) = category {
            if let Some(by_category) = resource_policy
                .restrictions
                .get(&format!("category:{category}"))
            {
                merged = merged.overlay(by_category);
            }
        }
        if let Some(by_id) = resource_policy.restrictions.get(resource_id) {
            merged = merged.overlay(by_id);
        }
        merged
    }
}
