//! Core types and data structures for the control plane.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod agent;
pub mod error;

pub use agent::*;
pub use error::*;

/// Unique identifier for ingress requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one orchestrated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of governed resource a decision applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Agent,
    Tool,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Agent => "agent",
            ResourceType::Tool => "tool",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated principal: who is making the request and with which roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: String,
    pub roles: std::collections::BTreeSet<String>,
}

impl Subject {
    pub fn new(subject_id: impl Into<String>, roles: impl IntoIterator<Item = String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn resource_type_round_trips() {
        let json = serde_json::to_string(&ResourceType::Tool).unwrap();
        assert_eq!(json, "\"tool\"");
        let back: ResourceType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ResourceType::Tool);
    }

    #[test]
    fn subject_roles() {
        let subject = Subject::new("user-1", ["admin".to_string()]);
        assert!(subject.has_role("admin"));
        assert!(!subject.has_role("viewer"));
    }
}
