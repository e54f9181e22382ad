//! Process-local tool catalog.
//!
//! Tools register explicitly at startup with a data schema — the schema is
//! data, not reflection. The catalog answers metadata queries and invokes
//! tool bodies; it performs no governance itself (the governance pipeline
//! fronts every invocation).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{CatalogError, Subject};

/// Schema for one declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub description: String,
}

impl ParameterSpec {
    pub fn required(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required: true,
            default: None,
            description: description.into(),
        }
    }

    pub fn optional(
        kind: impl Into<String>,
        description: impl Into<String>,
        default: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            required: false,
            default: Some(default),
            description: description.into(),
        }
    }
}

/// Tool metadata published at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub return_type: String,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: category.into(),
            parameters: BTreeMap::new(),
            return_type: "object".to_string(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    pub fn returning(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = return_type.into();
        self
    }
}

/// A pluggable tool body.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, args: &Value, subject: &Subject) -> Result<Value, CatalogError>;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn Tool>,
}

/// Write-at-startup registry of tools.
#[derive(Default)]
pub struct ToolCatalog {
    tools: DashMap<String, RegisteredTool>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A duplicate name replaces the previous entry.
    pub fn register(&self, descriptor: ToolDescriptor, handler: Arc<dyn Tool>) {
        let name = descriptor.name.clone();
        if self
            .tools
            .insert(name.clone(), RegisteredTool { descriptor, handler })
            .is_some()
        {
            warn!(tool = %name, "tool registration replaced an existing entry");
        } else {
            debug!(tool = %name, "tool registered");
        }
    }

    /// Descriptors for every tool, optionally limited to one category.
    pub fn list(&self, category: Option<&str>) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .iter()
            .filter(|entry| category.is_none_or(|c| entry.descriptor.category == c))
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Descriptor for one tool by name.
    pub fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|entry| entry.descriptor.clone())
    }

    /// Category map: category name to sorted tool names.
    pub fn categories(&self) -> BTreeMap<String, Vec<String>> {
        let mut categories: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.tools.iter() {
            categories
                .entry(entry.descriptor.category.clone())
                .or_default()
                .push(entry.descriptor.name.clone());
        }
        for names in categories.values_mut() {
            names.sort();
        }
        categories
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate args against the declared schema, apply defaults, and run
    /// the tool body.
    pub async fn invoke(
        &self,
        name: &str,
        args: &Value,
        subject: &Subject,
    ) -> Result<Value, CatalogError> {
        let (descriptor, handler) = {
            let entry = self.tools.get(name).ok_or_else(|| CatalogError::NotFound {
                name: name.to_string(),
            })?;
            (entry.descriptor.clone(), entry.handler.clone())
        };

        let args = normalise_args(&descriptor, args)?;
        handler.invoke(&args, subject).await
    }
}

/// Check required parameters, reject unknown ones, and fill defaults.
fn normalise_args(descriptor: &ToolDescriptor, args: &Value) -> Result<Value, CatalogError> {
    let supplied = match args {
        Value::Null => serde_json::Map::new(),
        Value::Object(map) => map.clone(),
        _ => {
            return Err(CatalogError::InvalidArguments {
                name: descriptor.name.clone(),
                reason: "arguments must be a JSON object".to_string(),
            })
        }
    };

    for key in supplied.keys() {
        if !descriptor.parameters.contains_key(key) {
            return Err(CatalogError::InvalidArguments {
                name: descriptor.name.clone(),
                reason: format!("unknown parameter: {key}"),
            });
        }
    }

    let mut normalised = supplied;
    for (name, spec) in &descriptor.parameters {
        if normalised.contains_key(name) {
            continue;
        }
        match (&spec.default, spec.required) {
            (Some(default), _) => {
                normalised.insert(name.clone(), default.clone());
            }
            (None, true) => {
                return Err(CatalogError::InvalidArguments {
                    name: descriptor.name.clone(),
                    reason: format!("missing required parameter: {name}"),
                })
            }
            (None, false) => {}
        }
    }

    Ok(Value::Object(normalised))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        async fn invoke(&self, args: &Value, subject: &Subject) -> Result<Value, CatalogError> {
            Ok(serde_json::json!({
                "echo": args,
                "subject": subject.subject_id,
            }))
        }
    }

    fn echo_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("echo", "Echo arguments back", "testing")
            .with_parameter("message", ParameterSpec::required("string", "The message"))
            .with_parameter(
                "repeat",
                ParameterSpec::optional("integer", "Times to repeat", serde_json::json!(1)),
            )
    }

    fn subject() -> Subject {
        Subject::new("user-1", ["tool_user".to_string()])
    }

    #[tokio::test]
    async fn register_lookup_list() {
        let catalog = ToolCatalog::new();
        catalog.register(echo_descriptor(), Arc::new(EchoTool));

        assert!(catalog.lookup("echo").is_some());
        assert!(catalog.lookup("missing").is_none());
        assert_eq!(catalog.list(None).len(), 1);
        assert_eq!(catalog.list(Some("testing")).len(), 1);
        assert!(catalog.list(Some("database")).is_empty());
        assert_eq!(catalog.categories()["testing"], vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn invoke_applies_defaults() {
        let catalog = ToolCatalog::new();
        catalog.register(echo_descriptor(), Arc::new(EchoTool));

        let result = catalog
            .invoke("echo", &serde_json::json!({"message": "hi"}), &subject())
            .await
            .unwrap();
        assert_eq!(result["echo"]["message"], "hi");
        assert_eq!(result["echo"]["repeat"], 1);
        assert_eq!(result["subject"], "user-1");
    }

    #[tokio::test]
    async fn invoke_rejects_missing_required() {
        let catalog = ToolCatalog::new();
        catalog.register(echo_descriptor(), Arc::new(EchoTool));

        let err = catalog
            .invoke("echo", &serde_json::json!({}), &subject())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn invoke_rejects_unknown_parameters() {
        let catalog = ToolCatalog::new();
        catalog.register(echo_descriptor(), Arc::new(EchoTool));

        let err = catalog
            .invoke(
                "echo",
                &serde_json::json!({"message": "hi", "bogus": true}),
                &subject(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn invoke_unknown_tool() {
        let catalog = ToolCatalog::new();
        let err = catalog
            .invoke("missing", &Value::Null, &subject())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }
}
