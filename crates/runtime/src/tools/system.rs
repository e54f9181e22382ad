//! System tools: fleet health, tool listing, runtime info.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::categories;
use crate::catalog::{ParameterSpec, Tool, ToolCatalog, ToolDescriptor};
use crate::registry::{AgentFilter, AgentRegistry};
use crate::types::{AgentStatus, CatalogError, Subject};

struct CheckSystemHealth {
    registry: Arc<AgentRegistry>,
}

#[async_trait]
impl Tool for CheckSystemHealth {
    async fn invoke(&self, _args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        let all = self
            .registry
            .list(&AgentFilter::default())
            .await
            .map_err(|e| CatalogError::Execution {
                name: "check_system_health".to_string(),
                message: e.to_string(),
            })?;
        let healthy = all
            .iter()
            .filter(|a| a.status == AgentStatus::Healthy)
            .count();

        let status = if all.is_empty() {
            "idle"
        } else if healthy == all.len() {
            "healthy"
        } else if healthy > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        Ok(json!({
            "status": status,
            "agents_total": all.len(),
            "agents_healthy": healthy,
            "agents": all.iter().map(|a| json!({
                "agent_id": a.agent_id,
                "status": a.status.as_str(),
                "current_load": a.current_load,
            })).collect::<Vec<_>>(),
        }))
    }
}

struct ListTools {
    // Weak: the catalog owns this tool, a strong reference would cycle.
    catalog: Weak<ToolCatalog>,
}

#[async_trait]
impl Tool for ListTools {
    async fn invoke(&self, args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        let catalog = self.catalog.upgrade().ok_or_else(|| CatalogError::Execution {
            name: "list_tools".to_string(),
            message: "catalog is gone".to_string(),
        })?;

        let category = args["category"].as_str().filter(|c| !c.is_empty());
        let tools = catalog.list(category);
        Ok(json!({
            "count": tools.len(),
            "tools": tools,
            "categories": catalog.categories(),
        }))
    }
}

struct GetSystemInfo;

#[async_trait]
impl Tool for GetSystemInfo {
    async fn invoke(&self, _args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        Ok(json!({
            "service": "conductor",
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

/// Register the system tool set.
pub fn register(catalog: &Arc<ToolCatalog>, registry: Arc<AgentRegistry>) {
    catalog.register(
        ToolDescriptor::new(
            "check_system_health",
            "Check fleet health and agent status",
            categories::SYSTEM,
        ),
        Arc::new(CheckSystemHealth { registry }),
    );

    catalog.register(
        ToolDescriptor::new(
            "list_tools",
            "List registered tools with their schemas",
            categories::SYSTEM,
        )
        .with_parameter(
            "category",
            ParameterSpec::optional("string", "Restrict to one category", json!("")),
        ),
        Arc::new(ListTools {
            catalog: Arc::downgrade(catalog),
        }),
    );

    catalog.register(
        ToolDescriptor::new(
            "get_system_info",
            "Runtime version and identity",
            categories::SYSTEM,
        ),
        Arc::new(GetSystemInfo),
    );
}
