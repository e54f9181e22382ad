//! Database tools: search, SQL execution, schema inspection.
//!
//! Bodies are simulated — they stand in for a real warehouse client and
//! return structured results echoing the governed request.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::categories;
use crate::catalog::{ParameterSpec, Tool, ToolCatalog, ToolDescriptor};
use crate::types::{CatalogError, Subject};

struct SearchDatabase;

#[async_trait]
impl Tool for SearchDatabase {
    async fn invoke(&self, args: &Value, subject: &Subject) -> Result<Value, CatalogError> {
        let query = args["query"].as_str().unwrap_or_default();
        let database = args["database"].as_str().unwrap_or("default");
        let limit = args["limit"].as_u64().unwrap_or(100);

        info!(subject_id = %subject.subject_id, database, limit, "database search");
        Ok(json!({
            "query": query,
            "database": database,
            "limit": limit,
            "rows": [],
            "row_count": 0,
            "summary": format!("Database search completed for '{query}' in '{database}'"),
        }))
    }
}

struct ExecuteSql;

#[async_trait]
impl Tool for ExecuteSql {
    async fn invoke(&self, args: &Value, subject: &Subject) -> Result<Value, CatalogError> {
        let sql = args["sql"].as_str().unwrap_or_default();
        let database = args["database"].as_str().unwrap_or("default");
        let timeout = args["timeout"].as_u64().unwrap_or(30);

        if sql.trim().is_empty() {
            return Err(CatalogError::InvalidArguments {
                name: "execute_sql".to_string(),
                reason: "sql must not be empty".to_string(),
            });
        }

        info!(subject_id = %subject.subject_id, database, timeout, "sql executed");
        Ok(json!({
            "database": database,
            "statement": sql,
            "timeout_secs": timeout,
            "rows_affected": 0,
            "summary": format!("SQL executed in '{database}'"),
        }))
    }
}

struct GetTableSchema;

#[async_trait]
impl Tool for GetTableSchema {
    async fn invoke(&self, args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        let table = args["table_name"].as_str().unwrap_or_default();
        let database = args["database"].as_str().unwrap_or("default");

        Ok(json!({
            "database": database,
            "table": table,
            "columns": [
                {"name": "id", "type": "bigint", "nullable": false},
                {"name": "created_at", "type": "timestamp", "nullable": false},
                {"name": "payload", "type": "jsonb", "nullable": true},
            ],
        }))
    }
}

/// Register the database tool set.
pub fn register(catalog: &Arc<ToolCatalog>) {
    catalog.register(
        ToolDescriptor::new(
            "search_database",
            "Search the enterprise database with a query string",
            categories::DATABASE,
        )
        .with_parameter("query", ParameterSpec::required("string", "Search query"))
        .with_parameter(
            "database",
            ParameterSpec::optional("string", "Target database", json!("default")),
        )
        .with_parameter(
            "limit",
            ParameterSpec::optional("integer", "Maximum rows returned", json!(100)),
        ),
        Arc::new(SearchDatabase),
    );

    catalog.register(
        ToolDescriptor::new(
            "execute_sql",
            "Execute a SQL statement with timeout protection",
            categories::DATABASE,
        )
        .with_parameter("sql", ParameterSpec::required("string", "SQL statement"))
        .with_parameter(
            "database",
            ParameterSpec::optional("string", "Target database", json!("default")),
        )
        .with_parameter(
            "timeout",
            ParameterSpec::optional("integer", "Statement timeout in seconds", json!(30)),
        ),
        Arc::new(ExecuteSql),
    );

    catalog.register(
        ToolDescriptor::new(
            "get_table_schema",
            "Describe a table's columns and types",
            categories::DATABASE,
        )
        .with_parameter("table_name", ParameterSpec::required("string", "Table name"))
        .with_parameter(
            "database",
            ParameterSpec::optional("string", "Target database", json!("default")),
        ),
        Arc::new(GetTableSchema),
    );
}
