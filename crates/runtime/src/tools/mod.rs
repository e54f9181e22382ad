//! Built-in tool suite.
//!
//! Each module registers its tools explicitly with a declared schema.
//! Tool bodies are plain callables: governance (auth, rate limiting,
//! policy, audit) happens in the pipeline fronting the catalog, never in
//! here.

use std::sync::Arc;

use crate::catalog::ToolCatalog;
use crate::registry::AgentRegistry;

pub mod analytics;
pub mod database;
pub mod documents;
pub mod system;

/// Tool categories used by policy scoping.
pub mod categories {
    pub const DATABASE: &str = "database";
    pub const ANALYTICS: &str = "analytics";
    pub const DOCUMENTS: &str = "documents";
    pub const SYSTEM: &str = "system";
}

/// Register the full built-in suite on a catalog.
pub fn register_builtin_tools(catalog: &Arc<ToolCatalog>, registry: Arc<AgentRegistry>) {
    database::register(catalog);
    analytics::register(catalog);
    documents::register(catalog);
    system::register(catalog, registry);
}
