//! Ingress HTTP API: orchestrator endpoints, governed tool surface,
//! compliance and metrics introspection.

pub mod routes;
pub mod server;
pub mod types;

pub use routes::AppState;
pub use server::{build_router, serve, HttpApiConfig};
