//! Ingress API tests: endpoint shapes and the error-code mapping.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use conductor_runtime::{
    AgentCapability, AgentRecord, AgentStatus, ControlPlane, ManualClock, MemoryStore,
    PolicyDocument, RuntimeConfig, SharedStore,
};

async fn spawn_router(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_auth_proxy() -> std::net::SocketAddr {
    async fn validate(Json(body): Json<Value>) -> axum::response::Response {
        match body["token"].as_str() {
            Some("good-token") => {
                Json(json!({"user_id": "user-1", "roles": ["tool_user", "agent_user"]}))
                    .into_response()
            }
            Some("admin-token") => {
                Json(json!({"user_id": "admin-1", "roles": ["admin"]})).into_response()
            }
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }
    spawn_router(Router::new().route("/auth/validate", post(validate))).await
}

async fn spawn_worker() -> std::net::SocketAddr {
    async fn process_request(Json(body): Json<Value>) -> axum::response::Response {
        Json(json!({
            "success": true,
            "result": {"echo": body["query"]},
            "transaction_id": "worker-1",
        }))
        .into_response()
    }
    spawn_router(Router::new().route("/process_request", post(process_request))).await
}

const POLICY_YAML: &str = r#"
governance:
  enabled: true
  default_decision: deny
  roles:
    admin:
      agents: ["*"]
      tools: ["*"]
    agent_user:
      agents: ["*"]
      tools: []
    tool_user:
      agents: []
      tools: ["*"]
  tools:
    restrictions:
      search_database:
        forbidden_parameters: ["admin_access"]
  rate_limits:
    global: { requests: 10000, window: 3600 }
    per_user: { requests: 1000, window: 3600 }
    per_tool: { requests: 1000, window: 3600 }
"#;

/// Full control plane served over a real socket.
async fn serve_plane() -> (std::net::SocketAddr, ControlPlane) {
    let auth_addr = spawn_auth_proxy().await;
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let document = PolicyDocument::from_yaml_str(POLICY_YAML).unwrap();
    store
        .set(
            "policy:document",
            &serde_json::to_string(&document).unwrap(),
            None,
        )
        .await
        .unwrap();

    let mut config = RuntimeConfig::default();
    config.auth.proxy_url = format!("http://{auth_addr}");
    config.dispatcher.timeout = Duration::from_secs(5);

    let plane = ControlPlane::with_store(config, store, clock).await.unwrap();
    let router = conductor_runtime::api::build_router(plane.app_state(), &plane.config.api);
    let addr = spawn_router(router).await;
    (addr, plane)
}

#[tokio::test]
async fn health_reports_available_agents() {
    let (addr, plane) = serve_plane().await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "conductor");
    assert_eq!(body["agents_available"], 0);

    let worker = spawn_worker().await;
    plane
        .registry
        .register(
            AgentRecord::new("A", "A", format!("http://{worker}"))
                .with_capability(AgentCapability::new("data_search", "search"))
                .with_status(AgentStatus::Healthy),
        )
        .await
        .unwrap();

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["agents_available"], 1);
}

#[tokio::test]
async fn process_requires_bearer_token() {
    let (addr, _plane) = serve_plane().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/process"))
        .json(&json!({"query": "anything"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .post(format!("http://{addr}/process"))
        .header("Authorization", "Bearer forged")
        .json(&json!({"query": "anything"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn process_round_trips_through_a_worker() {
    let (addr, plane) = serve_plane().await;
    let worker = spawn_worker().await;
    plane
        .registry
        .register(
            AgentRecord::new("A", "A", format!("http://{worker}"))
                .with_capability(AgentCapability::new("data_search", "search"))
                .with_status(AgentStatus::Healthy),
        )
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/process"))
        .header("Authorization", "Bearer good-token")
        .json(&json!({"query": "search customer 42"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["selected_agent"], "A");
    assert_eq!(body["result"]["response"]["echo"], "search customer 42");
    assert!(body["transaction_id"].is_string());
}

#[tokio::test]
async fn tool_endpoint_maps_governance_outcomes_to_status_codes() {
    let (addr, _plane) = serve_plane().await;
    let client = reqwest::Client::new();
    let url = |name: &str| format!("http://{addr}/tool/{name}");

    // 401: no token.
    let response = client
        .post(url("search_database"))
        .json(&json!({"query": "q"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // 200: governed happy path.
    let response = client
        .post(url("search_database"))
        .header("Authorization", "Bearer good-token")
        .json(&json!({"query": "customers"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);

    // 400: forbidden parameter, with the standard error shape.
    let response = client
        .post(url("search_database"))
        .header("Authorization", "Bearer good-token")
        .json(&json!({"query": "q", "admin_access": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "parameter_violation");
    assert!(body["message"].as_str().unwrap().contains("admin_access"));

    // 404: unknown tool.
    let response = client
        .post(url("missing_tool"))
        .header("Authorization", "Bearer good-token")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rate_limited_tool_returns_429_with_retry_after() {
    let tight = POLICY_YAML.replace(
        "per_tool: { requests: 1000, window: 3600 }",
        "per_tool: { requests: 1, window: 60 }",
    );

    let auth_addr = spawn_auth_proxy().await;
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let document = PolicyDocument::from_yaml_str(&tight).unwrap();
    store
        .set(
            "policy:document",
            &serde_json::to_string(&document).unwrap(),
            None,
        )
        .await
        .unwrap();
    let mut config = RuntimeConfig::default();
    config.auth.proxy_url = format!("http://{auth_addr}");
    let plane = ControlPlane::with_store(config, store, clock).await.unwrap();
    let addr =
        spawn_router(conductor_runtime::api::build_router(plane.app_state(), &plane.config.api))
            .await;

    let client = reqwest::Client::new();
    let send = || {
        client
            .post(format!("http://{addr}/tool/get_system_info"))
            .header("Authorization", "Bearer good-token")
            .json(&json!({}))
            .send()
    };

    assert_eq!(send().await.unwrap().status(), StatusCode::OK);
    let response = send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["retry_after"], 60);
}

#[tokio::test]
async fn patterns_and_agents_listings() {
    let (addr, plane) = serve_plane().await;

    let body: Value = reqwest::get(format!("http://{addr}/patterns"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let patterns: Vec<String> =
        serde_json::from_value(body["patterns"].clone()).unwrap();
    assert_eq!(patterns, vec!["simple", "sequential", "parallel", "loop"]);
    assert!(body["descriptions"]["loop"].is_string());

    plane
        .registry
        .register(
            AgentRecord::new("B", "B", "http://b:9000")
                .with_capability(AgentCapability::new("report_generation", "reports"))
                .with_status(AgentStatus::Healthy),
        )
        .await
        .unwrap();
    let body: Value = reqwest::get(format!("http://{addr}/agents"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["agents"][0], "B");
}

#[tokio::test]
async fn compliance_endpoints_require_auth_and_report() {
    let (addr, _plane) = serve_plane().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/compliance/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Drive one denied call so the report has content.
    client
        .post(format!("http://{addr}/tool/search_database"))
        .header("Authorization", "Bearer good-token")
        .json(&json!({"query": "q", "admin_access": true}))
        .send()
        .await
        .unwrap();

    let body: Value = client
        .get(format!("http://{addr}/compliance/metrics"))
        .header("Authorization", "Bearer admin-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["parameter_violations"], 1);
    assert_eq!(body["denied_requests"], 1);

    let body: Value = client
        .get(format!("http://{addr}/compliance/audit?limit=5"))
        .header("Authorization", "Bearer admin-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["entries"][0]["violation_type"], "parameter_violation");
}

#[tokio::test]
async fn metrics_endpoint_requires_auth() {
    let (addr, _plane) = serve_plane().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body: Value = client
        .get(format!("http://{addr}/metrics"))
        .header("Authorization", "Bearer good-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["requests_gated"].is_u64());
}

#[tokio::test]
async fn policy_reload_is_admin_only() {
    let (addr, _plane) = serve_plane().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/policies/reload"))
        .header("Authorization", "Bearer good-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .post(format!("http://{addr}/policies/reload"))
        .header("Authorization", "Bearer admin-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["reloaded"], true);
}
