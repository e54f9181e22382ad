//! Orchestrator tests against stub worker agents and a stub LLM provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Notify;

use conductor_runtime::types::OrchestratorError;
use conductor_runtime::{
    AgentCapability, AgentRecord, AgentStatus, ControlPlane, DispatchOverrides, DispatchPattern,
    ManualClock, MemoryStore, PolicyDocument, RequestEnvelope, RuntimeConfig, SharedStore,
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
            Some("agent-user-token") => {
                Json(json!({"user_id": "agent-user-1", "roles": ["agent_user"]})).into_response()
            }
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }
    spawn_router(Router::new().route("/auth/validate", post(validate))).await
}

#[derive(Clone)]
struct WorkerState {
    name: String,
    calls: Arc<AtomicU64>,
    fail_first: u64,
    status_code: StatusCode,
    gate: Option<Arc<Notify>>,
    bodies: Arc<parking_lot::Mutex<Vec<Value>>>,
    done_after: Option<u64>,
}

impl WorkerState {
    fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(AtomicU64::new(0)),
            fail_first: 0,
            status_code: StatusCode::OK,
            gate: None,
            bodies: Arc::new(parking_lot::Mutex::new(Vec::new())),
            done_after: None,
        }
    }

    fn failing(name: &str, status_code: StatusCode) -> Self {
        Self {
            status_code,
            fail_first: u64::MAX,
            ..Self::ok(name)
        }
    }

    fn flaky(name: &str, fail_first: u64) -> Self {
        Self {
            fail_first,
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            ..Self::ok(name)
        }
    }
}

/// Stub worker speaking the agent wire protocol.
async fn spawn_worker(state: WorkerState) -> std::net::SocketAddr {
    async fn process_request(
        State(state): State<WorkerState>,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        let call = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
        state.bodies.lock().push(body.clone());

        if call <= state.fail_first {
            return (state.status_code, Json(json!({"error": "injected failure"})))
                .into_response();
        }
        if let Some(gate) = &state.gate {
            gate.notified().await;
        }

        let done = state.done_after.map(|n| call >= n);
        Json(json!({
            "success": true,
            "result": {
                "agent": state.name,
                "echo": body["query"],
                "call": call,
                "done": done,
            },
            "transaction_id": format!("worker-{call}"),
        }))
        .into_response()
    }

    spawn_router(
        Router::new()
            .route("/process_request", post(process_request))
            .with_state(state),
    )
    .await
}

/// Stub OpenAI-compatible endpoint returning a fixed completion body.
async fn spawn_llm(content: String) -> std::net::SocketAddr {
    async fn completions(State(content): State<String>) -> axum::response::Response {
        Json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        }))
        .into_response()
    }
    spawn_router(
        Router::new()
            .route("/chat/completions", post(completions))
            .with_state(content),
    )
    .await
}

const POLICY_YAML: &str = r#"
governance:
  enabled: true
  default_decision: deny
  roles:
    agent_user:
      agents: ["*"]
      tools: []
  rate_limits:
    global: { requests: 10000, window: 3600 }
    per_user: { requests: 1000, window: 3600 }
    per_tool: { requests: 1000, window: 3600 }
"#;

async fn plane_with_llm(llm_url: Option<String>) -> ControlPlane {
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
    config.dispatcher.max_retries = 3;
    if let Some(url) = llm_url {
        config.llm = Some(conductor_runtime::LlmConfig::new(
            conductor_runtime::LlmProviderConfig {
                base_url: url,
                api_key: "test-key".to_string(),
                model: "router-test".to_string(),
            },
        ));
    }

    ControlPlane::with_store(config, store, clock).await.unwrap()
}

fn agent_record(id: &str, capability: &str, addr: std::net::SocketAddr) -> AgentRecord {
    let mut record = AgentRecord::new(id, id, format!("http://{addr}"))
        .with_capability(AgentCapability::new(capability, "test capability"))
        .with_status(AgentStatus::Healthy);
    record.max_concurrent = 10;
    record.priority = 3;
    record
}

async fn authenticated_subject(plane: &ControlPlane) -> conductor_runtime::Subject {
    plane
        .pipeline
        .authenticate("agent-user-token")
        .await
        .expect("stub token must validate")
}

#[tokio::test]
async fn happy_path_selects_agent_and_bumps_load() {
    let plane = plane_with_llm(None).await;

    let gate = Arc::new(Notify::new());
    let mut worker = WorkerState::ok("A");
    worker.gate = Some(gate.clone());
    let addr = spawn_worker(worker).await;
    plane
        .registry
        .register(agent_record("A", "data_search", addr))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let orchestrator = plane.orchestrator.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .process(
                &subject,
                RequestEnvelope {
                    query: "search customer 42".to_string(),
                    context: None,
                    overrides: None,
                },
            )
            .await
    });

    // The agent's load is bumped while the request is in flight.
    let mut observed_load = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = plane.registry.get("A").await.unwrap().unwrap();
        if record.current_load > 0 {
            observed_load = record.current_load;
            break;
        }
    }
    assert_eq!(observed_load, 1);

    gate.notify_one();
    let result = task.await.unwrap().unwrap();
    assert_eq!(result.selected_agent.as_deref(), Some("A"));
    assert_eq!(result.pattern, DispatchPattern::Simple);
    assert!(result.reasoning.to_lowercase().contains("fallback"));
    assert_eq!(result.response["agent"], "A");

    // Load drains after completion.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = plane.registry.get("A").await.unwrap().unwrap();
        if record.current_load == 0 {
            return;
        }
    }
    panic!("load counter never released");
}

#[tokio::test]
async fn llm_selects_agent_by_strict_json() {
    let llm =
        spawn_llm(r#"{"agent": "B", "reasoning": "reporting capability fits"}"#.to_string()).await;
    let plane = plane_with_llm(Some(format!("http://{llm}"))).await;

    let a = spawn_worker(WorkerState::ok("A")).await;
    let b = spawn_worker(WorkerState::ok("B")).await;
    plane
        .registry
        .register(agent_record("A", "data_search", a))
        .await
        .unwrap();
    plane
        .registry
        .register(agent_record("B", "report_generation", b))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let result = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "build the quarterly report".to_string(),
                context: None,
                overrides: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.selected_agent.as_deref(), Some("B"));
    assert_eq!(result.reasoning, "reporting capability fits");
}

#[tokio::test]
async fn malformed_llm_output_falls_back_to_keyword_match() {
    let llm = spawn_llm("I think you should definitely use agent B!".to_string()).await;
    let plane = plane_with_llm(Some(format!("http://{llm}"))).await;

    let addr = spawn_worker(WorkerState::ok("A")).await;
    plane
        .registry
        .register(agent_record("A", "data_search", addr))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let result = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "search for invoices".to_string(),
                context: None,
                overrides: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.selected_agent.as_deref(), Some("A"));
    assert!(result.reasoning.to_lowercase().contains("fallback"));
}

#[tokio::test]
async fn parallel_fan_out_reports_partial_failure() {
    let plane = plane_with_llm(None).await;

    let a = spawn_worker(WorkerState::ok("A")).await;
    let b = spawn_worker(WorkerState::failing("B", StatusCode::INTERNAL_SERVER_ERROR)).await;
    plane
        .registry
        .register(agent_record("A", "data_search", a))
        .await
        .unwrap();
    plane
        .registry
        .register(agent_record("B", "report_generation", b))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let result = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "fan out".to_string(),
                context: None,
                overrides: Some(DispatchOverrides {
                    pattern: Some(DispatchPattern::Parallel),
                    agents: Some(vec!["A".to_string(), "B".to_string()]),
                    ..DispatchOverrides::default()
                }),
            },
        )
        .await
        .unwrap();

    let results = &result.response["results"];
    assert_eq!(results["A"]["success"], true);
    assert_eq!(results["B"]["success"], false);
    assert!(results["B"]["error"].as_str().unwrap().contains("B"));
}

#[tokio::test]
async fn simple_dispatch_retries_5xx_then_succeeds() {
    let plane = plane_with_llm(None).await;

    let worker = WorkerState::flaky("A", 1);
    let calls = worker.calls.clone();
    let addr = spawn_worker(worker).await;
    plane
        .registry
        .register(agent_record("A", "data_search", addr))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let result = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "search things".to_string(),
                context: None,
                overrides: Some(DispatchOverrides {
                    agents: Some(vec!["A".to_string()]),
                    ..DispatchOverrides::default()
                }),
            },
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.response["call"], 2);
}

#[tokio::test]
async fn client_errors_do_not_retry() {
    let plane = plane_with_llm(None).await;

    let worker = WorkerState::failing("A", StatusCode::UNPROCESSABLE_ENTITY);
    let calls = worker.calls.clone();
    let addr = spawn_worker(worker).await;
    plane
        .registry
        .register(agent_record("A", "data_search", addr))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let err = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "search".to_string(),
                context: None,
                overrides: Some(DispatchOverrides {
                    agents: Some(vec!["A".to_string()]),
                    ..DispatchOverrides::default()
                }),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Dispatch(_)), "{err}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_chains_previous_response_into_context() {
    let plane = plane_with_llm(None).await;

    let first = WorkerState::ok("first");
    let second = WorkerState::ok("second");
    let second_bodies = second.bodies.clone();
    let a = spawn_worker(first).await;
    let b = spawn_worker(second).await;
    plane
        .registry
        .register(agent_record("first", "data_search", a))
        .await
        .unwrap();
    plane
        .registry
        .register(agent_record("second", "report_generation", b))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let result = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "chain".to_string(),
                context: Some(json!({"tenant": "acme"})),
                overrides: Some(DispatchOverrides {
                    pattern: Some(DispatchPattern::Sequential),
                    agent_sequence: Some(vec!["first".to_string(), "second".to_string()]),
                    ..DispatchOverrides::default()
                }),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.selected_agents, vec!["first", "second"]);
    assert_eq!(result.response["steps"].as_array().unwrap().len(), 2);

    // The second worker saw the first worker's result in its context.
    let bodies = second_bodies.lock();
    let context = &bodies[0]["context"];
    assert_eq!(context["previous_response"]["agent"], "first");
    assert_eq!(context["context"]["tenant"], "acme");
}

#[tokio::test]
async fn loop_pattern_stops_on_done() {
    let plane = plane_with_llm(None).await;

    let mut worker = WorkerState::ok("looper");
    worker.done_after = Some(3);
    let addr = spawn_worker(worker).await;
    plane
        .registry
        .register(agent_record("looper", "data_search", addr))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let result = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "iterate".to_string(),
                context: None,
                overrides: Some(DispatchOverrides {
                    pattern: Some(DispatchPattern::Loop),
                    agents: Some(vec!["looper".to_string()]),
                    max_hops: Some(10),
                    ..DispatchOverrides::default()
                }),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.response["iterations"], 3);
    assert_eq!(result.response["terminated"], true);
}

#[tokio::test]
async fn loop_pattern_respects_hop_limit() {
    let plane = plane_with_llm(None).await;

    // done_after never reached: the hop limit terminates the loop.
    let mut worker = WorkerState::ok("looper");
    worker.done_after = Some(u64::MAX);
    let addr = spawn_worker(worker).await;
    plane
        .registry
        .register(agent_record("looper", "data_search", addr))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let result = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "iterate".to_string(),
                context: None,
                overrides: Some(DispatchOverrides {
                    pattern: Some(DispatchPattern::Loop),
                    agents: Some(vec!["looper".to_string()]),
                    max_hops: Some(2),
                    ..DispatchOverrides::default()
                }),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.response["iterations"], 2);
    assert_eq!(result.response["terminated"], false);
}

#[tokio::test]
async fn policy_denies_unauthorized_agent_edge() {
    let restrictive = r#"
governance:
  default_decision: deny
  roles:
    agent_user:
      agents: ["allowed-agent"]
"#;
    let auth_addr = spawn_auth_proxy().await;
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let document = PolicyDocument::from_yaml_str(restrictive).unwrap();
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

    let addr = spawn_worker(WorkerState::ok("other-agent")).await;
    plane
        .registry
        .register(agent_record("other-agent", "data_search", addr))
        .await
        .unwrap();

    let subject = authenticated_subject(&plane).await;
    let err = plane
        .orchestrator
        .process(
            &subject,
            RequestEnvelope {
                query: "search".to_string(),
                context: None,
                overrides: Some(DispatchOverrides {
                    agents: Some(vec!["other-agent".to_string()]),
                    ..DispatchOverrides::default()
                }),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Denied { .. }), "{err}");
}
