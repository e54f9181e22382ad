//! End-to-end governance pipeline tests: authentication against a stub
//! auth proxy, rate windows, parameter validation, audit trail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use conductor_runtime::catalog::{ParameterSpec, Tool, ToolDescriptor};
use conductor_runtime::types::{CatalogError, Subject};
use conductor_runtime::{
    ControlPlane, GateOutcome, ManualClock, MemoryStore, PolicyDocument, RuntimeConfig,
    SharedStore, ViolationKind,
};

async fn spawn_router(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Stub auth proxy: counts validation calls, knows two tokens.
async fn spawn_auth_proxy(calls: Arc<AtomicU64>) -> std::net::SocketAddr {
    async fn validate(
        State(calls): State<Arc<AtomicU64>>,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        calls.fetch_add(1, Ordering::SeqCst);
        match body["token"].as_str() {
            Some("tool-user-token") => {
                Json(json!({"user_id": "user-1", "roles": ["tool_user"]})).into_response()
            }
            Some("admin-token") => {
                Json(json!({"user_id": "admin-1", "roles": ["admin"]})).into_response()
            }
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }

    spawn_router(
        Router::new()
            .route("/auth/validate", post(validate))
            .with_state(calls),
    )
    .await
}

struct SleepyTool {
    delay: Duration,
}

#[async_trait]
impl Tool for SleepyTool {
    async fn invoke(&self, args: &Value, _subject: &Subject) -> Result<Value, CatalogError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({"ok": true, "args": args}))
    }
}

struct TestHarness {
    clock: Arc<ManualClock>,
    plane: ControlPlane,
    auth_calls: Arc<AtomicU64>,
}

const POLICY_YAML: &str = r#"
governance:
  enabled: true
  default_decision: deny
  roles:
    admin:
      agents: ["*"]
      tools: ["*"]
    tool_user:
      agents: []
      tools: ["*"]
  tools:
    restrictions:
      t1:
        forbidden_parameters: ["admin_access"]
  rate_limits:
    global: { requests: 1000, window: 3600 }
    per_user: { requests: 100, window: 3600 }
    per_tool: { requests: 3, window: 60 }
"#;

async fn harness() -> TestHarness {
    harness_with(POLICY_YAML, Duration::from_secs(300)).await
}

async fn harness_with(policy_yaml: &str, tool_timeout: Duration) -> TestHarness {
    let auth_calls = Arc::new(AtomicU64::new(0));
    let auth_addr = spawn_auth_proxy(auth_calls.clone()).await;

    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));

    let document = PolicyDocument::from_yaml_str(policy_yaml).unwrap();
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
    config.auth.timeout = Duration::from_secs(2);
    config.governance.tool_timeout = tool_timeout;

    let plane = ControlPlane::with_store(config, store, clock.clone())
        .await
        .unwrap();

    // The governed tool exercised by the scenarios.
    plane.catalog.register(
        ToolDescriptor::new("t1", "test tool", "testing")
            .with_parameter(
                "query",
                ParameterSpec::optional("string", "free-form query", json!("")),
            )
            .with_parameter(
                "admin_access",
                ParameterSpec::optional("boolean", "escalation flag", json!(false)),
            ),
        Arc::new(SleepyTool {
            delay: Duration::from_millis(1),
        }),
    );

    TestHarness {
        clock,
        plane,
        auth_calls,
    }
}

#[tokio::test]
async fn token_cache_performs_one_proxy_call() {
    let open_windows = r#"
governance:
  roles:
    tool_user:
      tools: ["*"]
  rate_limits:
    per_tool: { requests: 1000, window: 60 }
"#;
    let h = harness_with(open_windows, Duration::from_secs(300)).await;

    for _ in 0..5 {
        let outcome = h
            .plane
            .pipeline
            .gate("tool-user-token", "t1", "execute", &json!({}))
            .await;
        assert!(matches!(outcome, GateOutcome::Ok { .. }), "{outcome:?}");
    }
    assert_eq!(h.auth_calls.load(Ordering::SeqCst), 1);

    // After the cache TTL the proxy is consulted again.
    h.clock.advance(Duration::from_secs(301));
    let outcome = h
        .plane
        .pipeline
        .gate("tool-user-token", "t1", "execute", &json!({}))
        .await;
    assert!(matches!(outcome, GateOutcome::Ok { .. }));
    assert_eq!(h.auth_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unauthenticated_never_reaches_policy() {
    let h = harness().await;

    let outcome = h
        .plane
        .pipeline
        .gate("forged-token", "t1", "execute", &json!({}))
        .await;
    assert!(matches!(outcome, GateOutcome::Unauthenticated));

    let report = h.plane.policy.compliance_report();
    assert_eq!(report.total_requests, 0);
}

#[tokio::test]
async fn fourth_call_in_window_is_rate_limited() {
    let h = harness().await;

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        let outcome = h
            .plane
            .pipeline
            .gate("tool-user-token", "t1", "execute", &json!({}))
            .await;
        outcomes.push(matches!(outcome, GateOutcome::Ok { .. }));
    }
    assert_eq!(outcomes, vec![true, true, true, false]);

    let trail = h.plane.policy.audit_trail(10);
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].kind, ViolationKind::RateLimitExceeded);
    assert_eq!(trail[0].subject_id, "user-1");
    assert_eq!(trail[0].resource_id, "t1");

    // The window slides and the tool opens up again.
    h.clock.advance(Duration::from_secs(61));
    let outcome = h
        .plane
        .pipeline
        .gate("tool-user-token", "t1", "execute", &json!({}))
        .await;
    assert!(matches!(outcome, GateOutcome::Ok { .. }));
}

#[tokio::test]
async fn forbidden_parameter_rejected_and_audited() {
    let h = harness().await;

    let outcome = h
        .plane
        .pipeline
        .gate(
            "tool-user-token",
            "t1",
            "execute",
            &json!({"admin_access": true}),
        )
        .await;
    match outcome {
        GateOutcome::ParameterViolation { reason } => {
            assert!(reason.to_lowercase().contains("parameter"), "{reason}");
            assert!(reason.contains("admin_access"), "{reason}");
        }
        other => panic!("expected parameter violation, got {other:?}"),
    }

    let trail = h.plane.policy.audit_trail(10);
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].kind, ViolationKind::ParameterViolation);

    let report = h.plane.policy.compliance_report();
    assert_eq!(report.parameter_violations, 1);
    assert_eq!(report.denied_requests, 1);
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let h = harness().await;
    let outcome = h
        .plane
        .pipeline
        .gate("admin-token", "no_such_tool", "execute", &json!({}))
        .await;
    assert!(matches!(outcome, GateOutcome::NotFound { .. }), "{outcome:?}");
}

#[tokio::test]
async fn execution_overrun_is_audited_but_result_returns() {
    let slow_policy = r#"
governance:
  roles:
    tool_user:
      tools: ["*"]
  tools:
    restrictions:
      t1:
        max_execution_time: 0
"#;
    let h = harness_with(slow_policy, Duration::from_secs(300)).await;

    let outcome = h
        .plane
        .pipeline
        .gate("tool-user-token", "t1", "execute", &json!({}))
        .await;
    assert!(matches!(outcome, GateOutcome::Ok { .. }), "{outcome:?}");

    let report = h.plane.policy.compliance_report();
    assert_eq!(report.execution_time_violations, 1);
}

#[tokio::test]
async fn hard_timeout_maps_to_gateway_timeout() {
    let h = harness_with(POLICY_YAML, Duration::from_millis(20)).await;

    // Replace t1 with a body slower than the pipeline's hard ceiling.
    h.plane.catalog.register(
        ToolDescriptor::new("t1", "slow tool", "testing"),
        Arc::new(SleepyTool {
            delay: Duration::from_secs(2),
        }),
    );

    let outcome = h
        .plane
        .pipeline
        .gate("tool-user-token", "t1", "execute", &json!({}))
        .await;
    assert!(matches!(outcome, GateOutcome::Timeout { .. }), "{outcome:?}");

    let report = h.plane.policy.compliance_report();
    assert_eq!(report.execution_time_violations, 1);
}

#[tokio::test]
async fn violations_ring_is_bounded() {
    let h = harness().await;

    // Capacity is 1024; drive far fewer but verify trail ordering and
    // cumulative counters disagree with buffer length only when expected.
    for _ in 0..3 {
        h.plane
            .pipeline
            .gate("tool-user-token", "t1", "execute", &json!({"admin_access": 1}))
            .await;
    }
    let report = h.plane.policy.compliance_report();
    assert_eq!(report.parameter_violations, 3);

    let trail = h.plane.policy.audit_trail(2);
    assert_eq!(trail.len(), 2);
}
