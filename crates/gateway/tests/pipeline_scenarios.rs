use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{self, HeaderMap, StatusCode, header};
use axum::response::{IntoResponse as _, Response};
use parking_lot::Mutex;
use prometheus::Registry;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use unrelated_mcp_guard::audit::{AuditEvent, AuditOutcome, AuditSink, Auditor};
use unrelated_mcp_guard::authz::Authorizer;
use unrelated_mcp_guard::authz::cedar::{PolicyEngine, PolicySource};
use unrelated_mcp_guard::claims::{Claims, ClaimsProvider, LocalUserClaims};
use unrelated_mcp_guard::config::AuditConfig;
use unrelated_mcp_guard::error::{AuditError, AuthError, UpstreamError};
use unrelated_mcp_guard::pipeline::{Pipeline, PipelineLimits};
use unrelated_mcp_guard::telemetry::{Metrics, Telemetry};
use unrelated_mcp_guard::upstream::{Backend, BackendRequest};

const TOOLS: [&str; 5] = ["weather", "calculator", "search", "delete_file", "shell"];

#[derive(Default)]
struct CollectSink(Mutex<Vec<AuditEvent>>);

impl AuditSink for CollectSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.0.lock().push(event.clone());
        Ok(())
    }
}

/// Canned MCP backend that remembers what it was asked.
struct ScriptedBackend {
    seen: Mutex<Vec<BackendRequest>>,
    delay: Duration,
    content_encoding: Mutex<Option<&'static str>>,
}

impl ScriptedBackend {
    fn new(delay: Duration) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            delay,
            content_encoding: Mutex::new(None),
        }
    }

    /// Label every following response with this `Content-Encoding`.
    fn encode_as(&self, encoding: &'static str) {
        *self.content_encoding.lock() = Some(encoding);
    }

    fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn handle(&self, req: BackendRequest) -> Result<Response, UpstreamError> {
        self.seen.lock().push(req.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let method = req.parsed.as_ref().map(|p| p.method.as_str()).unwrap_or_default();
        let result = match method {
            "tools/list" => json!({
                "tools": TOOLS.iter().map(|n| json!({"name": n})).collect::<Vec<_>>()
            }),
            "tools/call" => json!({"content": [{"type": "text", "text": "sunny"}]}),
            _ => json!({}),
        };
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": result});
        let mut resp = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();
        if let Some(encoding) = *self.content_encoding.lock() {
            resp.headers_mut().insert(
                header::CONTENT_ENCODING,
                http::HeaderValue::from_static(encoding),
            );
        }
        Ok(resp)
    }
}

struct RejectingClaims;

#[async_trait]
impl ClaimsProvider for RejectingClaims {
    async fn resolve(&self, _headers: &HeaderMap) -> Result<Claims, AuthError> {
        Err(AuthError::MissingToken)
    }

    fn realm(&self) -> &str {
        "https://issuer.test"
    }
}

struct Harness {
    pipeline: Pipeline,
    backend: Arc<ScriptedBackend>,
    sink: Arc<CollectSink>,
    engine: Arc<PolicyEngine>,
    registry: Registry,
}

impl Harness {
    fn new(policies: &[&str]) -> Self {
        Self::build(
            policies,
            Arc::new(LocalUserClaims::new("alice", Vec::new())),
            Duration::ZERO,
            Duration::from_secs(5),
        )
    }

    fn build(
        policies: &[&str],
        claims: Arc<dyn ClaimsProvider>,
        backend_delay: Duration,
        upstream_timeout: Duration,
    ) -> Self {
        let engine = Arc::new(
            PolicyEngine::new(&PolicySource {
                policies: policies.iter().map(ToString::to_string).collect(),
                entities_json: None,
            })
            .expect("policies compile"),
        );
        let backend = Arc::new(ScriptedBackend::new(backend_delay));
        let sink = Arc::new(CollectSink::default());
        let registry = Registry::new();
        let telemetry = Telemetry::new(
            Metrics::register(&registry).expect("metrics"),
            "test-server",
            &[],
        );
        let pipeline = Pipeline::new(
            claims,
            Arc::new(Authorizer::new(Arc::clone(&engine), &[])),
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::new(Auditor::new(
                &AuditConfig::default(),
                "test-server",
                Arc::clone(&sink) as Arc<dyn AuditSink>,
            )),
            Arc::new(telemetry),
            PipelineLimits {
                max_request_bytes: 64 * 1024,
                max_response_bytes: 64 * 1024,
                upstream_timeout,
            },
            "streamable-http",
        );
        Self {
            pipeline,
            backend,
            sink,
            engine,
            registry,
        }
    }

    fn events(&self) -> Vec<AuditEvent> {
        self.sink.0.lock().clone()
    }

    fn single_event(&self) -> AuditEvent {
        let events = self.events();
        assert_eq!(events.len(), 1, "expected exactly one audit event: {events:?}");
        events.into_iter().next().expect("one event")
    }

    fn requests_total(&self) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == "mcp_gateway_requests_total")
            .flat_map(|f| f.get_metric().iter())
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    fn status_code_label(&self) -> Option<String> {
        self.registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == "mcp_gateway_requests_total")
            .flat_map(|f| f.get_metric().iter())
            .flat_map(|m| m.get_label().iter())
            .find(|l| l.get_name() == "status_code")
            .map(|l| l.get_value().to_string())
    }
}

fn rpc(method: &str, params: Value) -> Request {
    let body = json!({"jsonrpc": "2.0", "id": 7, "method": method, "params": params});
    http::Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn raw_json(body: &str) -> Request {
    http::Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_json(resp: Response) -> Value {
    let bytes: Bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

const ALICE_WEATHER: &str =
    r#"permit(principal == Client::"alice", action == Action::"call_tool", resource == Tool::"weather");"#;

#[tokio::test]
async fn permitted_tool_call_reaches_backend_unmodified() {
    let h = Harness::new(&[ALICE_WEATHER]);
    let resp = h
        .pipeline
        .handle(
            rpc(
                "tools/call",
                json!({"name": "weather", "arguments": {"location": "NYC"}}),
            ),
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["result"]["content"][0]["text"], "sunny");

    assert_eq!(h.backend.calls(), 1);
    let seen = h.backend.seen.lock()[0].clone();
    let parsed = seen.parsed.expect("parsed request forwarded");
    assert_eq!(parsed.resource_id, "weather");
    assert_eq!(parsed.arguments.get("location"), Some(&json!("NYC")));

    let event = h.single_event();
    assert_eq!(event.event_type, "mcp_tool_call");
    assert_eq!(event.outcome, AuditOutcome::Success);
    assert_eq!(event.target.resource_id, "weather");
    assert_eq!(event.subjects.user.as_deref(), Some("alice"));
    assert_eq!(h.requests_total(), 1);
}

#[tokio::test]
async fn denied_tool_call_never_reaches_backend() {
    let h = Harness::new(&[
        r#"permit(principal == Client::"bob", action == Action::"call_tool", resource == Tool::"weather");"#,
    ]);
    let resp = h
        .pipeline
        .handle(
            rpc(
                "tools/call",
                json!({"name": "weather", "arguments": {"location": "NYC"}}),
            ),
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        body_json(resp).await,
        json!({"id": 7, "error": {"code": 403, "message": "Unauthorized"}})
    );
    assert_eq!(h.backend.calls(), 0);

    let event = h.single_event();
    assert_eq!(event.outcome, AuditOutcome::Denied);
    assert_eq!(h.requests_total(), 1);
}

#[tokio::test]
async fn list_result_keeps_only_permitted_items_in_order() {
    let h = Harness::new(&[
        r#"permit(principal == Client::"alice", action == Action::"call_tool", resource == Tool::"weather");"#,
        r#"permit(principal == Client::"alice", action == Action::"call_tool", resource == Tool::"search");"#,
        r#"permit(principal == Client::"alice", action == Action::"call_tool", resource == Tool::"shell");"#,
    ]);
    let resp = h.pipeline.handle(rpc("tools/list", json!({})), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());

    let body = body_json(resp).await;
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .expect("tools array")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, ["weather", "search", "shell"]);

    let event = h.single_event();
    assert_eq!(event.event_type, "mcp_list_operation");
    assert_eq!(event.outcome, AuditOutcome::Success);
    assert_eq!(h.requests_total(), 1);
}

#[tokio::test]
async fn ping_skips_authorization() {
    // No policies at all: anything evaluated would be denied.
    let h = Harness::new(&[]);
    let resp = h.pipeline.handle(rpc("ping", json!({})), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(h.engine.evaluation_count(), 0);

    let event = h.single_event();
    assert_eq!(event.event_type, "mcp_ping");
    assert_eq!(event.outcome, AuditOutcome::Success);
    assert_eq!(h.requests_total(), 1);
}

#[tokio::test]
async fn malformed_json_is_forwarded_unparsed() {
    let h = Harness::new(&[]);
    let req = http::Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let resp = h.pipeline.handle(req, None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.backend.calls(), 1);
    assert!(h.backend.seen.lock()[0].parsed.is_none());

    let event = h.single_event();
    assert_eq!(event.event_type, "http_request");
    assert_eq!(h.requests_total(), 1);
}

#[tokio::test]
async fn unusual_ids_and_broken_envelopes_cannot_skip_authorization() {
    let h = Harness::new(&[ALICE_WEATHER]);
    let cases = [
        (
            r#"{"jsonrpc":"2.0","id":9223372036854775808,"method":"tools/call","params":{"name":"delete_file"}}"#,
            json!(9_223_372_036_854_775_808_u64),
        ),
        (
            r#"{"jsonrpc":"2.0","id":1.5,"method":"tools/call","params":{"name":"delete_file"}}"#,
            json!(1.5),
        ),
        (
            r#"{"id":7,"method":"tools/call","params":{"name":"delete_file"}}"#,
            Value::Null,
        ),
        (
            r#"{"jsonrpc":"2.0","id":{"x":1},"method":"resources/read","params":{"uri":"file:///etc/passwd"}}"#,
            Value::Null,
        ),
    ];
    for (body, id) in cases {
        let resp = h.pipeline.handle(raw_json(body), None).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{body}");
        assert_eq!(body_json(resp).await["id"], id, "{body}");
    }
    assert_eq!(h.backend.calls(), 0);
    let events = h.events();
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.outcome == AuditOutcome::Denied));

    // The large id still reaches the backend once policy allows the tool.
    let resp = h
        .pipeline
        .handle(
            raw_json(
                r#"{"jsonrpc":"2.0","id":9223372036854775808,"method":"tools/call","params":{"name":"weather"}}"#,
            ),
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.backend.calls(), 1);
}

#[tokio::test]
async fn encoded_list_response_is_refused_not_passed_through() {
    let h = Harness::new(&[ALICE_WEATHER]);
    h.backend.encode_as("gzip");
    let resp = h.pipeline.handle(rpc("tools/list", json!({})), None).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    assert!(!String::from_utf8_lossy(&bytes).contains("shell"));
    assert_eq!(h.single_event().outcome, AuditOutcome::Error);
    assert_eq!(h.status_code_label().as_deref(), Some("502"));

    // Identity is not an encoding.
    let h = Harness::new(&[ALICE_WEATHER]);
    h.backend.encode_as("identity");
    let resp = h.pipeline.handle(rpc("tools/list", json!({})), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let tools = body_json(resp).await["result"]["tools"].clone();
    assert_eq!(tools, json!([{"name": "weather"}]));
}

#[tokio::test]
async fn unmapped_method_is_denied() {
    let h = Harness::new(&[r#"permit(principal, action, resource);"#]);
    let resp = h
        .pipeline
        .handle(rpc("sampling/createMessage", json!({})), None)
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.backend.calls(), 0);
    assert_eq!(h.single_event().outcome, AuditOutcome::Denied);
}

#[tokio::test]
async fn failed_authentication_challenges_with_realm() {
    let h = Harness::build(
        &[],
        Arc::new(RejectingClaims),
        Duration::ZERO,
        Duration::from_secs(5),
    );
    let resp = h.pipeline.handle(rpc("tools/list", json!({})), None).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let challenge = resp
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .expect("challenge header")
        .to_string();
    assert!(challenge.starts_with("Bearer realm=\"https://issuer.test\""));
    assert_eq!(h.backend.calls(), 0);
    assert_eq!(h.single_event().outcome, AuditOutcome::Denied);
    assert_eq!(h.requests_total(), 1);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let h = Harness::build(
        &[ALICE_WEATHER],
        Arc::new(LocalUserClaims::new("alice", Vec::new())),
        Duration::from_secs(2),
        Duration::from_millis(50),
    );
    let resp = h
        .pipeline
        .handle(rpc("tools/call", json!({"name": "weather"})), None)
        .await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(h.single_event().outcome, AuditOutcome::Error);
    assert_eq!(h.status_code_label().as_deref(), Some("504"));
}

#[tokio::test]
async fn canceled_request_is_recorded_once() {
    let h = Harness::build(
        &[ALICE_WEATHER],
        Arc::new(LocalUserClaims::new("alice", Vec::new())),
        Duration::from_secs(2),
        Duration::from_secs(5),
    );
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        h.pipeline
            .handle(rpc("tools/call", json!({"name": "weather"})), None),
    )
    .await;
    assert!(abandoned.is_err());

    let event = h.single_event();
    assert_eq!(event.outcome, AuditOutcome::Failure);
    assert_eq!(h.requests_total(), 1);
    assert_eq!(h.status_code_label().as_deref(), Some("499"));
}

#[tokio::test]
async fn oversized_request_is_rejected() {
    let h = Harness::new(&[r#"permit(principal, action, resource);"#]);
    let big = "x".repeat(128 * 1024);
    let resp = h
        .pipeline
        .handle(
            rpc("tools/call", json!({"name": "weather", "arguments": {"blob": big}})),
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(h.backend.calls(), 0);
    assert_eq!(h.single_event().outcome, AuditOutcome::Failure);
}
