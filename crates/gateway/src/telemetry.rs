//! Telemetry recorder: one span per request plus process-wide Prometheus metrics.

use crate::audit::AuditOutcome;
use crate::mcp::parser::KNOWN_METHODS;
use crate::pipeline::RequestContext;
use parking_lot::Mutex;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::callsite::{Callsite, Identifier};
use tracing::field::{Field, FieldSet, display};
use tracing::metadata::Kind;
use tracing::subscriber::Interest;
use tracing::{Level, Metadata, Span};

pub const REDACTED: &str = "[REDACTED]";
pub const MAX_ARGUMENT_VALUE_CHARS: usize = 100;
pub const MAX_ARGUMENTS_CHARS: usize = 200;
/// Distinct `tool` label values before further tools share [`OTHER_LABEL`].
pub const MAX_TOOL_LABELS: usize = 256;
pub const OTHER_LABEL: &str = "other";

const SPAN_NAME: &str = "mcp.request";
const SPAN_FIELDS: &[&str] = &[
    "otel.name",
    "otel.status_code",
    "http.method",
    "http.url",
    "http.status_code",
    "http.request_content_length",
    "http.user_agent",
    "mcp.method",
    "mcp.request.id",
    "mcp.resource.id",
    "mcp.transport",
    "mcp.server.name",
    "mcp.tool.arguments",
];

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "api-key",
    "authorization",
    "credential",
    "private_key",
    "privatekey",
    "session",
    "cookie",
];

const CREDENTIAL_PREFIXES: &[&str] = &[
    "bearer ", "basic ", "sk-", "sk_", "pk_", "ghp_", "gho_", "github_pat_", "xox", "akia", "eyj",
];

/// Counters and histograms, registered once at startup and only incremented afterwards.
#[derive(Clone)]
pub struct Metrics {
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    active_connections: IntGaugeVec,
    tool_calls_total: IntCounterVec,
}

impl Metrics {
    /// Create and register every gateway metric.
    ///
    /// # Errors
    ///
    /// Fails if a metric is already registered in `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("mcp_gateway_requests_total", "Requests handled by the gateway"),
            &["mcp_method", "status", "status_code", "server", "transport"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "mcp_gateway_request_duration_seconds",
                "End-to-end request duration",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["mcp_method", "server", "transport"],
        )?;
        let active_connections = IntGaugeVec::new(
            Opts::new(
                "mcp_gateway_active_connections",
                "Open long-lived streaming connections",
            ),
            &["server", "transport", "connection_type"],
        )?;
        let tool_calls_total = IntCounterVec::new(
            Opts::new("mcp_gateway_tool_calls_total", "tools/call requests by tool"),
            &["server", "tool", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(tool_calls_total.clone()))?;
        Ok(Self {
            requests_total,
            request_duration,
            active_connections,
            tool_calls_total,
        })
    }
}

/// Decrements the active-connection gauge when dropped.
pub struct ConnectionGuard {
    gauge: prometheus::IntGauge,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// What was recorded for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub status: u16,
    pub duration: Duration,
}

impl Measurement {
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Span callsite whose field set is only known once the environment allow-list is loaded.
/// Until its metadata is set it reports [`FALLBACK_META`], which carries no environment fields.
struct RequestCallsite {
    meta: OnceLock<Metadata<'static>>,
}

static FALLBACK_CALLSITE: RequestCallsite = RequestCallsite {
    meta: OnceLock::new(),
};
static FALLBACK_META: Metadata<'static> = Metadata::new(
    SPAN_NAME,
    module_path!(),
    Level::INFO,
    Some(file!()),
    Some(line!()),
    Some(module_path!()),
    FieldSet::new(SPAN_FIELDS, Identifier(&FALLBACK_CALLSITE)),
    Kind::SPAN,
);

impl Callsite for RequestCallsite {
    fn set_interest(&self, _interest: Interest) {}

    fn metadata(&self) -> &Metadata<'_> {
        self.meta.get().unwrap_or(&FALLBACK_META)
    }
}

fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

/// Leaks one callsite per call; telemetry is built once per process.
fn request_span_metadata(environment: &[(String, String)]) -> &'static Metadata<'static> {
    let names: Vec<&'static str> = SPAN_FIELDS
        .iter()
        .copied()
        .chain(environment.iter().map(|(k, _)| leak(format!("environment.{k}"))))
        .collect();
    let callsite: &'static RequestCallsite = Box::leak(Box::new(RequestCallsite {
        meta: OnceLock::new(),
    }));
    let meta = callsite.meta.get_or_init(|| {
        Metadata::new(
            SPAN_NAME,
            module_path!(),
            Level::INFO,
            Some(file!()),
            Some(line!()),
            Some(module_path!()),
            FieldSet::new(Box::leak(names.into_boxed_slice()), Identifier(callsite)),
            Kind::SPAN,
        )
    });
    tracing::callsite::register(callsite);
    meta
}

pub struct Telemetry {
    metrics: Metrics,
    server_name: String,
    environment: Vec<(String, String)>,
    span_meta: &'static Metadata<'static>,
    tool_labels: Mutex<HashSet<String>>,
}

impl Telemetry {
    /// `environment_variables` is an allow-list; values are read once, here.
    #[must_use]
    pub fn new(metrics: Metrics, server_name: &str, environment_variables: &[String]) -> Self {
        let environment = environment_variables
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();
        Self::with_environment(metrics, server_name, environment)
    }

    #[must_use]
    pub fn with_environment(
        metrics: Metrics,
        server_name: &str,
        environment: Vec<(String, String)>,
    ) -> Self {
        Self {
            metrics,
            server_name: server_name.to_string(),
            span_meta: request_span_metadata(&environment),
            environment,
            tool_labels: Mutex::new(HashSet::new()),
        }
    }

    /// Open the request span. Status fields are filled in by [`Telemetry::finish`]; each
    /// allow-listed environment variable is its own `environment.<VAR>` field.
    #[must_use]
    pub fn start_span(&self, ctx: &RequestContext) -> Span {
        let meta = self.span_meta;
        if !tracing::dispatcher::get_default(|d| d.enabled(meta)) {
            return Span::none();
        }
        let none: [(&Field, Option<&dyn tracing::Value>); 0] = [];
        let span = Span::new(meta, &meta.fields().value_set(&none));

        span.record("otel.name", display(span_name(ctx)));
        span.record("http.method", display(&ctx.http_method));
        span.record("http.url", ctx.url.as_str());
        span.record("mcp.transport", ctx.transport.as_str());
        span.record("mcp.server.name", self.server_name.as_str());
        if let Some(len) = ctx.content_length {
            span.record("http.request_content_length", len);
        }
        if let Some(ua) = &ctx.user_agent {
            span.record("http.user_agent", ua.as_str());
        }
        if let Some(p) = ctx.kind.parsed().filter(|p| !p.method.is_empty()) {
            span.record("mcp.method", p.method.as_str());
            if let Some(id) = &p.id {
                span.record("mcp.request.id", display(id));
            }
            if !p.resource_id.is_empty() {
                span.record("mcp.resource.id", p.resource_id.as_str());
            }
            if p.method == "tools/call" && !p.arguments.is_empty() {
                span.record(
                    "mcp.tool.arguments",
                    sanitize_arguments(&p.arguments).as_str(),
                );
            }
        }
        for (k, v) in &self.environment {
            span.record(format!("environment.{k}").as_str(), v.as_str());
        }
        span
    }

    /// Count an opened streaming connection. The gauge drops back when the guard is dropped.
    #[must_use]
    pub fn connection_opened(&self, transport: &str) -> ConnectionGuard {
        let gauge = self
            .metrics
            .active_connections
            .with_label_values(&[&self.server_name, transport, "sse"]);
        gauge.inc();
        ConnectionGuard { gauge }
    }

    /// Close out a request: span status fields, counters, histogram.
    pub fn finish(
        &self,
        span: &Span,
        ctx: &RequestContext,
        status: u16,
        elapsed: Duration,
    ) -> Measurement {
        let method = metric_method(ctx);
        let outcome = status_label(status);
        let code = status.to_string();

        span.record("http.status_code", status);
        span.record("otel.status_code", if status >= 500 { "ERROR" } else { "OK" });

        self.metrics
            .requests_total
            .with_label_values(&[method, outcome, &code, &self.server_name, &ctx.transport])
            .inc();
        self.metrics
            .request_duration
            .with_label_values(&[method, &self.server_name, &ctx.transport])
            .observe(elapsed.as_secs_f64());
        if ctx.kind.method() == "tools/call" {
            let tool = self.tool_label(ctx);
            self.metrics
                .tool_calls_total
                .with_label_values(&[&self.server_name, &tool, outcome])
                .inc();
        }

        self.measurement(ctx, status, elapsed)
    }

    /// Tool names come from callers, so only allowed calls get their own label and the
    /// number of distinct labels is capped.
    fn tool_label(&self, ctx: &RequestContext) -> String {
        let allowed = ctx.decision.as_ref().is_some_and(|d| !d.is_deny());
        let Some(p) = ctx.kind.parsed().filter(|p| allowed && !p.resource_id.is_empty()) else {
            return OTHER_LABEL.to_string();
        };
        let mut seen = self.tool_labels.lock();
        if seen.contains(&p.resource_id) || seen.len() < MAX_TOOL_LABELS {
            seen.insert(p.resource_id.clone());
            return p.resource_id.clone();
        }
        OTHER_LABEL.to_string()
    }

    #[must_use]
    pub fn measurement(&self, ctx: &RequestContext, status: u16, elapsed: Duration) -> Measurement {
        let mut attributes = vec![
            ("http.method".to_string(), ctx.http_method.to_string()),
            ("http.url".to_string(), ctx.url.clone()),
            ("http.status_code".to_string(), status.to_string()),
        ];
        if let Some(len) = ctx.content_length {
            attributes.push(("http.request_content_length".to_string(), len.to_string()));
        }
        if let Some(ua) = &ctx.user_agent {
            attributes.push(("http.user_agent".to_string(), ua.clone()));
        }
        if let Some(p) = ctx.kind.parsed().filter(|p| !p.method.is_empty()) {
            attributes.push(("mcp.method".to_string(), p.method.clone()));
            if let Some(id) = &p.id {
                attributes.push(("mcp.request.id".to_string(), id.to_string()));
            }
            if !p.resource_id.is_empty() {
                attributes.push(("mcp.resource.id".to_string(), p.resource_id.clone()));
            }
            if p.method == "tools/call" && !p.arguments.is_empty() {
                attributes.push((
                    "mcp.tool.arguments".to_string(),
                    sanitize_arguments(&p.arguments),
                ));
            }
        }
        attributes.push(("mcp.transport".to_string(), ctx.transport.clone()));
        attributes.push(("mcp.server.name".to_string(), self.server_name.clone()));
        for (k, v) in &self.environment {
            attributes.push((format!("environment.{k}"), v.clone()));
        }
        Measurement {
            name: span_name(ctx),
            attributes,
            status,
            duration: elapsed,
        }
    }
}

fn span_name(ctx: &RequestContext) -> String {
    match ctx.kind.parsed().filter(|p| !p.method.is_empty()) {
        Some(p) => p.method.clone(),
        None => format!("{} {}", ctx.http_method, ctx.path),
    }
}

/// `mcp_method` label: known methods by name, anything else collapsed.
fn metric_method(ctx: &RequestContext) -> &'static str {
    if ctx.kind.is_stream_establishment() {
        return "sse";
    }
    if ctx.kind.parsed().is_some_and(|p| p.is_batch) {
        return "batch";
    }
    match ctx.kind.method() {
        "" => "unknown",
        m => KNOWN_METHODS
            .iter()
            .copied()
            .find(|known| *known == m)
            .unwrap_or(OTHER_LABEL),
    }
}

fn status_label(status: u16) -> &'static str {
    match AuditOutcome::from_status(status) {
        AuditOutcome::Success => "success",
        AuditOutcome::Denied => "denied",
        AuditOutcome::Failure | AuditOutcome::Error => "error",
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

fn looks_like_credential(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    if CREDENTIAL_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return true;
    }
    // Long unbroken base64/hex-ish strings are treated as opaque secrets.
    lower.len() >= 32
        && lower
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '=' | '+' | '/'))
}

/// Free text that carries a secret inline, such as `X-Api-Key: abc` or `token=abc`.
fn names_a_secret(value: &str) -> bool {
    value.contains([':', '=']) && is_sensitive_key(value)
}

/// Copy of `value` with sensitive keys and credential-looking strings replaced at every depth.
fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) if looks_like_credential(s) || names_a_secret(s) => {
            Value::String(REDACTED.to_string())
        }
        other => other.clone(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Render tool arguments for a span: secrets redacted, each value and the whole string capped.
#[must_use]
pub fn sanitize_arguments(arguments: &Map<String, Value>) -> String {
    let rendered: Vec<String> = arguments
        .iter()
        .map(|(k, v)| {
            if is_sensitive_key(k) {
                return format!("{k}={REDACTED}");
            }
            let raw = match redact(v) {
                Value::String(s) => s,
                other => other.to_string(),
            };
            format!("{k}={}", truncate_chars(&raw, MAX_ARGUMENT_VALUE_CHARS))
        })
        .collect();
    truncate_chars(&rendered.join(", "), MAX_ARGUMENTS_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::Authorizer;
    use crate::authz::cedar::{PolicyEngine, PolicySource};
    use crate::claims::Claims;
    use crate::mcp::parser::{RequestKind, classify, parse_body};
    use axum::http::{HeaderMap, HeaderValue, Method, header};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(body: &str) -> RequestContext {
        let mut ctx = RequestContext::new(Method::POST, "/mcp".to_string(), "streamable-http");
        ctx.kind = parse_body(body.as_bytes()).map_or(RequestKind::Unparsed, RequestKind::Mcp);
        ctx
    }

    fn telemetry() -> (Telemetry, Registry) {
        let registry = Registry::new();
        let metrics = Metrics::register(&registry).expect("register");
        let t = Telemetry::with_environment(
            metrics,
            "weather",
            vec![("DEPLOY_ENV".to_string(), "staging".to_string())],
        );
        (t, registry)
    }

    fn counter(registry: &Registry, name: &str) -> u64 {
        registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == name)
            .flat_map(|f| f.get_metric().iter())
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    fn series(registry: &Registry, name: &str) -> usize {
        registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == name)
            .map(|f| f.get_metric().len())
            .sum()
    }

    /// Context as the pipeline leaves it: classified body plus an authorization decision.
    fn decided(body: &str, policies: &[&str]) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut ctx = RequestContext::new(Method::POST, "/mcp".to_string(), "streamable-http");
        ctx.kind = classify(&Method::POST, "/mcp", &headers, body.as_bytes());
        let engine = PolicyEngine::new(&PolicySource {
            policies: policies.iter().map(|p| (*p).to_string()).collect(),
            entities_json: None,
        })
        .expect("compile");
        let authorizer = Authorizer::new(Arc::new(engine), &[]);
        ctx.decision = Some(authorizer.authorize(&Arc::new(Claims::default()), &ctx.kind));
        ctx
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        Metrics::register(&registry).expect("first");
        assert!(Metrics::register(&registry).is_err());
    }

    #[test]
    fn finish_counts_once_and_tracks_tool_calls() {
        let (t, registry) = telemetry();
        let c = ctx(
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"weather","arguments":{"location":"NYC"}}}"#,
        );
        let span = t.start_span(&c);
        let m = t.finish(&span, &c, 200, Duration::from_millis(3));
        assert_eq!(counter(&registry, "mcp_gateway_requests_total"), 1);
        assert_eq!(counter(&registry, "mcp_gateway_tool_calls_total"), 1);
        assert_eq!(m.name, "tools/call");
        assert_eq!(m.attribute("mcp.request.id"), Some("5"));
        assert_eq!(m.attribute("mcp.resource.id"), Some("weather"));
        assert_eq!(m.attribute("mcp.tool.arguments"), Some("location=NYC"));
        assert_eq!(m.attribute("environment.DEPLOY_ENV"), Some("staging"));
        assert_eq!(m.attribute("http.status_code"), Some("200"));
    }

    #[test]
    fn caller_chosen_names_do_not_grow_label_sets() {
        let (t, registry) = telemetry();
        for i in 0..50 {
            let unknown = decided(
                &format!(r#"{{"jsonrpc":"2.0","id":{i},"method":"x/{i}"}}"#),
                &[],
            );
            t.finish(&Span::none(), &unknown, 403, Duration::ZERO);
            let denied = decided(
                &format!(
                    r#"{{"jsonrpc":"2.0","id":{i},"method":"tools/call","params":{{"name":"t{i}"}}}}"#
                ),
                &[],
            );
            t.finish(&Span::none(), &denied, 403, Duration::ZERO);
        }
        // one series for every unknown method, one for tools/call
        assert_eq!(series(&registry, "mcp_gateway_requests_total"), 2);
        assert_eq!(series(&registry, "mcp_gateway_tool_calls_total"), 1);

        let allowed = decided(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"weather"}}"#,
            &["permit(principal, action, resource);"],
        );
        t.finish(&Span::none(), &allowed, 200, Duration::ZERO);
        assert_eq!(series(&registry, "mcp_gateway_tool_calls_total"), 2);
        let text = {
            let mut buf = Vec::new();
            let encoder = prometheus::TextEncoder::new();
            prometheus::Encoder::encode(&encoder, &registry.gather(), &mut buf).expect("encode");
            String::from_utf8(buf).expect("utf8")
        };
        assert!(text.contains(r#"mcp_method="other""#));
        assert!(text.contains(r#"tool="other""#));
        assert!(text.contains(r#"tool="weather""#));
    }

    #[test]
    fn tool_labels_are_capped() {
        let (t, registry) = telemetry();
        for i in 0..MAX_TOOL_LABELS + 10 {
            let ctx = decided(
                &format!(
                    r#"{{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{{"name":"t{i}"}}}}"#
                ),
                &["permit(principal, action, resource);"],
            );
            t.finish(&Span::none(), &ctx, 200, Duration::ZERO);
        }
        assert_eq!(
            series(&registry, "mcp_gateway_tool_calls_total"),
            MAX_TOOL_LABELS + 1
        );
    }

    #[test]
    fn malformed_tool_calls_count_under_other() {
        let (t, registry) = telemetry();
        let ctx = decided(r#"{"id":1,"method":"tools/call","params":{"name":"shell"}}"#, &[]);
        t.finish(&Span::none(), &ctx, 403, Duration::ZERO);
        assert_eq!(counter(&registry, "mcp_gateway_tool_calls_total"), 1);
    }

    #[test]
    fn span_carries_one_field_per_environment_variable() {
        let (t, _registry) = telemetry();
        let c = ctx(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = t.start_span(&c);
            let meta = span.metadata().expect("span enabled");
            assert_eq!(meta.name(), "mcp.request");
            assert!(meta.fields().field("environment.DEPLOY_ENV").is_some());
            assert!(meta.fields().field("environment").is_none());
            assert!(meta.fields().field("mcp.tool.arguments").is_some());
        });
    }

    #[test]
    fn unparsed_span_name_uses_http_method_and_path() {
        let (t, _registry) = telemetry();
        let m = t.measurement(&ctx("{bad"), 502, Duration::ZERO);
        assert_eq!(m.name, "POST /mcp");
        assert_eq!(m.attribute("mcp.method"), None);
    }

    #[test]
    fn connection_gauge_follows_guard() {
        let (t, registry) = telemetry();
        let gauge = |r: &Registry| -> i64 {
            r.gather()
                .iter()
                .filter(|f| f.get_name() == "mcp_gateway_active_connections")
                .flat_map(|f| f.get_metric().iter())
                .map(|m| m.get_gauge().get_value() as i64)
                .sum()
        };
        let g1 = t.connection_opened("sse");
        let g2 = t.connection_opened("sse");
        assert_eq!(gauge(&registry), 2);
        drop(g1);
        assert_eq!(gauge(&registry), 1);
        drop(g2);
        assert_eq!(gauge(&registry), 0);
    }

    #[test]
    fn sanitization_redacts_and_truncates() {
        let Value::Object(args) = json!({
            "api_key": "plain",
            "auth": "Bearer abc.def",
            "jwt": "eyJhbGciOiJIUzI1NiJ9.e30.x",
            "opaque": "AbCdEfGhIjKlMnOpQrStUvWxYz0123456789",
            "city": "Paris",
        }) else {
            unreachable!()
        };
        let out = sanitize_arguments(&args);
        assert!(out.contains("api_key=[REDACTED]"));
        assert!(out.contains("auth=[REDACTED]"));
        assert!(out.contains("jwt=[REDACTED]"));
        assert!(out.contains("opaque=[REDACTED]"));
        assert!(out.contains("city=Paris"));

        let Value::Object(nested) = json!({
            "auth": {"password": "hunter2", "user": "bob"},
            "headers": ["X-Api-Key: topsecret", "Accept: */*"],
            "env": [{"name": "HOME", "value": "/root"}, {"token": "abc"}],
        }) else {
            unreachable!()
        };
        let out = sanitize_arguments(&nested);
        assert!(!out.contains("hunter2"), "{out}");
        assert!(!out.contains("topsecret"), "{out}");
        assert!(!out.contains("abc"), "{out}");
        assert!(out.contains(r#""user":"bob""#), "{out}");
        assert!(out.contains("Accept: */*"), "{out}");

        let Value::Object(long) = json!({"q": "word ".repeat(60)}) else {
            unreachable!()
        };
        let out = sanitize_arguments(&long);
        assert!(out.chars().count() <= "q=".len() + MAX_ARGUMENT_VALUE_CHARS + 3);
        assert!(out.ends_with("..."));

        let mut many = Map::new();
        for i in 0..20 {
            many.insert(format!("field{i:02}"), json!("some ordinary value"));
        }
        let out = sanitize_arguments(&many);
        assert_eq!(out.chars().count(), MAX_ARGUMENTS_CHARS + 3);
    }
}
