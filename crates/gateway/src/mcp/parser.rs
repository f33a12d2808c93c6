//! JSON-RPC envelope parsing and MCP method projection.
//!
//! Parsing never fails loudly: anything that is not a recognizable JSON-RPC message yields
//! [`RequestKind::Unparsed`] and later stages degrade on their own terms. A body that names a
//! method but breaks the envelope is [`RequestKind::Malformed`] so authorization can refuse it.

use axum::http::{HeaderMap, Method, header};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

/// JSON-RPC request id (string or number). Numbers keep their original form, so ids outside
/// `i64` or with a fraction round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// Structured view of one inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub method: String,
    pub id: Option<RequestId>,
    /// `params` as received, re-encoded as JSON bytes (empty when absent).
    pub raw_params: Vec<u8>,
    /// Method-dependent resource identifier; empty when the method addresses nothing.
    pub resource_id: String,
    pub arguments: Map<String, Value>,
    /// `true` for requests and notifications (messages carrying a `method`).
    pub is_request: bool,
    pub is_batch: bool,
}

impl ParsedRequest {
    fn batch() -> Self {
        Self {
            method: String::new(),
            id: None,
            raw_params: Vec::new(),
            resource_id: String::new(),
            arguments: Map::new(),
            is_request: false,
            is_batch: true,
        }
    }
}

/// Outcome of classifying an inbound HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Mcp(ParsedRequest),
    /// Long-lived server-push handshake; exempt from parsing and authorization.
    StreamEstablishment,
    /// Decodable JSON naming a method, but not a valid JSON-RPC envelope. For batches the
    /// method is empty.
    Malformed { method: String },
    /// Not a JSON POST, or not a decodable JSON-RPC envelope.
    Unparsed,
}

impl RequestKind {
    #[must_use]
    pub fn parsed(&self) -> Option<&ParsedRequest> {
        match self {
            Self::Mcp(p) => Some(p),
            _ => None,
        }
    }

    /// Method name from a parsed or malformed body; empty otherwise.
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Mcp(p) => &p.method,
            Self::Malformed { method } => method,
            _ => "",
        }
    }

    #[must_use]
    pub fn is_stream_establishment(&self) -> bool {
        matches!(self, Self::StreamEstablishment)
    }
}

/// How a method's `params` are projected into `resource_id` and `arguments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MethodHandler {
    Initialize,
    NamedResource,
    ResourceUri,
    List,
    Progress,
    NotificationMessage,
    SetLevel,
    Completion,
    Cancelled,
    Static(&'static str),
}

/// Every method the parser knows how to project.
pub const KNOWN_METHODS: &[&str] = &[
    "initialize",
    "tools/call",
    "prompts/get",
    "resources/read",
    "resources/subscribe",
    "resources/unsubscribe",
    "resources/list",
    "resources/templates/list",
    "tools/list",
    "prompts/list",
    "progress/update",
    "notifications/progress",
    "notifications/message",
    "notifications/cancelled",
    "logging/setLevel",
    "completion/complete",
    "ping",
    "notifications/roots/list_changed",
    "notifications/initialized",
];

static METHOD_TABLE: LazyLock<HashMap<&'static str, MethodHandler>> = LazyLock::new(|| {
    use MethodHandler as H;
    HashMap::from([
        ("initialize", H::Initialize),
        ("tools/call", H::NamedResource),
        ("prompts/get", H::NamedResource),
        ("resources/read", H::ResourceUri),
        ("resources/subscribe", H::ResourceUri),
        ("resources/unsubscribe", H::ResourceUri),
        ("resources/list", H::List),
        ("resources/templates/list", H::List),
        ("tools/list", H::List),
        ("prompts/list", H::List),
        ("progress/update", H::Progress),
        ("notifications/progress", H::Progress),
        ("notifications/message", H::NotificationMessage),
        ("notifications/cancelled", H::Cancelled),
        ("logging/setLevel", H::SetLevel),
        ("completion/complete", H::Completion),
        ("ping", H::Static("ping")),
        ("notifications/roots/list_changed", H::Static("roots")),
        ("notifications/initialized", H::Static("initialized")),
    ])
});

/// Check the dispatch table against [`KNOWN_METHODS`]. Called once at startup.
///
/// # Errors
///
/// Returns the list of methods that have no handler, or handlers for unlisted methods.
pub fn verify_method_table() -> Result<(), String> {
    let missing: Vec<&str> = KNOWN_METHODS
        .iter()
        .copied()
        .filter(|m| !METHOD_TABLE.contains_key(m))
        .collect();
    let extra: Vec<&str> = METHOD_TABLE
        .keys()
        .copied()
        .filter(|m| !KNOWN_METHODS.contains(m))
        .collect();
    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }
    Err(format!(
        "method table mismatch: missing handlers {missing:?}, unlisted handlers {extra:?}"
    ))
}

/// Classify an inbound request and, for JSON POSTs, decode the JSON-RPC envelope.
#[must_use]
pub fn classify(method: &Method, path: &str, headers: &HeaderMap, body: &[u8]) -> RequestKind {
    if is_stream_establishment(method, path, headers) {
        return RequestKind::StreamEstablishment;
    }
    if method != Method::POST || !is_json_content_type(headers) {
        return RequestKind::Unparsed;
    }
    match parse_body(body) {
        Some(parsed) => RequestKind::Mcp(parsed),
        None => malformed(body).unwrap_or(RequestKind::Unparsed),
    }
}

/// A body that failed envelope checks but still names a method somewhere.
fn malformed(body: &[u8]) -> Option<RequestKind> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let method = match &value {
        Value::Object(obj) => obj.get("method")?.as_str()?.to_string(),
        Value::Array(items) => {
            items
                .iter()
                .find(|i| i.get("method").is_some_and(Value::is_string))?;
            String::new()
        }
        _ => return None,
    };
    Some(RequestKind::Malformed { method })
}

fn is_stream_establishment(method: &Method, path: &str, headers: &HeaderMap) -> bool {
    if method != Method::GET {
        return false;
    }
    let accepts_stream = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(EVENT_STREAM_MIME_TYPE));
    accepts_stream || path.trim_end_matches('/').ends_with("/sse")
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    let Some(ct) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
    else {
        return false;
    };
    let essence = ct.split(';').next().unwrap_or(ct).trim();
    essence.eq_ignore_ascii_case(JSON_MIME_TYPE)
        || essence.to_ascii_lowercase().ends_with("+json")
}

/// Decode a JSON-RPC 2.0 message (single object or batch array).
#[must_use]
pub fn parse_body(body: &[u8]) -> Option<ParsedRequest> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value {
        Value::Array(items) => {
            let valid = !items.is_empty() && items.iter().all(is_envelope);
            valid.then(ParsedRequest::batch)
        }
        Value::Object(obj) => parse_message(obj),
        _ => None,
    }
}

fn is_envelope(v: &Value) -> bool {
    v.as_object()
        .is_some_and(|o| o.get("jsonrpc").and_then(Value::as_str) == Some("2.0"))
}

fn parse_message(mut obj: Map<String, Value>) -> Option<ParsedRequest> {
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return None;
    }
    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(RequestId::String(s.clone())),
        Some(Value::Number(n)) => Some(RequestId::Number(n.clone())),
        Some(_) => return None,
    };
    let method = match obj.get("method") {
        Some(Value::String(m)) => Some(m.clone()),
        None => None,
        Some(_) => return None,
    };
    let params = obj.remove("params");
    let raw_params = match &params {
        Some(p) => serde_json::to_vec(p).ok()?,
        None => Vec::new(),
    };

    let mut parsed = ParsedRequest {
        method: method.clone().unwrap_or_default(),
        id,
        raw_params,
        resource_id: String::new(),
        arguments: Map::new(),
        is_request: method.is_some(),
        is_batch: false,
    };

    if let Some(handler) = method.as_deref().and_then(|m| METHOD_TABLE.get(m)) {
        let params = match params {
            Some(Value::Object(p)) => p,
            _ => Map::new(),
        };
        let (resource_id, arguments) = project(*handler, params);
        parsed.resource_id = resource_id;
        parsed.arguments = arguments;
    }
    Some(parsed)
}

fn project(handler: MethodHandler, mut params: Map<String, Value>) -> (String, Map<String, Value>) {
    match handler {
        MethodHandler::Initialize => match params.remove("clientInfo") {
            Some(Value::Object(info)) => (String::new(), info),
            _ => (String::new(), Map::new()),
        },
        MethodHandler::NamedResource => {
            let name = take_string(&mut params, "name");
            let args = match params.remove("arguments") {
                Some(Value::Object(a)) => a,
                _ => Map::new(),
            };
            (name, args)
        }
        MethodHandler::ResourceUri => (take_string(&mut params, "uri"), Map::new()),
        MethodHandler::List => (String::new(), pick(&mut params, "cursor")),
        MethodHandler::Progress => (String::new(), pick(&mut params, "progressToken")),
        MethodHandler::NotificationMessage => (String::new(), pick(&mut params, "method")),
        MethodHandler::SetLevel => (String::new(), pick(&mut params, "level")),
        MethodHandler::Completion => (String::new(), pick(&mut params, "ref")),
        MethodHandler::Cancelled => (String::new(), pick(&mut params, "requestId")),
        MethodHandler::Static(id) => (id.to_string(), Map::new()),
    }
}

fn take_string(params: &mut Map<String, Value>, key: &str) -> String {
    match params.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn pick(params: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(v) = params.remove(key).filter(|v| !v.is_null()) {
        out.insert(key.to_string(), v);
    }
    out
}
