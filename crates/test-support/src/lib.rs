use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Pick an unused TCP port on localhost.
///
/// Note: this does not reserve the port; it's still possible for another process to bind it
/// before you do.
///
/// # Errors
///
/// Returns an error if binding an ephemeral localhost port fails or if the bound socket's
/// local address cannot be read.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Poll an HTTP URL until it returns a success status (2xx/3xx).
///
/// # Errors
///
/// Returns an error if the timeout elapses before the endpoint returns a success status.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

/// Tool names served by [`MockMcpUpstream`] for `tools/list`, in order.
pub const MOCK_TOOLS: [&str; 5] = ["weather", "calculator", "search", "delete_file", "slow"];

/// How long the `slow` tool takes to answer.
pub const SLOW_TOOL_DELAY: Duration = Duration::from_secs(5);

/// Prompt names served for `prompts/list`, in order.
pub const MOCK_PROMPTS: [&str; 2] = ["greeting", "summary"];

/// Resource URIs served for `resources/list`, in order.
pub const MOCK_RESOURCES: [&str; 2] = ["file:///public.txt", "file:///secret.txt"];

/// URI templates served for `resources/templates/list`, in order.
pub const MOCK_RESOURCE_TEMPLATES: [&str; 2] = ["file:///logs/{day}", "db://{table}"];

#[derive(Default)]
struct MockState {
    hits: AtomicUsize,
}

/// Canned MCP server on `127.0.0.1`, serving `POST /mcp` and an SSE `GET /mcp`.
///
/// A `POST` whose `Accept` names `text/event-stream` is answered as one SSE event with the
/// JSON message pretty-printed over several `data:` lines.
///
/// The server task is aborted on drop.
pub struct MockMcpUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: tokio::task::JoinHandle<()>,
}

impl MockMcpUpstream {
    /// # Errors
    ///
    /// Returns an error if no localhost port can be bound.
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/mcp", post(rpc).get(stream))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock upstream")?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, state, task })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests that reached the mock, of any kind.
    #[must_use]
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockMcpUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn rpc(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(req): Json<Value>,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let id = req.get("id").cloned().unwrap_or(Value::Null);
    let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
    let result = match method {
        "tools/list" => json!({
            "tools": MOCK_TOOLS
                .iter()
                .map(|name| json!({"name": name, "inputSchema": {"type": "object"}}))
                .collect::<Vec<_>>()
        }),
        "prompts/list" => json!({
            "prompts": MOCK_PROMPTS.iter().map(|name| json!({"name": name})).collect::<Vec<_>>()
        }),
        "resources/list" => json!({
            "resources": MOCK_RESOURCES.iter().map(|uri| json!({"uri": uri})).collect::<Vec<_>>()
        }),
        "resources/templates/list" => json!({
            "resourceTemplates": MOCK_RESOURCE_TEMPLATES
                .iter()
                .map(|t| json!({"uriTemplate": t}))
                .collect::<Vec<_>>()
        }),
        "tools/call" => {
            let params = req.get("params").cloned().unwrap_or(Value::Null);
            if params.get("name").and_then(Value::as_str) == Some("slow") {
                tokio::time::sleep(SLOW_TOOL_DELAY).await;
            }
            let text = params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Null)
                .to_string();
            json!({"content": [{"type": "text", "text": text}], "isError": false})
        }
        _ => json!({}),
    };
    let message = json!({"jsonrpc": "2.0", "id": id, "result": result});
    let wants_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));
    if !wants_stream {
        return Json(message).into_response();
    }
    let pretty = serde_json::to_string_pretty(&message).unwrap_or_default();
    let mut body = String::from("event: message\n");
    for line in pretty.lines() {
        body.push_str("data: ");
        body.push_str(line);
        body.push('\n');
    }
    body.push('\n');
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn stream(State(state): State<Arc<MockState>>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        "event: endpoint\ndata: /mcp\n\n",
    )
        .into_response()
}
