//! Backend handler: forwards authorized requests to the MCP server behind the gateway.

use crate::error::UpstreamError;
use crate::mcp::parser::ParsedRequest;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, Method, header};
use axum::response::Response;

/// Added to every forwarded request so upstream logs can tell gateway traffic apart.
pub const FORWARDED_BY_HEADER: &str = "x-mcp-guard-forwarded";

/// What the pipeline hands to the backend once a request is allowed.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub parsed: Option<ParsedRequest>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn handle(&self, req: BackendRequest) -> Result<Response, UpstreamError>;
}

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Reverse proxy to a single HTTP MCP server.
pub struct HttpUpstream {
    http: reqwest::Client,
    base_url: String,
    forward_authorization: bool,
}

impl HttpUpstream {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: &str, forward_authorization: bool) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            forward_authorization,
        }
    }

    fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in inbound {
            // Responses must come back in a form list filtering can read.
            if is_hop_by_hop(name) || name == header::ACCEPT_ENCODING {
                continue;
            }
            // Caller credentials are for the gateway unless explicitly passed through.
            if name == header::AUTHORIZATION && !self.forward_authorization {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
        out.insert(
            HeaderName::from_static(FORWARDED_BY_HEADER),
            header::HeaderValue::from_static("1"),
        );
        out
    }
}

#[async_trait]
impl Backend for HttpUpstream {
    async fn handle(&self, req: BackendRequest) -> Result<Response, UpstreamError> {
        let url = format!("{}{}", self.base_url, req.path_and_query);
        let resp = self
            .http
            .request(req.method, &url)
            .headers(self.outbound_headers(&req.headers))
            .body(req.body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let mut builder = Response::builder().status(resp.status());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in resp.headers() {
                if !is_hop_by_hop(name) {
                    headers.append(name.clone(), value.clone());
                }
            }
        }
        builder
            .body(Body::from_stream(resp.bytes_stream()))
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}
