//! Per-request orchestration: authenticate, parse, authorize, forward, filter, record.
//!
//! Every request that enters [`Pipeline::handle`] is recorded (audit + telemetry) exactly once,
//! including requests that are denied, fail, or are canceled by the client.

use crate::audit::Auditor;
use crate::authz::filter::{FilterOutcome, filter_body};
use crate::authz::{Authorizer, PolicyDecision};
use crate::claims::{Claims, ClaimsProvider};
use crate::error::{AuthError, UpstreamError};
use crate::mcp::parser::{self, EVENT_STREAM_MIME_TYPE, RequestKind};
use crate::mcp::unauthorized_response;
use crate::telemetry::Telemetry;
use crate::upstream::{Backend, BackendRequest};
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header, request};
use axum::response::{IntoResponse as _, Response};
use futures::StreamExt as _;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument as _, Span};

/// Status recorded for requests whose client went away before a response was produced.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Typed accumulator threaded through the stages of one request.
#[derive(Debug)]
pub struct RequestContext {
    pub http_method: Method,
    pub path: String,
    pub url: String,
    pub user_agent: Option<String>,
    pub content_length: Option<u64>,
    pub client_ip: Option<String>,
    pub transport: String,
    pub started: Instant,
    pub claims: Option<Arc<Claims>>,
    pub kind: RequestKind,
    pub decision: Option<PolicyDecision>,
    /// Captured only when audit request data is enabled.
    pub request_data: Option<Bytes>,
    /// Captured only for buffered responses (filtered, or audit response data enabled).
    pub response_data: Option<Bytes>,
}

impl RequestContext {
    #[must_use]
    pub fn new(http_method: Method, path: String, transport: &str) -> Self {
        Self {
            http_method,
            url: path.clone(),
            path,
            user_agent: None,
            content_length: None,
            client_ip: None,
            transport: transport.to_string(),
            started: Instant::now(),
            claims: None,
            kind: RequestKind::Unparsed,
            decision: None,
            request_data: None,
            response_data: None,
        }
    }

    fn from_parts(parts: &request::Parts, peer: Option<SocketAddr>, transport: &str) -> Self {
        let mut ctx = Self::new(parts.method.clone(), parts.uri.path().to_string(), transport);
        ctx.url = parts.uri.to_string();
        ctx.user_agent = header_str(&parts.headers, header::USER_AGENT).map(str::to_string);
        ctx.content_length =
            header_str(&parts.headers, header::CONTENT_LENGTH).and_then(|v| v.parse().ok());
        ctx.client_ip = client_ip(&parts.headers, peer);
        ctx
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First `X-Forwarded-For` entry, else the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|p| p.ip().to_string()))
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
    pub upstream_timeout: Duration,
}

pub struct Pipeline {
    claims: Arc<dyn ClaimsProvider>,
    authorizer: Arc<Authorizer>,
    backend: Arc<dyn Backend>,
    auditor: Arc<Auditor>,
    telemetry: Arc<Telemetry>,
    limits: PipelineLimits,
    transport: String,
}

/// Owns the request context until it is recorded. Dropping it unrecorded means the request was
/// canceled, which is recorded as [`CLIENT_CLOSED_REQUEST`].
struct InFlight<'a> {
    pipeline: &'a Pipeline,
    ctx: RequestContext,
    span: Option<Span>,
    recorded: bool,
}

impl InFlight<'_> {
    fn span(&mut self) -> Span {
        self.span
            .get_or_insert_with(|| self.pipeline.telemetry.start_span(&self.ctx))
            .clone()
    }

    fn complete(mut self, response: Response) -> Response {
        self.record(response.status().as_u16());
        response
    }

    fn record(&mut self, status: u16) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let elapsed = self.ctx.started.elapsed();
        let span = self.span();
        let m = self
            .pipeline
            .telemetry
            .finish(&span, &self.ctx, status, elapsed);
        span.in_scope(|| {
            tracing::debug!(name = %m.name, status, ?elapsed, "request recorded");
        });
        self.pipeline.auditor.record(&self.ctx, status, elapsed);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            tracing::info!(path = %self.ctx.path, "request canceled before completion");
            self.record(CLIENT_CLOSED_REQUEST);
        }
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(
        claims: Arc<dyn ClaimsProvider>,
        authorizer: Arc<Authorizer>,
        backend: Arc<dyn Backend>,
        auditor: Arc<Auditor>,
        telemetry: Arc<Telemetry>,
        limits: PipelineLimits,
        transport: &str,
    ) -> Self {
        Self {
            claims,
            authorizer,
            backend,
            auditor,
            telemetry,
            limits,
            transport: transport.to_string(),
        }
    }

    pub async fn handle(&self, req: Request, peer: Option<SocketAddr>) -> Response {
        let (parts, body) = req.into_parts();
        let mut flight = InFlight {
            pipeline: self,
            ctx: RequestContext::from_parts(&parts, peer, &self.transport),
            span: None,
            recorded: false,
        };

        // Authenticated (mandatory).
        let claims = match self.claims.resolve(&parts.headers).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::info!(error = %e, path = %flight.ctx.path, "authentication failed");
                return flight.complete(self.auth_challenge(&e));
            }
        };
        flight.ctx.claims = Some(Arc::clone(&claims));

        if flight
            .ctx
            .content_length
            .is_some_and(|len| len > self.limits.max_request_bytes as u64)
        {
            return flight.complete(payload_too_large());
        }
        let body = match axum::body::to_bytes(body, self.limits.max_request_bytes).await {
            Ok(b) => b,
            Err(e) => {
                tracing::info!(error = %e, "request body rejected");
                return flight.complete(payload_too_large());
            }
        };

        // Parsed (best-effort).
        flight.ctx.kind =
            parser::classify(&parts.method, &flight.ctx.path, &parts.headers, &body);
        if self.auditor.captures_request_data() && !body.is_empty() {
            flight.ctx.request_data = Some(body.clone());
        }

        // Authorized.
        let decision = self.authorizer.authorize(&claims, &flight.ctx.kind);
        let span = flight.span();
        span.in_scope(|| {
            tracing::debug!(
                decision = decision.label(),
                reason = %decision.reason,
                "authorization decided"
            );
        });
        let denied = decision.is_deny();
        let filter = decision.list_filter().cloned();
        flight.ctx.decision = Some(decision);
        if denied {
            let id = flight.ctx.kind.parsed().and_then(|p| p.id.as_ref());
            let resp = unauthorized_response(id);
            return flight.complete(resp);
        }

        // Handled.
        let streaming = flight.ctx.kind.is_stream_establishment();
        let backend_req = BackendRequest {
            method: parts.method.clone(),
            path_and_query: parts
                .uri
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_string(),
            headers: parts.headers.clone(),
            body,
            parsed: flight.ctx.kind.parsed().cloned(),
        };
        let resp = match self.call_backend(backend_req).instrument(span.clone()).await {
            Ok(r) => r,
            Err(e) => {
                span.in_scope(|| tracing::warn!(error = %e, "upstream call failed"));
                return flight.complete(upstream_error_response(&e));
            }
        };

        if streaming {
            // The span completes now; the connection gauge follows the body's lifetime.
            let guard = self.telemetry.connection_opened(&flight.ctx.transport);
            let (parts, body) = resp.into_parts();
            let stream = body.into_data_stream().map(move |chunk| {
                let _held = &guard;
                chunk
            });
            return flight.complete(Response::from_parts(parts, Body::from_stream(stream)));
        }

        // Filtered.
        let method = flight
            .ctx
            .kind
            .parsed()
            .map(|p| p.method.clone())
            .unwrap_or_default();
        let is_event_stream = header_str(resp.headers(), header::CONTENT_TYPE)
            .is_some_and(|ct| ct.contains(EVENT_STREAM_MIME_TYPE));
        let capture = self.auditor.captures_response_data() && !is_event_stream;
        if filter.is_none() && !capture {
            return flight.complete(resp);
        }

        if filter.is_some()
            && let Some(encoding) = header_str(resp.headers(), header::CONTENT_ENCODING)
                .filter(|e| !e.trim().eq_ignore_ascii_case("identity"))
        {
            let err = UpstreamError::Encoded(encoding.to_string());
            span.in_scope(|| tracing::warn!(error = %err, "refusing unfilterable list response"));
            return flight.complete(upstream_error_response(&err));
        }

        let (mut resp_parts, resp_body) = resp.into_parts();
        let limit = self.limits.max_response_bytes;
        let buffered = match axum::body::to_bytes(resp_body, limit).await {
            Ok(b) => b,
            Err(e) => {
                let err = UpstreamError::TooLarge(self.limits.max_response_bytes);
                span.in_scope(|| tracing::warn!(error = %e, "{err}"));
                return flight.complete(upstream_error_response(&err));
            }
        };
        let out = match &filter {
            Some(f) => {
                let ct = header_str(&resp_parts.headers, header::CONTENT_TYPE);
                match filter_body(&buffered, ct, &method, f) {
                    FilterOutcome::Filtered { body, removed } => {
                        span.in_scope(|| tracing::debug!(removed, "list result filtered"));
                        Bytes::from(body)
                    }
                    FilterOutcome::PassThrough => buffered,
                }
            }
            None => buffered,
        };
        resp_parts.headers.remove(header::CONTENT_LENGTH);
        if capture {
            flight.ctx.response_data = Some(out.clone());
        }
        flight.complete(Response::from_parts(resp_parts, Body::from(out)))
    }

    async fn call_backend(&self, req: BackendRequest) -> Result<Response, UpstreamError> {
        let timeout = self.limits.upstream_timeout;
        match tokio::time::timeout(timeout, self.backend.handle(req)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(timeout.as_millis())),
        }
    }

    fn auth_challenge(&self, err: &AuthError) -> Response {
        let mut challenge = format!("Bearer realm=\"{}\"", self.claims.realm());
        if let Some(code) = err.challenge_error() {
            challenge.push_str(&format!(", error=\"{code}\""));
        }
        let mut resp = (
            StatusCode::UNAUTHORIZED,
            [(header::CONTENT_TYPE, parser::JSON_MIME_TYPE)],
            json!({"error": "unauthorized", "message": err.to_string()}).to_string(),
        )
            .into_response();
        match HeaderValue::from_str(&challenge) {
            Ok(v) => {
                resp.headers_mut().insert(header::WWW_AUTHENTICATE, v);
            }
            Err(e) => {
                tracing::warn!(error = %e, "realm is not a valid header value");
                resp.headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
        }
        resp
    }
}

fn payload_too_large() -> Response {
    (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
}

fn upstream_error_response(err: &UpstreamError) -> Response {
    let status = match err {
        UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        UpstreamError::Transport(_) | UpstreamError::TooLarge(_) | UpstreamError::Encoded(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    (status, status.canonical_reason().unwrap_or("upstream error")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "192.0.2.1:5000".parse().expect("addr");
        let mut h = HeaderMap::new();
        assert_eq!(client_ip(&h, Some(peer)).as_deref(), Some("192.0.2.1"));
        h.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.9 , 10.0.0.1"));
        assert_eq!(client_ip(&h, Some(peer)).as_deref(), Some("203.0.113.9"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn upstream_errors_map_to_gateway_statuses() {
        assert_eq!(
            upstream_error_response(&UpstreamError::Timeout(10)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            upstream_error_response(&UpstreamError::Transport("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            upstream_error_response(&UpstreamError::TooLarge(1)).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            upstream_error_response(&UpstreamError::Encoded("gzip".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
