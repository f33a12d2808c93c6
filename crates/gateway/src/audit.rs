//! Audit recorder: one structured event per request, emitted best-effort.

use crate::authz::feature_operation;
use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::mcp::parser::RequestKind;
use crate::pipeline::RequestContext;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::mpsc;

pub const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failure,
    Error,
}

impl AuditOutcome {
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Denied,
            200..=299 => Self::Success,
            400..=499 => Self::Failure,
            500..=599 => Self::Error,
            // 1xx/3xx are not produced by the pipeline itself; treat like success.
            _ => Self::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSubjects {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTarget {
    pub endpoint: String,
    pub method: String,
    pub resource_type: String,
    #[serde(rename = "resourceID")]
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditMetadata {
    #[serde(rename = "auditID")]
    pub audit_id: String,
    pub duration_ms: u64,
    pub transport: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub logged_at: String,
    pub source: AuditSource,
    pub outcome: AuditOutcome,
    pub subjects: AuditSubjects,
    pub component: String,
    pub target: AuditTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<AuditData>,
    pub metadata: AuditMetadata,
}

/// Event type, by MCP method first, `http_request` when no method was parsed.
#[must_use]
pub fn event_type(kind: &RequestKind) -> &'static str {
    if kind.is_stream_establishment() {
        return "sse_connection";
    }
    match kind.method() {
        "" => "http_request",
        "tools/call" => "mcp_tool_call",
        "resources/read" => "mcp_resource_read",
        "prompts/get" => "mcp_prompt_get",
        "initialize" => "mcp_initialize",
        "ping" => "mcp_ping",
        m if m.ends_with("/list") => "mcp_list_operation",
        m if m.starts_with("notifications/") => "mcp_notification",
        m if m.starts_with("logging/") => "mcp_logging",
        m if m.starts_with("completion/") => "mcp_completion",
        _ => "mcp_request",
    }
}

/// Cap `data` at `max` bytes (on a char boundary) and append [`TRUNCATION_MARKER`] when cut.
#[must_use]
pub fn capture(data: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(data);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&text[..end]);
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Destination for audit events. Must not block the caller.
pub trait AuditSink: Send + Sync {
    /// # Errors
    ///
    /// Returns an [`AuditError`] when the event cannot be accepted; the caller logs and drops it.
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes each event as a JSON `tracing` record under target `audit`.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(event)?;
        tracing::info!(
            target: "audit",
            audit_id = %event.metadata.audit_id,
            event_type = event.event_type,
            outcome = ?event.outcome,
            event = %json,
            "audit event"
        );
        Ok(())
    }
}

/// Appends JSON lines to a file from a background task fed by a bounded channel.
pub struct FileAuditSink {
    tx: mpsc::Sender<String>,
}

impl FileAuditSink {
    /// Open (append) `path` and spawn the writer task.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let shown = path.display().to_string();
        tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %e, path = %shown, "audit file write failed");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    tracing::warn!(error = %e, path = %shown, "audit file flush failed");
                }
            }
        });
        Ok(Self { tx })
    }
}

impl AuditSink for FileAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(event)?;
        self.tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::SinkFull,
            mpsc::error::TrySendError::Closed(_) => AuditError::SinkClosed,
        })
    }
}

/// Fans one event out to several sinks; a failing sink does not stop the others.
pub struct MultiSink(pub Vec<Arc<dyn AuditSink>>);

impl AuditSink for MultiSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut first_err = None;
        for sink in &self.0 {
            if let Err(e) = sink.emit(event) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

pub struct Auditor {
    enabled: bool,
    component: String,
    include_request_data: bool,
    include_response_data: bool,
    max_data_size: usize,
    event_types: HashSet<String>,
    exclude_event_types: HashSet<String>,
    sink: Arc<dyn AuditSink>,
}

impl Auditor {
    #[must_use]
    pub fn new(cfg: &AuditConfig, server_name: &str, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            enabled: cfg.enabled,
            component: cfg
                .component
                .clone()
                .unwrap_or_else(|| server_name.to_string()),
            include_request_data: cfg.include_request_data,
            include_response_data: cfg.include_response_data,
            max_data_size: cfg.max_data_size,
            event_types: cfg.event_types.iter().cloned().collect(),
            exclude_event_types: cfg.exclude_event_types.iter().cloned().collect(),
            sink,
        }
    }

    #[must_use]
    pub fn captures_request_data(&self) -> bool {
        self.enabled && self.include_request_data
    }

    #[must_use]
    pub fn captures_response_data(&self) -> bool {
        self.enabled && self.include_response_data
    }

    fn wants(&self, event_type: &str) -> bool {
        if self.exclude_event_types.contains(event_type) {
            return false;
        }
        self.event_types.is_empty() || self.event_types.contains(event_type)
    }

    #[must_use]
    pub fn build_event(&self, ctx: &RequestContext, status: u16, elapsed: Duration) -> AuditEvent {
        let parsed = ctx.kind.parsed().filter(|p| !p.method.is_empty());
        let target = match parsed {
            Some(p) => AuditTarget {
                endpoint: ctx.path.clone(),
                method: p.method.clone(),
                resource_type: feature_operation(&p.method)
                    .map(|(f, _)| f.as_str().to_string())
                    .unwrap_or_default(),
                resource_id: p.resource_id.clone(),
            },
            None => AuditTarget {
                endpoint: ctx.path.clone(),
                method: ctx.http_method.to_string(),
                resource_type: String::new(),
                resource_id: String::new(),
            },
        };
        let subjects = ctx
            .claims
            .as_ref()
            .map(|c| AuditSubjects {
                user: Some(c.subject.clone()),
                name: c.name.clone(),
            })
            .unwrap_or_default();

        let mut data = AuditData::default();
        if self.include_request_data
            && let Some(body) = &ctx.request_data
        {
            data.request = Some(capture(body, self.max_data_size));
        }
        if self.include_response_data
            && let Some(body) = &ctx.response_data
        {
            data.response = Some(capture(body, self.max_data_size));
        }
        let data = (data != AuditData::default()).then_some(data);

        AuditEvent {
            event_type: event_type(&ctx.kind),
            logged_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            source: AuditSource {
                source_type: "network".to_string(),
                value: ctx.client_ip.clone().unwrap_or_default(),
            },
            outcome: AuditOutcome::from_status(status),
            subjects,
            component: self.component.clone(),
            target,
            data,
            metadata: AuditMetadata {
                audit_id: uuid::Uuid::new_v4().to_string(),
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                transport: ctx.transport.clone(),
            },
        }
    }

    /// Build and emit the event for a finished request. Failures are logged, never returned.
    pub fn record(&self, ctx: &RequestContext, status: u16, elapsed: Duration) {
        if !self.enabled || !self.wants(event_type(&ctx.kind)) {
            return;
        }
        let event = self.build_event(ctx, status, elapsed);
        if let Err(e) = self.sink.emit(&event) {
            tracing::warn!(
                error = %e,
                audit_id = %event.metadata.audit_id,
                event_type = event.event_type,
                "audit emission failed"
            );
        }
    }
}
