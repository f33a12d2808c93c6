//! HTTP surface and process wiring.

use crate::audit::{AuditSink, Auditor, FileAuditSink, MultiSink, TracingAuditSink};
use crate::authz::Authorizer;
use crate::authz::cedar::PolicyEngine;
use crate::claims::{AnonymousClaims, ClaimsProvider, LocalUserClaims, OidcClaims};
use crate::config::{AuthMode, Config};
use crate::oidc::{OidcSettings, OidcValidator};
use crate::pipeline::{Pipeline, PipelineLimits};
use crate::telemetry::{Metrics, Telemetry};
use crate::upstream::{Backend, HttpUpstream};
use anyhow::Context as _;
use axum::{
    Extension, Json, Router,
    extract::{ConnectInfo, Request},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder as _, Registry, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// `None` disables `/metrics`.
    pub registry: Option<Registry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(proxy)
        .layer(Extension(Arc::new(state)))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics(Extension(state): Extension<Arc<AppState>>) -> Response {
    let Some(registry) = &state.registry else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode prometheus metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response();
    }
    match HeaderValue::from_str(encoder.format_type()) {
        Ok(ct) => ([(header::CONTENT_TYPE, ct)], buffer).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to build metrics content-type");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}

async fn proxy(Extension(state): Extension<Arc<AppState>>, req: Request) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    state.pipeline.handle(req, peer).await
}

/// Everything a running gateway shares across requests.
pub struct Gateway {
    pub pipeline: Arc<Pipeline>,
    pub engine: Arc<PolicyEngine>,
    pub registry: Registry,
}

/// Directory relative policy files resolve against.
#[must_use]
pub fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Build every pipeline component from config. Policy compile errors are fatal here.
///
/// # Errors
///
/// Returns an error for unreadable policy files, policy compile errors, failed OIDC discovery,
/// an unopenable audit log file, or metric registration failures.
pub async fn build(cfg: &Config, config_dir: &Path) -> anyhow::Result<Gateway> {
    let http = reqwest::Client::builder()
        .build()
        .context("build http client")?;

    let claims: Arc<dyn ClaimsProvider> = match cfg.auth.mode {
        AuthMode::Anonymous => Arc::new(AnonymousClaims),
        AuthMode::Local => {
            let user = cfg
                .auth
                .local_user
                .as_ref()
                .context("auth.localUser is required for local mode")?;
            Arc::new(LocalUserClaims::new(user.username.clone(), user.roles.clone()))
        }
        AuthMode::Oidc => {
            let oidc = cfg
                .auth
                .oidc
                .as_ref()
                .context("auth.oidc is required for oidc mode")?;
            let validator = OidcValidator::connect(
                http.clone(),
                OidcSettings {
                    issuer: oidc.issuer.clone(),
                    audiences: oidc.audiences.clone(),
                    jwks_uri: oidc.jwks_uri.clone(),
                    leeway_secs: oidc.leeway_secs,
                    jwks_refresh_secs: oidc.jwks_refresh_secs,
                },
            )
            .await
            .context("initialize oidc validator")?;
            Arc::new(OidcClaims::new(
                validator,
                oidc.roles_claim.clone(),
                cfg.auth.realm.clone(),
            ))
        }
    };

    let source = cfg.authz.policy_source(config_dir)?;
    let engine = Arc::new(PolicyEngine::new(&source).context("compile policy set")?);
    let authorizer = Arc::new(Authorizer::new(
        Arc::clone(&engine),
        &cfg.authz.passthrough_methods,
    ));

    let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
    if let Some(path) = &cfg.audit.log_file {
        let file = FileAuditSink::open(path, cfg.audit.log_file_buffer)
            .await
            .with_context(|| format!("open audit log {}", path.display()))?;
        sinks.push(Arc::new(file));
    }
    let auditor = Arc::new(Auditor::new(
        &cfg.audit,
        &cfg.server.name,
        Arc::new(MultiSink(sinks)),
    ));

    let registry = Registry::new();
    let metrics = Metrics::register(&registry).context("register metrics")?;
    let telemetry = Arc::new(Telemetry::new(
        metrics,
        &cfg.server.name,
        &cfg.telemetry.environment_variables,
    ));

    let backend: Arc<dyn Backend> = Arc::new(HttpUpstream::new(
        http,
        &cfg.upstream.url,
        cfg.upstream.forward_authorization,
    ));

    let pipeline = Arc::new(Pipeline::new(
        claims,
        authorizer,
        backend,
        auditor,
        telemetry,
        PipelineLimits {
            max_request_bytes: cfg.upstream.max_request_bytes,
            max_response_bytes: cfg.upstream.max_response_bytes,
            upstream_timeout: Duration::from_secs(cfg.upstream.timeout_secs),
        },
        &cfg.server.transport,
    ));

    Ok(Gateway {
        pipeline,
        engine,
        registry,
    })
}

/// Re-read the config file and swap in its policy set. The running set stays on error.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the policies do not compile.
pub fn reload_policies(config_path: &Path, engine: &PolicyEngine) -> anyhow::Result<()> {
    let cfg = Config::load(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let source = cfg.authz.policy_source(&config_dir(config_path))?;
    engine.reload(&source).context("compile reloaded policy set")?;
    Ok(())
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "gateway listening");
    }
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("serve")
}
