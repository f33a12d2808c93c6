use anyhow::Context as _;
use clap::Parser as _;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use unrelated_mcp_guard::config::{Cli, Config, LogFormat};
use unrelated_mcp_guard::mcp::parser::verify_method_table;
use unrelated_mcp_guard::server::{self, AppState};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn spawn_shutdown_listener(token: CancellationToken) {
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received SIGINT, shutting down"),
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGINT"),
        }
        ctrl_c.cancel();
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("received SIGTERM, shutting down");
                token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGTERM"),
        }
    });
}

#[cfg(unix)]
fn spawn_reload_listener(
    config_path: std::path::PathBuf,
    engine: std::sync::Arc<unrelated_mcp_guard::authz::cedar::PolicyEngine>,
) {
    use tokio::signal::unix::{SignalKind, signal};
    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGHUP");
                return;
            }
        };
        while sighup.recv().await.is_some() {
            match server::reload_policies(&config_path, &engine) {
                Ok(()) => tracing::info!(
                    policies = engine.snapshot().policy_count(),
                    "policy set reloaded"
                ),
                Err(e) => tracing::warn!(
                    error = %format!("{e:#}"),
                    "policy reload failed; keeping current set"
                ),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    verify_method_table().map_err(anyhow::Error::msg)?;

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    let gateway = server::build(&cfg, &server::config_dir(&cli.config)).await?;
    tracing::info!(
        upstream = %cfg.upstream.url,
        auth = ?cfg.auth.mode,
        policies = gateway.engine.snapshot().policy_count(),
        "gateway configured"
    );

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    #[cfg(unix)]
    spawn_reload_listener(cli.config.clone(), gateway.engine.clone());

    let bind = cli.bind.unwrap_or(cfg.server.bind);
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    let app = server::router(AppState {
        pipeline: gateway.pipeline,
        registry: cfg.telemetry.metrics_enabled.then_some(gateway.registry),
    });
    server::serve(listener, app, shutdown).await
}
