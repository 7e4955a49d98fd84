use anyhow::Result;
use chrono::Utc;
use oxwatch_notify::plugin::ChannelRegistry;
use oxwatch_notify::silence::SilenceStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration};
use tracing_subscriber::EnvFilter;

use oxwatch_server::app;
use oxwatch_server::config::{self, ServerConfig};
use oxwatch_server::engine::Engine;
use oxwatch_server::metrics::init_prometheus_recorder;
use oxwatch_server::snapshot::ConfigSnapshot;
use oxwatch_server::source::PrometheusSource;
use oxwatch_server::state::AppState;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  oxwatch-server [config.toml]         Start the server (default: {})", config::DEFAULT_CONFIG_PATH);
    eprintln!("  oxwatch-server check <config.toml>   Validate a config file and exit");
}

#[tokio::main]
async fn main() -> Result<()> {
    oxwatch_common::id::init(1, 1);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("oxwatch=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("check") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check requires a <config.toml> argument")
            })?;
            run_check(config_path)
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or(config::DEFAULT_CONFIG_PATH);
            run_server(config_path).await
        }
    }
}

/// Builds a snapshot from the file without starting anything.
fn run_check(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let snapshot = ConfigSnapshot::build(&config, &ChannelRegistry::default(), 1)?;
    tracing::info!(
        path = %config_path,
        rules = snapshot.rules.len(),
        receivers = snapshot.channels.len(),
        inhibit_rules = snapshot.inhibit_rules.len(),
        "Configuration is valid"
    );
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;

    tracing::info!(
        http_port = config.http_port,
        source = %config.source.url,
        rules = config.rules.len(),
        receivers = config.receivers.len(),
        "oxwatch-server starting"
    );

    let metrics_handle = init_prometheus_recorder();
    let registry = Arc::new(ChannelRegistry::default());
    let snapshot = ConfigSnapshot::build(&config, &registry, 1)?;

    let source = Arc::new(PrometheusSource::new(
        &config.source.url,
        config.engine.evaluation_timeout(),
    )?);
    let silences = Arc::new(SilenceStore::new());

    let engine = Engine::new(
        snapshot,
        source,
        silences.clone(),
        config.engine.clone(),
        config.dispatch.to_dispatch_config(),
    );
    engine.start();

    let state = AppState::new(engine.clone(), silences.clone(), registry)
        .with_config_path(config_path)
        .with_metrics(metrics_handle);

    // Expired silence cleanup
    let silence_retention = config.engine.silence_retention();
    let gc_silences = silences.clone();
    let cleanup_handle = tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let removed = gc_silences.gc(Utc::now(), silence_retention);
            if removed > 0 {
                tracing::info!(removed, "Cleaned up expired silences");
            }
        }
    });

    let reload_handle = spawn_reload_on_sighup(state.clone());

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_app = app::build_http_app(state.clone());
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_server = axum::serve(http_listener, http_app.into_make_service());

    tracing::info!(http = %http_addr, "Server started");

    tokio::select! {
        result = http_server.with_graceful_shutdown(async { signal::ctrl_c().await.ok(); }) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server error");
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("Shutting down gracefully");
        }
    }

    cleanup_handle.abort();
    if let Some(h) = reload_handle {
        h.abort();
    }
    engine.stop();
    tracing::info!("Server stopped");

    Ok(())
}

#[cfg(unix)]
fn spawn_reload_on_sighup(state: AppState) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGHUP handler, reload via HTTP only");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading configuration");
            if let Ok(version) = state.reload().await {
                tracing::info!(version, "Configuration reload applied");
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(_state: AppState) -> Option<tokio::task::JoinHandle<()>> {
    None
}
