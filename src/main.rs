use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod backends;
mod config;
mod error;
mod model;
mod relay;
mod usage;

use config::Config;

const DEFAULT_CONFIG_PATH: &str = "./settings.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Secrets usually live in .env next to the settings file; absence is fine.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=info,tower_http=warn".into()),
        )
        .init();

    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    let config_path = config_path(std::env::args().skip(1));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let config = Arc::new(config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("server.host / server.port do not form a socket address")?;
    let static_dir = config.server.static_dir.clone();

    let state = Arc::new(relay::RelayState::new(
        Arc::clone(&config),
        config_path.clone(),
    ));
    info!(
        config = %config_path.display(),
        static_dir = %static_dir.display(),
        log_dir = %state.usage.dir().display(),
        "chat-relay starting"
    );

    // Hot-reload watcher, polls the config file every 5 seconds
    tokio::spawn(config_watcher(Arc::clone(&state)));

    let app = api::app(Arc::clone(&state), &static_dir);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("shut down");
    Ok(())
}

/// Settings file: `--settings=<path>`, else `CHAT_RELAY_CONFIG`, else `./settings.toml`.
fn config_path(args: impl Iterator<Item = String>) -> PathBuf {
    let from_args = args
        .filter_map(|arg| arg.strip_prefix("--settings=").map(str::to_owned))
        .find(|path| !path.is_empty());

    from_args
        .or_else(|| std::env::var("CHAT_RELAY_CONFIG").ok().filter(|p| !p.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `chat-relay --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("CHAT_RELAY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(3000);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let healthy = match reqwest::get(&url).await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    };

    std::process::exit(if healthy { 0 } else { 1 });
}

/// Background task: polls the config file every 5 seconds and hot-reloads on change.
///
/// Uses filesystem `mtime` for change detection. Parse or validation failures
/// are logged and ignored; the running config is unchanged. Only the
/// allow-list and `unavailable_models` take effect live: backend clients keep
/// the settings they were built with, and the listener and log directory
/// need a restart.
async fn config_watcher(state: Arc<relay::RelayState>) {
    let mut last_mtime = modified(&state.config_path);

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;
        reload_if_changed(&state, &mut last_mtime);
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// One watcher step: reload the config when its mtime differs from `last_mtime`.
///
/// Returns `true` when the live config was replaced. A failed load leaves
/// `last_mtime` alone so the next tick retries.
fn reload_if_changed(state: &relay::RelayState, last_mtime: &mut Option<SystemTime>) -> bool {
    let path = &state.config_path;
    let mtime = modified(path);
    if mtime == *last_mtime {
        return false;
    }

    match Config::load(path) {
        Ok(new_cfg) => {
            state.replace_config(Arc::new(new_cfg));
            info!(path = %path.display(), "config hot-reloaded");
            *last_mtime = mtime;
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{e:#}"), "config reload failed, keeping previous config");
            false
        }
    }
}
