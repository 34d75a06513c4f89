use anyhow::Context;
use std::net::SocketAddr;
use tether_hub::{config::load_config, logging::init_logging, serve, AppState};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;
    if config.token.is_none() {
        warn!(event = "auth_disabled", addr = %addr);
    }

    let reaper_interval = config.reaper_interval();
    let state = AppState::from_config(config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    state.hub.clone().spawn_reaper(reaper_interval, shutdown_rx);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        event = "hub_start",
        addr = %addr,
        projects_root = %config.projects_root.display()
    );

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
        let _ = shutdown_tx.send(true);
    };
    serve(listener, state, shutdown).await.context("serve")?;
    Ok(())
}
