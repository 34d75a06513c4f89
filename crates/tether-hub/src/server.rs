use crate::{
    agent::run_agent,
    auth::{presented_token, AllowAll, StaticTokenVerifier, TokenVerifier},
    config::HubConfig,
    connection::run_client,
    history::{HistorySource, TranscriptHistory},
    hub::BridgeHub,
    pty::PtyBackend,
    terminal::TerminalBackend,
};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tether_core::{discover, resolve_limit};
use tokio::net::TcpListener;
use tracing::{error, warn};

/// Shared by every route. Collaborators are injected here rather than held in globals.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BridgeHub>,
    pub config: Arc<HubConfig>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub terminals: Arc<dyn TerminalBackend>,
    conn_counter: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        config: HubConfig,
        history: Arc<dyn HistorySource>,
        verifier: Arc<dyn TokenVerifier>,
        terminals: Arc<dyn TerminalBackend>,
    ) -> Self {
        Self {
            hub: Arc::new(BridgeHub::new(config.hub_settings(), history)),
            config: Arc::new(config),
            verifier,
            terminals,
            conn_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Transcript-backed history, the configured token (or none) and native PTYs.
    pub fn from_config(config: HubConfig) -> Self {
        let history = Arc::new(TranscriptHistory::new(
            config.projects_root.clone(),
            config.history_max_bytes,
        ));
        let verifier: Arc<dyn TokenVerifier> = match &config.token {
            Some(token) => Arc::new(StaticTokenVerifier::new(token)),
            None => Arc::new(AllowAll),
        };
        let terminals = Arc::new(PtyBackend::new(config.shell.clone()));
        Self::new(config, history, verifier, terminals)
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        self.verifier.verify(presented_token(headers, query_token))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    token: Option<String>,
    root: Option<String>,
    limit: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(client_ws_handler))
        .route("/agent", get(agent_ws_handler))
        .route("/sessions", get(sessions_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn client_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    State(state): State<AppState>,
) -> Response {
    if !state.authorized(&headers, query.token.as_deref()) {
        warn!(event = "auth_rejected", remote = %remote, route = "/ws");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| run_client(state, socket, remote))
}

async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    State(state): State<AppState>,
) -> Response {
    if !state.authorized(&headers, query.token.as_deref()) {
        warn!(event = "auth_rejected", remote = %remote, route = "/agent");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| run_agent(state, socket, remote))
}

async fn sessions_handler(
    headers: HeaderMap,
    Query(query): Query<SessionsQuery>,
    State(state): State<AppState>,
) -> Response {
    if !state.authorized(&headers, query.token.as_deref()) {
        warn!(event = "auth_rejected", route = "/sessions");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let root = query
        .root
        .filter(|root| !root.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| state.config.projects_root.clone());
    let limit = resolve_limit(
        query
            .limit
            .as_deref()
            .and_then(|raw| raw.trim().parse::<f64>().ok()),
    );
    match tokio::task::spawn_blocking(move || discover(&root, limit)).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => {
            error!(event = "discovery_failed", error = %err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
