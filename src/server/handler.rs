// Axum front end: routes client requests to the relay orchestrator or a plugin.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::route::{parse_route, Route};
use crate::error::{GatewayError, GatewayResult};
use crate::plugin::{PluginRegistry, PluginRequest};
use crate::relay::{RelayOrchestrator, RelayRequest};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RelayOrchestrator>,
    pub plugins: Arc<PluginRegistry>,
}

pub struct GatewayServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl GatewayServer {
    /// Bind `bind` (use port 0 for a random port) and serve in the background.
    pub async fn start(bind: &str, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/stat", get(stat_handler))
            .route("/", get(relay_handler))
            .route("/{*path}", get(relay_handler))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
        });

        info!("gateway listening on {}", addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Loopback URL for `path` on this server.
    pub fn url_for(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// GET /stat: live counters and per-key client counts.
async fn stat_handler(State(state): State<AppState>) -> Response {
    let orchestrator = &state.orchestrator;
    let sessions: Vec<_> = orchestrator
        .registry()
        .snapshot()
        .into_iter()
        .map(|(key, clients)| json!({ "key": key, "clients": clients }))
        .collect();

    Json(json!({
        "fan_out": orchestrator.fan_out(),
        "stats": orchestrator.stats().snapshot(),
        "sessions": sessions,
    }))
    .into_response()
}

/// GET /{kind}/{key}/... and plugin paths.
async fn relay_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    debug!("{} GET {}", peer, uri);
    match dispatch(&state, peer, uri.path(), headers).await {
        Ok(response) => response,
        Err(e) => {
            if !e.is_disconnect() {
                warn!("{} {}: {}", peer, uri.path(), e);
            }
            e.into_response()
        }
    }
}

async fn dispatch(
    state: &AppState,
    peer: SocketAddr,
    path: &str,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    match parse_route(path, &state.plugins)? {
        Route::Plugin { token, segments } => {
            let plugin = state
                .plugins
                .get(&token)
                .ok_or_else(|| GatewayError::NotFound(token.clone()))?;
            plugin.handle(PluginRequest { segments, headers }).await
        }
        Route::Stream { kind, key, params } => {
            info!("{} requested {:?} {}", peer.ip(), kind, key);
            state
                .orchestrator
                .serve(RelayRequest {
                    kind,
                    key,
                    params,
                    headers,
                    peer: peer.ip().to_string(),
                })
                .await
        }
    }
}
