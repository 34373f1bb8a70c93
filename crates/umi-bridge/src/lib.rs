//! UMI bridge library.
//!
//! Accepts device WebSocket connections, runs one conversational session per
//! device against a real-time media room, and relays audio both ways.

pub mod config;
pub mod connection;
pub mod link;
pub mod registry;
pub mod relay;
pub mod session;

use axum::{extract::Extension, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use umi_voice::{CredentialIssuer, RoomConnector};

pub use config::Config;
pub use registry::ConnectionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Validated bridge configuration.
    pub config: Arc<Config>,
    /// Every connected device, keyed by connection id.
    pub registry: ConnectionRegistry,
    /// Signs room join grants for starting sessions.
    pub issuer: Arc<CredentialIssuer>,
    /// Opens room connections.
    pub connector: Arc<dyn RoomConnector>,
    /// Cancelled when the bridge starts shutting down.
    pub shutdown: CancellationToken,
    /// Running device connection tasks.
    pub connections: TaskTracker,
}

impl AppState {
    pub fn new(config: Config, connector: Arc<dyn RoomConnector>) -> Self {
        let issuer = Arc::new(CredentialIssuer::new(&config.livekit));
        Self {
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            issuer,
            connector,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Tells every device connection to end its session and close, then
    /// waits up to `limit` for them to finish. Returns `false` if some were
    /// still running when the limit passed.
    pub async fn drain_connections(&self, limit: Duration) -> bool {
        self.shutdown.cancel();
        self.connections.close();
        tokio::time::timeout(limit, self.connections.wait())
            .await
            .is_ok()
    }
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.len(),
        "active_sessions": state.registry.active_sessions(),
    }))
}

/// Builds the application router.
///
/// Devices connect on either `/` or `/ws`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(connection::ws_handler))
        .route("/ws", get(connection::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
