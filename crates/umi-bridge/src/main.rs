//! UMI bridge binary.
//!
//! Starts the device WebSocket server with structured logging and graceful
//! shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use umi_bridge::{app, config, AppState};
use umi_voice::RoomConnector;

/// How long live device connections get to end their sessions on shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("UMI_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[cfg(feature = "livekit")]
fn room_connector(config: &config::Config) -> Arc<dyn RoomConnector> {
    tracing::info!(url = %config.livekit.url, "using LiveKit room transport");
    Arc::new(umi_voice::LiveKitConnector::new(config.audio.format()))
}

#[cfg(not(feature = "livekit"))]
fn room_connector(_config: &config::Config) -> Arc<dyn RoomConnector> {
    tracing::warn!(
        "built without the `livekit` feature; sessions use the in-process echo room"
    );
    Arc::new(umi_voice::LoopbackConnector::echo())
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the bridge cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        std::process::exit(1);
    }

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let connector = room_connector(&config);
    let state = AppState::new(config, connector);
    let app = app(state.clone());

    tracing::info!(%addr, "starting umi bridge");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = state.shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    })
    .await
    .expect("server error");

    // Upgraded device sockets outlive `serve`; end their sessions before the
    // runtime goes away.
    let live = state.connections.len();
    if !state.drain_connections(SHUTDOWN_DRAIN_TIMEOUT).await {
        tracing::warn!(
            remaining = state.connections.len(),
            "device connections did not finish before the shutdown deadline"
        );
    } else if live > 0 {
        tracing::info!(connections = live, "device connections closed");
    }

    tracing::info!("umi bridge shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
