//! Device WebSocket handler and per-connection receive loop.

use crate::config::ServerConfig;
use crate::link::DeviceLink;
use crate::session::DeviceSession;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitStream;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use umi_types::{BridgeMessage, DeviceMessage};

/// How long the writer gets to flush queued messages after the loop exits.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Normal closure.
const CLOSE_NORMAL: u16 = 1000;
/// Going away; the bridge is shutting down.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Policy violation; used when a newer connection claims the device.
const CLOSE_POLICY: u16 = 1008;
/// Internal error.
const CLOSE_INTERNAL: u16 = 1011;

/// Why a receive loop stopped.
#[derive(Debug)]
enum ExitReason {
    PeerClosed,
    StreamEnded,
    SocketError(String),
    WriterClosed,
    Evicted,
    KeepaliveTimeout,
    Shutdown,
    Panicked,
}

impl ExitReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::StreamEnded => "stream_ended",
            Self::SocketError(_) => "socket_error",
            Self::WriterClosed => "writer_closed",
            Self::Evicted => "evicted",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::Shutdown => "shutdown",
            Self::Panicked => "panicked",
        }
    }

    /// Close frame the bridge sends itself, if the socket is still usable.
    fn close_frame(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::Evicted => Some((CLOSE_POLICY, "replaced by a newer connection")),
            Self::KeepaliveTimeout => Some((CLOSE_NORMAL, "keepalive timeout")),
            Self::Shutdown => Some((CLOSE_GOING_AWAY, "bridge shutting down")),
            Self::Panicked => Some((CLOSE_INTERNAL, "internal error")),
            Self::PeerClosed | Self::StreamEnded | Self::SocketError(_) | Self::WriterClosed => {
                None
            }
        }
    }
}

/// Upgrades a device connection to WebSocket.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_size = state.config.server.max_message_size;
    debug!(remote_addr = %addr, "device websocket upgrade");
    let connections = state.connections.clone();
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| {
            connections.track_future(handle_device(socket, state, Some(addr)))
        })
}

/// Runs one device connection to completion.
///
/// Whatever ends the receive loop (peer close, socket error, eviction,
/// keepalive timeout, shutdown, or a panic), the same cleanup runs once
/// afterwards: the session is ended, the registry entry removed, and the
/// socket closed.
pub async fn handle_device(
    socket: WebSocket,
    state: Arc<AppState>,
    remote_addr: Option<SocketAddr>,
) {
    let registration = state.registry.register(remote_addr);
    let connection_id = registration.connection_id();
    let evicted = registration.evict_signal();
    info!(%connection_id, remote_addr = ?remote_addr, "device connected");

    let (mut sender, receiver) = socket.split();

    // Bounded so a slow device applies back-pressure to playback instead of
    // growing memory.
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.server.outbound_queue_capacity);

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let link = DeviceLink::new(connection_id, tx);
    let mut session = DeviceSession::new(registration, link.clone(), state.clone());

    let exit = AssertUnwindSafe(receive_loop(
        &mut session,
        receiver,
        &state.config.server,
        evicted,
        state.shutdown.clone(),
    ))
    .catch_unwind()
    .await;
    let reason = exit.unwrap_or_else(|_| {
        error!(%connection_id, "device receive loop panicked");
        ExitReason::Panicked
    });

    let frames_sent = session.end().await;
    let device_id = session.device_id().map(str::to_string);
    drop(session);

    if let Some((code, text)) = reason.close_frame() {
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, link.close(code, text)).await;
    }
    drop(link);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(%connection_id, "device writer did not drain in time; aborting");
        writer.abort();
    }

    match &reason {
        ExitReason::SocketError(e) => info!(
            %connection_id,
            device_id = ?device_id,
            reason = reason.as_str(),
            ended_frames_sent = ?frames_sent,
            "device disconnected: {}",
            e
        ),
        _ => info!(
            %connection_id,
            device_id = ?device_id,
            reason = reason.as_str(),
            ended_frames_sent = ?frames_sent,
            "device disconnected"
        ),
    }
}

async fn receive_loop(
    session: &mut DeviceSession,
    mut receiver: SplitStream<WebSocket>,
    server: &ServerConfig,
    evicted: Arc<Notify>,
    shutdown: CancellationToken,
) -> ExitReason {
    let connection_id = session.connection_id();
    let interval = server.keepalive_interval();
    let idle_limit = interval + server.keepalive_timeout();
    let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Binary(bytes))) => session.ingest(&bytes).await,
                    Some(Ok(Message::Text(text))) => dispatch_text(session, text.as_str()).await,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(%connection_id, frame = ?frame, "device sent close");
                        return ExitReason::PeerClosed;
                    }
                    Some(Err(e)) => return ExitReason::SocketError(e.to_string()),
                    None => return ExitReason::StreamEnded,
                }
            }
            reason = session.room_closed() => {
                warn!(
                    %connection_id,
                    session_id = ?session.session_id(),
                    reason = %reason,
                    "room closed by the server; ending session"
                );
                session.end().await;
            }
            _ = evicted.notified() => {
                info!(
                    %connection_id,
                    "connection evicted by a newer connection for the same device"
                );
                return ExitReason::Evicted;
            }
            _ = shutdown.cancelled() => {
                info!(
                    %connection_id,
                    session_id = ?session.session_id(),
                    "bridge shutting down; closing device"
                );
                return ExitReason::Shutdown;
            }
            _ = keepalive.tick() => {
                if last_seen.elapsed() > idle_limit {
                    warn!(
                        %connection_id,
                        idle_secs = last_seen.elapsed().as_secs(),
                        "device keepalive timed out"
                    );
                    return ExitReason::KeepaliveTimeout;
                }
                if session.link().ping().is_err() {
                    return ExitReason::WriterClosed;
                }
            }
        }
    }
}

async fn dispatch_text(session: &mut DeviceSession, text: &str) {
    let connection_id = session.connection_id();
    let message = match DeviceMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(%connection_id, len = text.len(), "ignoring control message: {}", e);
            session
                .notify(BridgeMessage::Error {
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };
    debug!(%connection_id, kind = message.kind(), "control message");

    match message {
        DeviceMessage::DeviceInfo {
            device_id,
            sample_rate,
            channels,
        } => session.identify(device_id, sample_rate, channels).await,
        DeviceMessage::StartSession { session_id } => {
            // Failures are already logged and reported to the device.
            let _ = session.start(&session_id).await;
        }
        DeviceMessage::EndSession { session_id } => {
            session.end_requested(session_id.as_deref()).await;
        }
    }
}
