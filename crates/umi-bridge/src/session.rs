//! Per-device session state machine: `Idle → Starting → Active → Ending → Idle`.

use crate::link::{DeviceLink, LinkClosed};
use crate::registry::Registration;
use crate::relay::{IngestPath, Playback};
use crate::AppState;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use umi_types::{BridgeMessage, SessionState};
use umi_voice::{RoomHandle, VoiceError};
use uuid::Uuid;

/// Longest accepted `start_session.session_id`.
const MAX_SESSION_ID_LEN: usize = 128;

/// How long a control message may wait for space in the outbound queue.
/// A device that stops reading without closing its socket would otherwise
/// stall the session forever.
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a `start_session` did not produce an active session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already {state}")]
    AlreadyActive { state: SessionState },

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("could not issue room credentials: {0}")]
    Credential(#[source] VoiceError),

    #[error(transparent)]
    Connect(VoiceError),

    #[error(transparent)]
    Publish(VoiceError),

    #[error("room did not respond within {0:?}")]
    Timeout(Duration),
}

impl SessionError {
    /// Short label for log fields; room errors report their own kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyActive { .. } => "already_active",
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::Credential(e) | Self::Connect(e) | Self::Publish(e) => e.kind(),
            Self::Timeout(_) => "timeout",
        }
    }
}

struct ActiveSession {
    session_id: String,
    room: Box<dyn RoomHandle>,
    ingest: IngestPath,
    playback: Option<Playback>,
    room_closed: Option<oneshot::Receiver<String>>,
}

#[derive(Default)]
enum Phase {
    #[default]
    Idle,
    Starting {
        session_id: String,
    },
    Active(ActiveSession),
    Ending {
        session_id: String,
    },
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Starting { .. } => SessionState::Starting,
            Self::Active(_) => SessionState::Active,
            Self::Ending { .. } => SessionState::Ending,
        }
    }

    fn session_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Starting { session_id } | Self::Ending { session_id } => Some(session_id),
            Self::Active(active) => Some(&active.session_id),
        }
    }
}

/// The conversational session of one device connection.
///
/// Owned by the connection's receive loop. The room handle lives inside the
/// `Active` phase, so a room exists only while a session does.
pub struct DeviceSession {
    registration: Registration,
    link: DeviceLink,
    app: Arc<AppState>,
    device_id: Option<String>,
    phase: Phase,
}

impl DeviceSession {
    pub fn new(registration: Registration, link: DeviceLink, app: Arc<AppState>) -> Self {
        Self {
            registration,
            link,
            app,
            device_id: None,
            phase: Phase::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.phase.session_id()
    }

    /// Frames captured into the room during the current session.
    pub fn frames_sent(&self) -> u64 {
        match &self.phase {
            Phase::Active(active) => active.ingest.frames_sent(),
            _ => 0,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.registration.connection_id()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.registration.registry().update_session(
            self.connection_id(),
            self.phase.state(),
            self.phase.session_id(),
        );
    }

    /// Queues a control message for the device, giving up after
    /// [`CONTROL_SEND_TIMEOUT`].
    pub(crate) async fn notify(&self, message: BridgeMessage) {
        match tokio::time::timeout(CONTROL_SEND_TIMEOUT, self.link.send_control(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(LinkClosed)) => debug!(
                connection_id = %self.connection_id(),
                kind = message.kind(),
                "device link closed; dropping control message"
            ),
            Err(_) => warn!(
                connection_id = %self.connection_id(),
                kind = message.kind(),
                "device is not reading; dropping control message"
            ),
        }
    }

    fn participant_identity(&self) -> String {
        match &self.device_id {
            Some(device_id) => format!("device-{}", device_id),
            None => format!("device-{}", self.connection_id()),
        }
    }

    /// Handles `device_info`: claims the device id and replies `ready`.
    pub async fn identify(
        &mut self,
        device_id: Option<String>,
        sample_rate: Option<u32>,
        channels: Option<u16>,
    ) {
        let connection_id = self.connection_id();
        if let Some(device_id) = device_id.filter(|id| !id.trim().is_empty()) {
            if self.device_id.as_deref() != Some(device_id.as_str()) {
                let evicted = self
                    .registration
                    .registry()
                    .set_device_id(connection_id, &device_id);
                if evicted > 0 {
                    info!(
                        %connection_id,
                        device_id = %device_id,
                        evicted,
                        "device reconnected; evicting stale connections"
                    );
                }
                self.device_id = Some(device_id);
            }
        }

        let expected = self.app.config.audio.format();
        if sample_rate.is_some_and(|rate| rate != expected.sample_rate)
            || channels.is_some_and(|ch| ch != expected.channels)
        {
            warn!(
                %connection_id,
                device_sample_rate = ?sample_rate,
                device_channels = ?channels,
                sample_rate = expected.sample_rate,
                channels = expected.channels,
                "device advertised an audio format different from the configured one"
            );
        }

        info!(%connection_id, device_id = ?self.device_id, "device identified");
        self.notify(BridgeMessage::Ready).await;
    }

    /// Handles `start_session`. On success the device has been sent
    /// `session_started`; on failure the session is back to `Idle` and the
    /// device has been told why.
    pub async fn start(&mut self, session_id: &str) -> Result<(), SessionError> {
        let connection_id = self.connection_id();

        if !matches!(self.phase, Phase::Idle) {
            let err = SessionError::AlreadyActive {
                state: self.state(),
            };
            warn!(
                %connection_id,
                session_id,
                active = ?self.session_id(),
                "rejecting start_session: {}",
                err
            );
            self.notify(BridgeMessage::Error {
                message: err.to_string(),
            })
            .await;
            return Err(err);
        }

        if let Err(err) = validate_session_id(session_id) {
            warn!(%connection_id, "rejecting start_session: {}", err);
            self.notify(BridgeMessage::Error {
                message: err.to_string(),
            })
            .await;
            return Err(err);
        }

        self.set_phase(Phase::Starting {
            session_id: session_id.to_string(),
        });
        info!(%connection_id, session_id, device_id = ?self.device_id, "starting session");

        let mut room = match self.open_room(session_id).await {
            Ok(room) => room,
            Err(err) => {
                self.set_phase(Phase::Idle);
                warn!(
                    %connection_id,
                    session_id,
                    error_kind = err.kind(),
                    "session failed to start: {}",
                    err
                );
                self.notify(BridgeMessage::SessionFailed {
                    session_id: session_id.to_string(),
                    reason: err.to_string(),
                })
                .await;
                return Err(err);
            }
        };

        let events = room.take_events();
        let room_name = room.room_name().to_string();
        let ingest = IngestPath::new(
            self.app.config.audio.format(),
            self.app.config.audio.progress_interval_frames,
        );
        self.set_phase(Phase::Active(ActiveSession {
            session_id: session_id.to_string(),
            room,
            ingest,
            playback: None,
            room_closed: None,
        }));
        info!(%connection_id, session_id, room = %room_name, "session active");
        self.notify(BridgeMessage::SessionStarted {
            session_id: session_id.to_string(),
        })
        .await;

        // Spawned after `session_started` is queued so agent audio never
        // reaches the device ahead of it.
        if let (Some(events), Phase::Active(active)) = (events, &mut self.phase) {
            let (closed_tx, closed_rx) = oneshot::channel();
            active.playback = Some(Playback::spawn(
                events,
                self.link.clone(),
                closed_tx,
                session_id.to_string(),
            ));
            active.room_closed = Some(closed_rx);
        }
        Ok(())
    }

    async fn open_room(&self, session_id: &str) -> Result<Box<dyn RoomHandle>, SessionError> {
        let livekit = &self.app.config.livekit;
        let room_name = livekit.room_name(session_id);
        let identity = self.participant_identity();

        let grant = self
            .app
            .issuer
            .issue(&room_name, &identity)
            .map_err(SessionError::Credential)?;

        let limit = livekit.connect_timeout();
        let mut room = tokio::time::timeout(limit, self.app.connector.connect(&livekit.url, &grant))
            .await
            .map_err(|_| SessionError::Timeout(limit))?
            .map_err(SessionError::Connect)?;

        match tokio::time::timeout(limit, room.publish(self.app.config.audio.format())).await {
            Ok(Ok(())) => Ok(room),
            Ok(Err(e)) => {
                room.disconnect().await;
                Err(SessionError::Publish(e))
            }
            Err(_) => {
                room.disconnect().await;
                Err(SessionError::Timeout(limit))
            }
        }
    }

    /// Ends the active session. Returns the frames sent, or `None` when no
    /// session was active (no message is sent in that case).
    pub async fn end(&mut self) -> Option<u64> {
        let active = match std::mem::take(&mut self.phase) {
            Phase::Active(active) => active,
            other => {
                self.phase = other;
                return None;
            }
        };
        let connection_id = self.connection_id();
        let ActiveSession {
            session_id,
            mut room,
            ingest,
            playback,
            room_closed: _,
        } = active;

        self.set_phase(Phase::Ending {
            session_id: session_id.clone(),
        });

        if let Some(playback) = playback {
            playback
                .stop(self.app.config.audio.playback_drain_timeout())
                .await;
        }
        room.disconnect().await;
        drop(room);

        let frames_sent = ingest.frames_sent();
        self.notify(BridgeMessage::SessionEnded {
            session_id: session_id.clone(),
            frames_sent,
        })
        .await;
        self.set_phase(Phase::Idle);

        info!(
            %connection_id,
            session_id = %session_id,
            frames_sent,
            seconds = ingest.streamed().as_secs_f64(),
            "session ended"
        );
        Some(frames_sent)
    }

    /// Handles `end_session`. A request naming another session is stale and
    /// ignored.
    pub async fn end_requested(&mut self, session_id: Option<&str>) -> Option<u64> {
        if let (Some(requested), Some(current)) = (session_id, self.session_id()) {
            if requested != current {
                info!(
                    connection_id = %self.connection_id(),
                    requested,
                    current,
                    "ignoring end_session for a different session"
                );
                return None;
            }
        }
        self.end().await
    }

    /// Relays one binary device frame into the room. Frames arriving
    /// outside `Active` are dropped.
    pub async fn ingest(&mut self, bytes: &[u8]) {
        let connection_id = self.connection_id();
        let Phase::Active(active) = &mut self.phase else {
            trace!(%connection_id, len = bytes.len(), "dropping audio outside an active session");
            return;
        };
        if let Err(e) = active
            .ingest
            .forward(active.room.as_ref(), bytes, &active.session_id)
            .await
        {
            warn!(
                %connection_id,
                session_id = %active.session_id,
                len = bytes.len(),
                "skipping device frame: {}",
                e
            );
        }
    }

    /// Resolves with the reason once the active room is closed from the far
    /// side. Pending while no session is active.
    pub async fn room_closed(&mut self) -> String {
        let Phase::Active(active) = &mut self.phase else {
            return std::future::pending().await;
        };
        let Some(closed) = active.room_closed.as_mut() else {
            return std::future::pending().await;
        };
        let result = closed.await;
        active.room_closed = None;
        match result {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let Phase::Active(active) = std::mem::take(&mut self.phase) else {
            return;
        };
        warn!(
            connection_id = %self.connection_id(),
            session_id = %active.session_id,
            "device session dropped while active; tearing down room"
        );
        let ActiveSession {
            mut room, playback, ..
        } = active;
        drop(playback);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                room.disconnect().await;
            });
        }
    }
}

fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    if session_id.is_empty() {
        return Err(SessionError::InvalidSessionId(
            "session_id must not be empty".to_string(),
        ));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::InvalidSessionId(format!(
            "session_id longer than {} bytes",
            MAX_SESSION_ID_LEN
        )));
    }
    if session_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(SessionError::InvalidSessionId(
            "session_id must not contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}
