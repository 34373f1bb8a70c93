//! In-process room simulation.
//!
//! Implements the room contract without any network transport. Each
//! connection is recorded by room name so callers can observe what a session
//! did (connect, publish, captured frames, disconnect) and play the far side
//! of the room: announce remote tracks, feed them frames, or drop the room.
//!
//! In echo mode, every room announces one remote track after publish that
//! replays the frames captured into it.

use crate::error::VoiceError;
use crate::room::{RemoteAudioTrack, RoomConnector, RoomEvent, RoomEvents, RoomHandle};
use crate::token::AccessGrant;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use umi_types::{AudioFormat, AudioFrame};

/// Buffered frames per simulated remote track.
const REMOTE_TRACK_CAPACITY: usize = 64;

const ECHO_TRACK_SID: &str = "TR_loopback_echo";

#[derive(Default)]
struct Shared {
    rooms: Mutex<HashMap<String, Arc<RoomProbe>>>,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    fail_capture: AtomicBool,
    connect_delay: Mutex<Duration>,
    echo: bool,
}

struct RoomProbe {
    name: String,
    identity: String,
    connected: AtomicBool,
    published: AtomicBool,
    captured: AtomicU64,
    disconnect_calls: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedSender<RoomEvent>>>,
}

impl RoomProbe {
    fn emit(&self, event: RoomEvent) -> bool {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        match events.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn close_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Simulated room service.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose rooms play captured audio back as a remote track.
    pub fn echo() -> Self {
        Self {
            shared: Arc::new(Shared {
                echo: true,
                ..Shared::default()
            }),
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_capture(&self, fail: bool) {
        self.shared.fail_capture.store(fail, Ordering::SeqCst);
    }

    /// Delays every subsequent connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self
            .shared
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Number of connect attempts made, including failed ones.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// The most recent connection to `name`, if one was ever opened.
    pub fn room(&self, name: &str) -> Option<LoopbackRoom> {
        self.shared
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .map(|probe| LoopbackRoom { probe })
    }

    /// Number of rooms currently connected.
    pub fn open_rooms(&self) -> usize {
        self.shared
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|probe| probe.connected.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl RoomConnector for LoopbackConnector {
    async fn connect(
        &self,
        url: &str,
        grant: &AccessGrant,
    ) -> Result<Box<dyn RoomHandle>, VoiceError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .shared
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(VoiceError::Connect(format!(
                "loopback room '{}' refused the connection",
                grant.room
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::new(RoomProbe {
            name: grant.room.clone(),
            identity: grant.identity.clone(),
            connected: AtomicBool::new(true),
            published: AtomicBool::new(false),
            captured: AtomicU64::new(0),
            disconnect_calls: AtomicUsize::new(0),
            events: Mutex::new(Some(tx)),
        });
        self.shared
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(grant.room.clone(), probe.clone());

        info!(
            room = %grant.room,
            identity = %grant.identity,
            url,
            "loopback room connected"
        );

        Ok(Box::new(LoopbackHandle {
            probe,
            shared: self.shared.clone(),
            events: Some(rx),
            echo_tx: None,
        }))
    }
}

struct LoopbackHandle {
    probe: Arc<RoomProbe>,
    shared: Arc<Shared>,
    events: Option<RoomEvents>,
    echo_tx: Option<mpsc::Sender<AudioFrame>>,
}

#[async_trait]
impl RoomHandle for LoopbackHandle {
    fn room_name(&self) -> &str {
        &self.probe.name
    }

    async fn publish(&mut self, format: AudioFormat) -> Result<(), VoiceError> {
        if !self.probe.connected.load(Ordering::SeqCst) {
            return Err(VoiceError::NotConnected);
        }
        if self.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(VoiceError::Publish(format!(
                "loopback room '{}' rejected the microphone track",
                self.probe.name
            )));
        }
        self.probe.published.store(true, Ordering::SeqCst);
        debug!(
            room = %self.probe.name,
            sample_rate = format.sample_rate,
            channels = format.channels,
            "loopback microphone track published"
        );

        if self.shared.echo {
            let (tx, rx) = mpsc::channel(REMOTE_TRACK_CAPACITY);
            self.echo_tx = Some(tx);
            self.probe.emit(RoomEvent::TrackSubscribed(RemoteAudioTrack {
                sid: ECHO_TRACK_SID.to_string(),
                participant: "loopback-echo".to_string(),
                frames: Box::pin(ReceiverStream::new(rx)),
            }));
        }
        Ok(())
    }

    async fn capture_frame(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        if !self.probe.connected.load(Ordering::SeqCst) {
            return Err(VoiceError::NotConnected);
        }
        if !self.probe.published.load(Ordering::SeqCst) {
            return Err(VoiceError::Capture("no published track".to_string()));
        }
        if self.shared.fail_capture.load(Ordering::SeqCst) {
            return Err(VoiceError::Capture("loopback capture failure".to_string()));
        }
        self.probe.captured.fetch_add(1, Ordering::SeqCst);
        if let Some(echo) = &self.echo_tx {
            // A full echo buffer drops the frame rather than stalling capture.
            let _ = echo.try_send(frame.clone());
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<RoomEvents> {
        self.events.take()
    }

    async fn disconnect(&mut self) {
        self.probe.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.echo_tx = None;
        if self.probe.connected.swap(false, Ordering::SeqCst) {
            self.probe.close_events();
            info!(room = %self.probe.name, "loopback room disconnected");
        }
    }
}

impl Drop for LoopbackHandle {
    // A dropped handle tears down its transport, like a real room would.
    fn drop(&mut self) {
        if self.probe.connected.swap(false, Ordering::SeqCst) {
            self.probe.close_events();
            debug!(room = %self.probe.name, "loopback handle dropped while connected");
        }
    }
}

/// Observer and far-side controller for one simulated room connection.
#[derive(Clone)]
pub struct LoopbackRoom {
    probe: Arc<RoomProbe>,
}

impl LoopbackRoom {
    pub fn name(&self) -> &str {
        &self.probe.name
    }

    /// Participant identity the room was joined with.
    pub fn identity(&self) -> &str {
        &self.probe.identity
    }

    pub fn is_connected(&self) -> bool {
        self.probe.connected.load(Ordering::SeqCst)
    }

    pub fn is_published(&self) -> bool {
        self.probe.published.load(Ordering::SeqCst)
    }

    pub fn captured_frames(&self) -> u64 {
        self.probe.captured.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.probe.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Announces a remote audio track. Frames sent on the returned channel
    /// arrive on the track; dropping it ends the track. Returns `None` when
    /// the room is no longer connected.
    pub fn publish_remote_track(
        &self,
        sid: &str,
        participant: &str,
    ) -> Option<mpsc::Sender<AudioFrame>> {
        let (tx, rx) = mpsc::channel(REMOTE_TRACK_CAPACITY);
        let track = RemoteAudioTrack {
            sid: sid.to_string(),
            participant: participant.to_string(),
            frames: Box::pin(ReceiverStream::new(rx)),
        };
        self.probe
            .emit(RoomEvent::TrackSubscribed(track))
            .then_some(tx)
    }

    /// Like [`Self::publish_remote_track`], with the frames already queued.
    pub fn play_remote_frames(
        &self,
        sid: &str,
        participant: &str,
        frames: Vec<AudioFrame>,
    ) -> bool {
        let track = RemoteAudioTrack {
            sid: sid.to_string(),
            participant: participant.to_string(),
            frames: Box::pin(tokio_stream::iter(frames)),
        };
        self.probe.emit(RoomEvent::TrackSubscribed(track))
    }

    pub fn unpublish_remote_track(&self, sid: &str) -> bool {
        self.probe.emit(RoomEvent::TrackUnsubscribed {
            track_sid: sid.to_string(),
        })
    }

    /// Drops the connection from the server side.
    pub fn close_from_server(&self, reason: &str) {
        self.probe.emit(RoomEvent::Disconnected {
            reason: reason.to_string(),
        });
        self.probe.connected.store(false, Ordering::SeqCst);
        self.probe.close_events();
    }
}
