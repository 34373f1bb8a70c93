//! The contract the bridge needs from a real-time media room client.
//!
//! Implementations: [`crate::loopback::LoopbackConnector`] (in-process) and,
//! with the `livekit` feature, `crate::livekit_room::LiveKitConnector`.

use crate::error::VoiceError;
use crate::token::AccessGrant;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use tokio::sync::mpsc;
use umi_types::{AudioFormat, AudioFrame};

/// Remote frames in arrival order. Ends when the track goes away.
pub type FrameStream = BoxStream<'static, AudioFrame>;

/// Subscription notifications for one room connection.
pub type RoomEvents = mpsc::UnboundedReceiver<RoomEvent>;

/// A remote participant's audio track that this connection subscribed to.
pub struct RemoteAudioTrack {
    pub sid: String,
    pub participant: String,
    pub frames: FrameStream,
}

impl fmt::Debug for RemoteAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAudioTrack")
            .field("sid", &self.sid)
            .field("participant", &self.participant)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum RoomEvent {
    TrackSubscribed(RemoteAudioTrack),
    TrackUnsubscribed { track_sid: String },
    /// The room connection was closed from the far side.
    Disconnected { reason: String },
}

/// Opens room connections.
#[async_trait]
pub trait RoomConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        grant: &AccessGrant,
    ) -> Result<Box<dyn RoomHandle>, VoiceError>;
}

/// One live room connection, owned exclusively by a device session.
#[async_trait]
pub trait RoomHandle: Send + Sync {
    fn room_name(&self) -> &str;

    /// Creates the local microphone source and publishes it as a track.
    async fn publish(&mut self, format: AudioFormat) -> Result<(), VoiceError>;

    /// Pushes one captured frame into the published track.
    async fn capture_frame(&self, frame: &AudioFrame) -> Result<(), VoiceError>;

    /// Hands out the subscription notification stream. Returns `None` after
    /// the first call.
    fn take_events(&mut self) -> Option<RoomEvents>;

    /// Leaves the room. Idempotent; safe to call at any point.
    async fn disconnect(&mut self);
}
