//! Room contract over the LiveKit Rust SDK.

use crate::error::VoiceError;
use crate::room::{RemoteAudioTrack, RoomConnector, RoomEvent, RoomEvents, RoomHandle};
use crate::token::AccessGrant;
use async_trait::async_trait;
use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::{
    LocalAudioTrack, LocalTrack, RemoteTrack, Room, RoomEvent as LiveKitEvent, RoomOptions,
    TrackSource,
};
use livekit::webrtc::audio_frame::AudioFrame as RtcAudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use std::borrow::Cow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use umi_types::{AudioFormat, AudioFrame};

/// Audio buffered inside the native source before capture applies back-pressure.
const SOURCE_QUEUE_MS: u32 = 1000;

/// Connects to LiveKit rooms. Remote tracks are delivered in `playback`
/// format; the room's media stack resamples as needed.
#[derive(Debug, Clone)]
pub struct LiveKitConnector {
    playback: AudioFormat,
}

impl LiveKitConnector {
    pub fn new(playback: AudioFormat) -> Self {
        Self { playback }
    }
}

#[async_trait]
impl RoomConnector for LiveKitConnector {
    async fn connect(
        &self,
        url: &str,
        grant: &AccessGrant,
    ) -> Result<Box<dyn RoomHandle>, VoiceError> {
        let (room, mut lk_events) = Room::connect(url, &grant.token, RoomOptions::default())
            .await
            .map_err(|e| VoiceError::Connect(e.to_string()))?;

        info!(room = %grant.room, identity = %grant.identity, "connected to LiveKit room");

        let (tx, rx) = mpsc::unbounded_channel();
        let playback = self.playback;
        let room_name = grant.room.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = lk_events.recv().await {
                let mapped = match event {
                    LiveKitEvent::TrackSubscribed {
                        track: RemoteTrack::Audio(track),
                        publication,
                        participant,
                    } => {
                        let stream = NativeAudioStream::new(
                            track.rtc_track(),
                            playback.sample_rate as i32,
                            i32::from(playback.channels),
                        );
                        let frames = stream.map(|frame| AudioFrame {
                            sample_rate: frame.sample_rate,
                            channels: frame.num_channels as u16,
                            samples: frame.data.into_owned(),
                        });
                        RoomEvent::TrackSubscribed(RemoteAudioTrack {
                            sid: publication.sid().to_string(),
                            participant: participant.identity().to_string(),
                            frames: Box::pin(frames),
                        })
                    }
                    LiveKitEvent::TrackUnsubscribed { publication, .. } => {
                        RoomEvent::TrackUnsubscribed {
                            track_sid: publication.sid().to_string(),
                        }
                    }
                    LiveKitEvent::Disconnected { reason } => RoomEvent::Disconnected {
                        reason: format!("{:?}", reason),
                    },
                    _ => continue,
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
            debug!(room = %room_name, "LiveKit event pump finished");
        });

        Ok(Box::new(LiveKitHandle {
            room: Some(room),
            room_name: grant.room.clone(),
            source: None,
            events: Some(rx),
            pump: Some(pump),
        }))
    }
}

struct LiveKitHandle {
    room: Option<Room>,
    room_name: String,
    source: Option<NativeAudioSource>,
    events: Option<RoomEvents>,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl RoomHandle for LiveKitHandle {
    fn room_name(&self) -> &str {
        &self.room_name
    }

    async fn publish(&mut self, format: AudioFormat) -> Result<(), VoiceError> {
        let room = self.room.as_ref().ok_or(VoiceError::NotConnected)?;

        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            format.sample_rate,
            u32::from(format.channels),
            SOURCE_QUEUE_MS,
        );
        let track = LocalAudioTrack::create_audio_track(
            "microphone",
            RtcAudioSource::Native(source.clone()),
        );
        room.local_participant()
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: TrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| VoiceError::Publish(e.to_string()))?;

        info!(room = %self.room_name, "published microphone track");
        self.source = Some(source);
        Ok(())
    }

    async fn capture_frame(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        let source = self.source.as_ref().ok_or(VoiceError::NotConnected)?;
        let rtc_frame = RtcAudioFrame {
            data: Cow::Borrowed(frame.samples.as_slice()),
            sample_rate: frame.sample_rate,
            num_channels: u32::from(frame.channels),
            samples_per_channel: frame.samples_per_channel() as u32,
        };
        source
            .capture_frame(&rtc_frame)
            .await
            .map_err(|e| VoiceError::Capture(e.to_string()))
    }

    fn take_events(&mut self) -> Option<RoomEvents> {
        self.events.take()
    }

    async fn disconnect(&mut self) {
        self.source = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(room) = self.room.take() {
            if let Err(e) = room.close().await {
                warn!(room = %self.room_name, "error closing LiveKit room: {}", e);
            } else {
                info!(room = %self.room_name, "disconnected from LiveKit room");
            }
        }
    }
}
