//! Audio relay between a device and its room.
//!
//! Ingest (device to room) runs inline on the connection's receive loop.
//! Playback (room to device) runs as a supervisor task per session that
//! spawns one forwarding task per subscribed remote audio track.

use crate::link::DeviceLink;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use umi_types::{AudioFormat, AudioFrame, BridgeMessage, PcmError};
use umi_voice::{RemoteAudioTrack, RoomEvent, RoomEvents, RoomHandle, VoiceError};

/// A single frame that could not be relayed. Never fatal to the session.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to decode device audio: {0}")]
    Decode(#[from] PcmError),

    #[error("failed to capture device audio: {0}")]
    Capture(#[from] VoiceError),
}

/// Device-to-room path for one session.
#[derive(Debug)]
pub struct IngestPath {
    format: AudioFormat,
    progress_interval: u64,
    frames_sent: u64,
    streamed: Duration,
}

impl IngestPath {
    pub fn new(format: AudioFormat, progress_interval: u64) -> Self {
        Self {
            format,
            progress_interval: progress_interval.max(1),
            frames_sent: 0,
            streamed: Duration::ZERO,
        }
    }

    /// Frames the room accepted.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn streamed(&self) -> Duration {
        self.streamed
    }

    /// Decodes one binary device message and captures it into the room.
    pub async fn forward(
        &mut self,
        room: &dyn RoomHandle,
        bytes: &[u8],
        session_id: &str,
    ) -> Result<(), IngestError> {
        let frame = AudioFrame::from_le_bytes(bytes, self.format)?;
        room.capture_frame(&frame).await?;

        self.frames_sent += 1;
        self.streamed += frame.duration();
        if self.frames_sent % self.progress_interval == 0 {
            info!(
                session_id,
                room = room.room_name(),
                frames_sent = self.frames_sent,
                seconds = self.streamed.as_secs_f64(),
                "streaming device audio"
            );
        }
        Ok(())
    }
}

/// Owns `agent_speaking_start`/`agent_speaking_end` for one forwarder.
///
/// `finish` sends the end notice on the normal exit path; `Drop` covers
/// abort and panic with a non-blocking send.
struct SpeakingGuard {
    link: DeviceLink,
    speaking: bool,
}

impl SpeakingGuard {
    fn new(link: DeviceLink) -> Self {
        Self {
            link,
            speaking: false,
        }
    }

    async fn begin(&mut self) -> Result<(), crate::link::LinkClosed> {
        if !self.speaking {
            self.link
                .send_control(&BridgeMessage::AgentSpeakingStart)
                .await?;
            self.speaking = true;
        }
        Ok(())
    }

    async fn finish(mut self) {
        if self.speaking {
            self.speaking = false;
            let _ = self
                .link
                .send_control(&BridgeMessage::AgentSpeakingEnd)
                .await;
        }
    }
}

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        if self.speaking {
            self.link.try_send_control(&BridgeMessage::AgentSpeakingEnd);
        }
    }
}

/// Forwards one remote track to the device until the track ends, the
/// device link closes, or `stop` resolves. Returns the track sid.
async fn forward_track(
    track: RemoteAudioTrack,
    link: DeviceLink,
    mut stop: oneshot::Receiver<()>,
    session_id: String,
) -> String {
    let RemoteAudioTrack {
        sid,
        participant,
        mut frames,
    } = track;
    info!(
        session_id = %session_id,
        track_sid = %sid,
        participant = %participant,
        "forwarding agent audio"
    );

    let mut speaking = SpeakingGuard::new(link.clone());
    let mut forwarded: u64 = 0;

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = frames.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mono = frame.to_mono();
        if mono.samples.is_empty() {
            continue;
        }

        if speaking.begin().await.is_err() {
            debug!(
                session_id = %session_id,
                track_sid = %sid,
                "device link closed before playback"
            );
            break;
        }

        let sent = tokio::select! {
            biased;
            _ = &mut stop => break,
            sent = link.send_audio(mono.to_le_bytes()) => sent,
        };
        if sent.is_err() {
            info!(session_id = %session_id, track_sid = %sid, "device link closed during playback");
            break;
        }
        forwarded += 1;
    }

    speaking.finish().await;
    info!(session_id = %session_id, track_sid = %sid, forwarded, "agent audio finished");
    sid
}

async fn supervise(
    mut events: RoomEvents,
    link: DeviceLink,
    mut shutdown: watch::Receiver<bool>,
    room_closed: oneshot::Sender<String>,
    session_id: String,
) {
    let mut tracks: JoinSet<String> = JoinSet::new();
    let mut stops: HashMap<String, oneshot::Sender<()>> = HashMap::new();
    let mut closed_reason = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(RoomEvent::TrackSubscribed(track)) => {
                    let (stop_tx, stop_rx) = oneshot::channel();
                    // A re-subscribed sid replaces (and stops) the old forwarder.
                    stops.insert(track.sid.clone(), stop_tx);
                    tracks.spawn(forward_track(track, link.clone(), stop_rx, session_id.clone()));
                }
                Some(RoomEvent::TrackUnsubscribed { track_sid }) => {
                    debug!(
                        session_id = %session_id,
                        track_sid = %track_sid,
                        "remote track unsubscribed"
                    );
                    stops.remove(&track_sid);
                }
                Some(RoomEvent::Disconnected { reason }) => {
                    closed_reason = Some(reason);
                    break;
                }
                None => {
                    closed_reason = Some("room event stream closed".to_string());
                    break;
                }
            },
            Some(joined) = tracks.join_next(), if !tracks.is_empty() => {
                reap(joined, &mut stops, &session_id);
            }
        }
    }

    // Dropping the stop senders resolves every forwarder's stop signal.
    stops.clear();
    while let Some(joined) = tracks.join_next().await {
        reap(joined, &mut stops, &session_id);
    }

    if let Some(reason) = closed_reason {
        let _ = room_closed.send(reason);
    }
}

fn reap(
    joined: Result<String, tokio::task::JoinError>,
    stops: &mut HashMap<String, oneshot::Sender<()>>,
    session_id: &str,
) {
    match joined {
        Ok(sid) => {
            // Only forget the sid if its stop sender belongs to a finished task.
            if stops.get(&sid).is_some_and(|tx| tx.is_closed()) {
                stops.remove(&sid);
            }
        }
        Err(e) if e.is_panic() => {
            warn!(session_id, "playback forwarder panicked: {}", e);
        }
        Err(_) => {}
    }
}

/// Room-to-device path for one session.
pub struct Playback {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Playback {
    /// Starts consuming `events`. `room_closed` fires if the room goes away
    /// from the far side.
    pub fn spawn(
        events: RoomEvents,
        link: DeviceLink,
        room_closed: oneshot::Sender<String>,
        session_id: String,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(events, link, shutdown_rx, room_closed, session_id));
        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Stops all forwarders and waits for them, aborting after `drain`.
    pub async fn stop(mut self, drain: Duration) {
        let _ = self.shutdown.send(true);
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(drain, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => warn!("playback supervisor panicked: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    drain_ms = drain.as_millis() as u64,
                    "playback did not drain in time; aborting"
                );
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        // Aborting the supervisor drops its JoinSet, which aborts every forwarder.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
