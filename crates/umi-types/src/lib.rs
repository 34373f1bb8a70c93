//! Shared wire and value types for the UMI bridge.
//!
//! This crate defines the control-message vocabulary exchanged with devices
//! over the WebSocket text channel, the PCM audio frame carried on the binary
//! channel, and the session lifecycle states. Both `umi-voice` and
//! `umi-bridge` depend on it; it depends on nothing else in the workspace.

pub mod audio;
pub mod message;

pub use audio::{AudioFormat, AudioFrame, PcmError};
pub use message::{BridgeMessage, DeviceMessage, ProtocolError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one device's conversational session.
///
/// The only legal cycle is `Idle -> Starting -> Active -> Ending -> Idle`,
/// with `Starting -> Idle` when the room cannot be joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session; no room connection exists.
    #[default]
    Idle,
    /// A `start_session` was accepted and the room is being joined.
    Starting,
    /// The local track is published; audio flows in both directions.
    Active,
    /// The room is being released.
    Ending,
}

impl SessionState {
    /// Returns the string label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Ending => "ending",
        }
    }

    /// Whether a session identifier and room handle exist in this state.
    pub fn holds_room(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
