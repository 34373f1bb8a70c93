//! Room-side integration for the UMI bridge.
//!
//! Issues signed room join grants and defines the narrow contract the bridge
//! needs from a real-time media room: connect, publish a microphone track,
//! capture frames into it, receive subscribed remote audio tracks, and
//! disconnect.
//!
//! Two implementations ship with the crate. The `livekit` cargo feature
//! enables [`LiveKitConnector`] over the LiveKit Rust SDK; the always
//! available [`LoopbackConnector`] simulates a room in-process.

pub mod config;
pub mod error;
#[cfg(feature = "livekit")]
pub mod livekit_room;
pub mod loopback;
pub mod room;
pub mod token;

pub use config::LiveKitConfig;
pub use error::VoiceError;
#[cfg(feature = "livekit")]
pub use livekit_room::LiveKitConnector;
pub use loopback::{LoopbackConnector, LoopbackRoom};
pub use room::{FrameStream, RemoteAudioTrack, RoomConnector, RoomEvent, RoomEvents, RoomHandle};
pub use token::{AccessGrant, CredentialIssuer};
