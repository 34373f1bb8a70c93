use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("LiveKit API error: {0}")]
    Token(#[from] livekit_api::access_token::AccessTokenError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Room connect failed: {0}")]
    Connect(String),

    #[error("Track publish failed: {0}")]
    Publish(String),

    #[error("Frame capture failed: {0}")]
    Capture(String),

    #[error("Room is not connected")]
    NotConnected,
}

impl VoiceError {
    /// Short machine-readable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Config(_) => "config",
            Self::Connect(_) => "connect",
            Self::Publish(_) => "publish",
            Self::Capture(_) => "capture",
            Self::NotConnected => "not_connected",
        }
    }
}
