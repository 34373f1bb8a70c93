use crate::config::LiveKitConfig;
use crate::error::VoiceError;
use livekit_api::access_token::{AccessToken, VideoGrants};
use std::fmt;
use std::time::{Duration, SystemTime};

/// A signed, time-bounded room join credential.
#[derive(Clone)]
pub struct AccessGrant {
    pub room: String,
    pub identity: String,
    pub token: String,
    pub expires_at: SystemTime,
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("room", &self.room)
            .field("identity", &self.identity)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Mints join grants signed with the configured API key pair.
///
/// Holds no mutable state, so one instance is shared by every session.
#[derive(Clone)]
pub struct CredentialIssuer {
    api_key: String,
    api_secret: String,
    ttl: Duration,
}

impl fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CredentialIssuer {
    pub fn new(config: &LiveKitConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            ttl: config.token_ttl(),
        }
    }

    /// Issues a grant for `identity` to join, publish, and subscribe in `room`.
    pub fn issue(&self, room: &str, identity: &str) -> Result<AccessGrant, VoiceError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(VoiceError::Config(
                "room service API key and secret must be set".to_string(),
            ));
        }
        if room.is_empty() || identity.is_empty() {
            return Err(VoiceError::Config(
                "room name and participant identity must be non-empty".to_string(),
            ));
        }

        let token = AccessToken::with_api_key(&self.api_key, &self.api_secret)
            .with_identity(identity)
            .with_name(identity)
            .with_grants(VideoGrants {
                room_join: true,
                room: room.to_string(),
                can_publish: true,
                can_subscribe: true,
                ..Default::default()
            })
            .with_ttl(self.ttl)
            .to_jwt()?;

        Ok(AccessGrant {
            room: room.to_string(),
            identity: identity.to_string(),
            token,
            expires_at: SystemTime::now() + self.ttl,
        })
    }
}
