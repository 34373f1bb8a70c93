//! Control messages exchanged as WebSocket text frames.
//!
//! Every message is a JSON object tagged by `type`. The device-to-bridge and
//! bridge-to-device vocabularies are separate enums.

use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

/// Messages a device sends to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Sent once after connecting. `device_id` is stable across reconnects.
    DeviceInfo {
        #[serde(default)]
        device_id: Option<String>,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        channels: Option<u16>,
    },
    StartSession {
        session_id: String,
    },
    EndSession {
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Messages the bridge sends to a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Ready,
    SessionStarted {
        session_id: String,
    },
    SessionEnded {
        session_id: String,
        frames_sent: u64,
    },
    /// The room could not be joined; the session is back to idle.
    SessionFailed {
        session_id: String,
        reason: String,
    },
    AgentSpeakingStart,
    AgentSpeakingEnd,
    /// A control message was rejected. The connection stays open.
    Error {
        message: String,
    },
}

/// Why a text frame could not be interpreted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not valid JSON.
    #[error("malformed control message: {0}")]
    Malformed(serde_json::Error),

    /// Valid JSON, but an unknown `type` or missing fields.
    #[error("unsupported control message: {0}")]
    Unsupported(serde_json::Error),
}

impl DeviceMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| match e.classify() {
            Category::Data => ProtocolError::Unsupported(e),
            Category::Syntax | Category::Eof | Category::Io => ProtocolError::Malformed(e),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceInfo { .. } => "device_info",
            Self::StartSession { .. } => "start_session",
            Self::EndSession { .. } => "end_session",
        }
    }
}

impl BridgeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::SessionFailed { .. } => "session_failed",
            Self::AgentSpeakingStart => "agent_speaking_start",
            Self::AgentSpeakingEnd => "agent_speaking_end",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_device_info_with_format_fields() {
        let msg = DeviceMessage::parse(
            r#"{"type":"device_info","device_id":"umi-a1b2","sample_rate":16000,"channels":1}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            DeviceMessage::DeviceInfo {
                device_id: Some("umi-a1b2".into()),
                sample_rate: Some(16_000),
                channels: Some(1),
            }
        );
    }

    #[test]
    fn end_session_id_is_optional() {
        assert_eq!(
            DeviceMessage::parse(r#"{"type":"end_session"}"#).unwrap(),
            DeviceMessage::EndSession { session_id: None }
        );
        assert_eq!(
            DeviceMessage::parse(r#"{"type":"end_session","session_id":"s1"}"#).unwrap(),
            DeviceMessage::EndSession {
                session_id: Some("s1".into())
            }
        );
    }

    #[test]
    fn classifies_syntax_and_data_errors() {
        assert!(matches!(
            DeviceMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            DeviceMessage::parse(r#"{"type":"reboot"}"#),
            Err(ProtocolError::Unsupported(_))
        ));
        assert!(matches!(
            DeviceMessage::parse(r#"{"type":"start_session"}"#),
            Err(ProtocolError::Unsupported(_))
        ));
    }

    #[test]
    fn bridge_messages_use_type_tag() {
        let ended = serde_json::to_value(BridgeMessage::SessionEnded {
            session_id: "abc".into(),
            frames_sent: 100,
        })
        .unwrap();
        assert_eq!(
            ended,
            json!({"type": "session_ended", "session_id": "abc", "frames_sent": 100})
        );

        let ready = BridgeMessage::Ready.to_json().unwrap();
        assert_eq!(ready, r#"{"type":"ready"}"#);

        let speaking = serde_json::to_value(BridgeMessage::AgentSpeakingEnd).unwrap();
        assert_eq!(speaking["type"], "agent_speaking_end");
    }
}
