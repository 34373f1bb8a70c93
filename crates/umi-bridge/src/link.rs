//! Outbound half of a device connection.
//!
//! All writers (control replies, playback forwarders, keepalive) share one
//! bounded queue drained by the connection's writer task, so messages reach
//! the device in the order they were queued.

use axum::extract::ws::{CloseFrame, Message};
use thiserror::Error;
use tokio::sync::mpsc;
use umi_types::BridgeMessage;
use uuid::Uuid;

/// The writer task has exited; the device socket is gone.
#[derive(Debug, Clone, Copy, Error)]
#[error("device link closed")]
pub struct LinkClosed;

#[derive(Debug, Clone)]
pub struct DeviceLink {
    connection_id: Uuid,
    tx: mpsc::Sender<Message>,
}

impl DeviceLink {
    pub fn new(connection_id: Uuid, tx: mpsc::Sender<Message>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queues a control message, waiting for queue space.
    pub async fn send_control(&self, message: &BridgeMessage) -> Result<(), LinkClosed> {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(
                    connection_id = %self.connection_id,
                    kind = message.kind(),
                    "failed to serialize control message: {}",
                    e
                );
                return Ok(());
            }
        };
        self.tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| LinkClosed)
    }

    /// Queues a control message without waiting. Used where awaiting is not
    /// possible, such as `Drop`.
    pub fn try_send_control(&self, message: &BridgeMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.tx.try_send(Message::Text(json.into())).is_ok(),
            Err(_) => false,
        }
    }

    /// Queues one block of playback PCM, waiting for queue space.
    pub async fn send_audio(&self, pcm: Vec<u8>) -> Result<(), LinkClosed> {
        self.tx
            .send(Message::Binary(pcm.into()))
            .await
            .map_err(|_| LinkClosed)
    }

    /// Queues a keepalive ping. A full queue skips the ping; the queue
    /// being full already shows the writer is busy.
    pub fn ping(&self) -> Result<(), LinkClosed> {
        match self.tx.try_send(Message::Ping(Vec::new().into())) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkClosed),
        }
    }

    /// Queues a close frame.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), LinkClosed> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.tx
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|_| LinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
