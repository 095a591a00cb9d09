//! Fire-and-forget notifications for the admin dashboard
//!
//! Every state-changing relay operation emits one [`Notification`].
//! The dashboard is a pure consumer on the receiving end of an
//! unbounded channel; emission never blocks, never fails the relay
//! path, and is a no-op when nothing is attached.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::registry::ServerConfig;

/// State-change events consumed read-only by the dashboard.
///
/// Departures carry no cause on purpose: a timeout, an explicit leave,
/// a kick, and a dropped connection all look the same downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    PlayerJoined { id: u32, name: String },
    PlayerLeft { id: u32 },
    ChatRelayed {
        sender_id: u32,
        sender_name: String,
        text: String,
    },
    PlayerCount { count: usize },
    ConfigChanged { config: ServerConfig },
}

/// Outbound side of the dashboard channel.
///
/// Detached sinks swallow everything; attached sinks push into an
/// unbounded channel and ignore a consumer that has gone away. Either
/// way the relay behaves identically.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: Option<mpsc::UnboundedSender<Notification>>,
}

impl NotificationSink {
    /// Sink with no consumer; every emit is dropped.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Sink paired with a receiver for the dashboard task.
    pub fn attached() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Emits one notification. Never blocks; send failure (consumer
    /// dropped) is swallowed.
    pub fn emit(&self, notification: Notification) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(notification);
        }
    }
}
