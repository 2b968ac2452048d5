use serde::{Deserialize, Serialize};

use crate::models::{Annotation, Message, MessageId};

/// Events delivered by a transport over an open link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A message was published to a subscribed channel
    Message(Message),

    /// A message action (reaction, flag, delete) was applied
    Annotation {
        channel: String,
        message_id: MessageId,
        annotation: Annotation,
    },

    /// Link state change reported by the transport
    Status(LinkStatus),
}

impl TransportEvent {
    /// Channel the event is scoped to. Status events are link-wide.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Message(message) => Some(&message.channel),
            Self::Annotation { channel, .. } => Some(channel),
            Self::Status(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    Up,
    /// The link dropped; the session should reconnect.
    Down { reason: String },
}

/// Connection status as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}
