//! Session event delivery.
//!
//! A broker session pushes every inbound publish and its own connection
//! loss into a [`SessionHandler`] bound to that session when it was
//! opened. Handlers run on the session's I/O task, so they must not block.

use rumqttc::Publish;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
        }
    }

    /// Payload rendered for logs (lossy UTF-8).
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Callbacks bound to a single broker session.
pub trait SessionHandler: Send + Sync {
    /// A message arrived. Returns `true` when it was accepted, in which
    /// case the session acknowledges it to the broker.
    fn on_message(&self, message: InboundMessage) -> bool;

    /// The session's connection dropped. Called at most once.
    fn on_connection_lost(&self, reason: String);
}
