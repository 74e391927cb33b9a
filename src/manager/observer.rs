//! Observer notifications
//!
//! Observers are called on the consumer context only, from inside
//! `ConnectionManager` operations and `tick`. Every method has a no-op default
//! so an observer implements just what it cares about.

use crate::config::ConnectionSettings;
use crate::error::ManagerError;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives connection lifecycle and message notifications
pub trait ConnectionObserver: Send {
    /// A connect sequence was started
    fn connecting(&mut self, _settings: &ConnectionSettings) {}

    fn connection_succeeded(&mut self) {}

    fn connection_failed(&mut self, _error: &ManagerError) {}

    /// The connection was closed, cancelled or shut down on request
    fn disconnected(&mut self) {}

    /// The broker connection dropped without a disconnect request
    fn connection_lost(&mut self) {}

    fn message_decoded(&mut self, _topic: &str, _text: &str) {}
}

/// Owned form of an observer notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connecting { address: String, port: u16 },
    ConnectionSucceeded,
    ConnectionFailed(String),
    Disconnected,
    ConnectionLost,
    MessageDecoded { topic: String, text: String },
}

impl LinkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LinkEvent::Connecting { .. } => "connecting",
            LinkEvent::ConnectionSucceeded => "connection_succeeded",
            LinkEvent::ConnectionFailed(_) => "connection_failed",
            LinkEvent::Disconnected => "disconnected",
            LinkEvent::ConnectionLost => "connection_lost",
            LinkEvent::MessageDecoded { .. } => "message_decoded",
        }
    }
}

/// Observer that forwards every notification into a channel
///
/// Lets async code outside the consumer loop react to the link without being
/// called on the consumer context itself.
pub struct EventForwarder {
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl EventForwarder {
    pub fn new(sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { sender }
    }

    /// Create a forwarder together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    fn forward(&self, event: LinkEvent) {
        if self.sender.send(event).is_err() {
            debug!("Link event receiver dropped; discarding event");
        }
    }
}

impl ConnectionObserver for EventForwarder {
    fn connecting(&mut self, settings: &ConnectionSettings) {
        self.forward(LinkEvent::Connecting {
            address: settings.address.clone(),
            port: settings.port,
        });
    }

    fn connection_succeeded(&mut self) {
        self.forward(LinkEvent::ConnectionSucceeded);
    }

    fn connection_failed(&mut self, error: &ManagerError) {
        self.forward(LinkEvent::ConnectionFailed(error.to_string()));
    }

    fn disconnected(&mut self) {
        self.forward(LinkEvent::Disconnected);
    }

    fn connection_lost(&mut self) {
        self.forward(LinkEvent::ConnectionLost);
    }

    fn message_decoded(&mut self, topic: &str, text: &str) {
        self.forward(LinkEvent::MessageDecoded {
            topic: topic.to_string(),
            text: text.to_string(),
        });
    }
}
