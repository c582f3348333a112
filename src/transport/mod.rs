//! Broadcast transport abstraction
//!
//! The sync bridge only needs a topic-scoped, at-least-once, unordered
//! byte pipe. Real deployments plug in a data channel of a media room;
//! tests and the demo use [`simulated::SimBroadcastNetwork`].

pub mod simulated;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
}

/// A packet delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundPacket {
    pub topic: String,
    pub bytes: Vec<u8>,
    /// The transport looped our own packet back to us.
    pub sender_is_local: bool,
}

/// A broadcast data channel shared by every peer in a session.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Publish bytes on a topic. May fail if the connection is torn down.
    async fn send(&self, bytes: &[u8], topic: &str) -> Result<(), TransportError>;

    /// Subscribe to packets received on any topic.
    fn subscribe(&self) -> broadcast::Receiver<InboundPacket>;
}
