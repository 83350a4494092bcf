//! Channel abstraction traits for the Junction bus.
//!
//! These traits define the interface the bus requires from a physical
//! channel, allowing it to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Counter mixed into generated ids so two ids created in the same
/// nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connected peer.
///
/// Assigned by the transport when the peer opens its connection; the bus
/// trusts it as the peer's authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is not listening.
    #[error("Channel is not listening")]
    NotListening,

    /// No peer with the given id is connected.
    #[error("Peer not connected: {0}")]
    PeerNotConnected(ConnectionId),

    /// Failed to send data to a peer.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The channel was closed.
    #[error("Channel closed")]
    Closed,

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other transport-specific error.
    #[error("{0}")]
    Other(String),
}

/// An event produced by a listening channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A new peer opened a connection.
    PeerConnected {
        /// The peer's transport-assigned identity.
        peer: ConnectionId,
    },
    /// A peer's connection dropped.
    PeerDisconnected {
        /// The peer's transport-assigned identity.
        peer: ConnectionId,
    },
    /// A peer sent a message.
    MessageReceived {
        /// The sending peer's transport-assigned identity.
        peer: ConnectionId,
        /// Raw message bytes.
        data: Bytes,
    },
}

impl ChannelEvent {
    /// The peer this event concerns.
    #[must_use]
    pub fn peer(&self) -> &ConnectionId {
        match self {
            ChannelEvent::PeerConnected { peer }
            | ChannelEvent::PeerDisconnected { peer }
            | ChannelEvent::MessageReceived { peer, .. } => peer,
        }
    }
}

/// A duplex channel many peers connect to.
///
/// One side of the bus: the channel accepts peer connections, surfaces their
/// lifecycle and traffic as [`ChannelEvent`]s, and lets the consumer push
/// bytes back to individual peers or drop them.
#[async_trait]
pub trait DuplexInputChannel: Send + Sync {
    /// The channel's own endpoint identifier (for logging and diagnostics).
    fn channel_id(&self) -> &str;

    /// Start accepting peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport cannot start.
    async fn start_listening(&self) -> Result<(), ChannelError>;

    /// Stop accepting peers and drop all current connections.
    async fn stop_listening(&self);

    /// Whether the channel is currently listening.
    fn is_listening(&self) -> bool;

    /// Send raw bytes to one connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown or the send fails.
    async fn send_message(&self, peer: &ConnectionId, data: Bytes) -> Result<(), ChannelError>;

    /// Forcibly drop one peer's connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown.
    async fn disconnect_peer(&self, peer: &ConnectionId) -> Result<(), ChannelError>;

    /// Take the event stream.
    ///
    /// The stream is single-consumer: the first call returns the receiver,
    /// subsequent calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
}
