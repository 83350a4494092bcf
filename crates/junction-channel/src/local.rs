//! In-process duplex channel.
//!
//! [`LocalChannel`] implements [`DuplexInputChannel`] over tokio mpsc queues,
//! with no wire underneath. Peers are created with [`LocalChannel::connect`]
//! and talk to the channel through the returned [`LocalPeer`] handle. This is
//! the channel used for embedding the bus in one process and for end-to-end
//! tests; socket transports implement the same trait elsewhere.

use crate::traits::{ChannelError, ChannelEvent, ConnectionId, DuplexInputChannel};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Inner {
    channel_id: String,
    listening: AtomicBool,
    /// Connected peers and the sender feeding each peer's receive side.
    peers: DashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl Inner {
    fn emit(&self, event: ChannelEvent) {
        // The consumer may have gone away during shutdown; that is fine.
        let _ = self.events.send(event);
    }

    fn peer_closed(&self, peer: &ConnectionId) {
        if self.peers.remove(peer).is_some() {
            debug!(channel = %self.channel_id, peer = %peer, "Peer closed");
            self.emit(ChannelEvent::PeerDisconnected { peer: peer.clone() });
        }
    }
}

/// An in-process implementation of [`DuplexInputChannel`].
#[derive(Clone)]
pub struct LocalChannel {
    inner: Arc<Inner>,
}

impl LocalChannel {
    /// Create a new local channel with the given endpoint id.
    #[must_use]
    pub fn new(channel_id: impl Into<String>) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                channel_id: channel_id.into(),
                listening: AtomicBool::new(false),
                peers: DashMap::new(),
                events,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Connect a new peer to this channel.
    ///
    /// The channel assigns the peer its connection id and raises
    /// `PeerConnected` on the event stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not listening.
    pub fn connect(&self) -> Result<LocalPeer, ChannelError> {
        if !self.is_listening() {
            return Err(ChannelError::NotListening);
        }

        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.peers.insert(id.clone(), tx);

        debug!(channel = %self.inner.channel_id, peer = %id, "Peer connected");
        self.inner.emit(ChannelEvent::PeerConnected { peer: id.clone() });

        Ok(LocalPeer {
            id,
            inner: Arc::clone(&self.inner),
            rx,
            closed: false,
        })
    }

    /// Number of currently connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }
}

#[async_trait]
impl DuplexInputChannel for LocalChannel {
    fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    async fn start_listening(&self) -> Result<(), ChannelError> {
        self.inner.listening.store(true, Ordering::SeqCst);
        debug!(channel = %self.inner.channel_id, "Listening");
        Ok(())
    }

    async fn stop_listening(&self) {
        self.inner.listening.store(false, Ordering::SeqCst);
        // Dropping the senders ends every peer's receive stream.
        self.inner.peers.clear();
        debug!(channel = %self.inner.channel_id, "Stopped listening");
    }

    fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    async fn send_message(&self, peer: &ConnectionId, data: Bytes) -> Result<(), ChannelError> {
        let sender = self
            .inner
            .peers
            .get(peer)
            .ok_or_else(|| ChannelError::PeerNotConnected(peer.clone()))?;

        trace!(channel = %self.inner.channel_id, peer = %peer, bytes = data.len(), "Send");
        sender
            .send(data)
            .map_err(|_| ChannelError::SendFailed(format!("peer {} went away", peer)))
    }

    async fn disconnect_peer(&self, peer: &ConnectionId) -> Result<(), ChannelError> {
        match self.inner.peers.remove(peer) {
            Some(_) => {
                debug!(channel = %self.inner.channel_id, peer = %peer, "Peer disconnected by channel");
                self.inner
                    .emit(ChannelEvent::PeerDisconnected { peer: peer.clone() });
                Ok(())
            }
            None => Err(ChannelError::PeerNotConnected(peer.clone())),
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.inner.events_rx.lock().unwrap().take()
    }
}

/// A peer connected to a [`LocalChannel`].
///
/// Closing the handle (or dropping it) raises `PeerDisconnected` on the
/// channel, mirroring a transport noticing a dropped socket.
pub struct LocalPeer {
    id: ConnectionId,
    inner: Arc<Inner>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: bool,
}

impl LocalPeer {
    /// The transport-assigned connection id of this peer.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Send raw bytes to the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if this peer is no longer connected.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        if self.closed || !self.inner.peers.contains_key(&self.id) {
            return Err(ChannelError::Closed);
        }
        self.inner.emit(ChannelEvent::MessageReceived {
            peer: self.id.clone(),
            data: data.into(),
        });
        Ok(())
    }

    /// Receive the next message from the channel.
    ///
    /// Returns `None` once the channel has dropped this peer.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if no message is queued or the peer was dropped.
    pub fn try_recv(&mut self) -> Result<Bytes, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Close this peer's connection.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.peer_closed(&self.id);
        }
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listening_channel(id: &str) -> (LocalChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let channel = LocalChannel::new(id);
        channel.start_listening().await.unwrap();
        let events = channel.take_events().unwrap();
        (channel, events)
    }

    #[tokio::test]
    async fn test_connect_emits_event() {
        let (channel, mut events) = listening_channel("test").await;

        let peer = channel.connect().unwrap();
        match events.recv().await.unwrap() {
            ChannelEvent::PeerConnected { peer: id } => assert_eq!(&id, peer.id()),
            other => panic!("Expected PeerConnected, got {:?}", other),
        }
        assert_eq!(channel.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_requires_listening() {
        let channel = LocalChannel::new("test");
        assert!(matches!(channel.connect(), Err(ChannelError::NotListening)));
    }

    #[tokio::test]
    async fn test_message_received_event() {
        let (channel, mut events) = listening_channel("test").await;
        let peer = channel.connect().unwrap();
        let _ = events.recv().await; // PeerConnected

        peer.send(Bytes::from_static(b"hello")).unwrap();
        match events.recv().await.unwrap() {
            ChannelEvent::MessageReceived { peer: id, data } => {
                assert_eq!(&id, peer.id());
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("Expected MessageReceived, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_message_to_peer() {
        let (channel, _events) = listening_channel("test").await;
        let mut peer = channel.connect().unwrap();

        channel
            .send_message(peer.id(), Bytes::from_static(b"down"))
            .await
            .unwrap();
        assert_eq!(&peer.recv().await.unwrap()[..], b"down");
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (channel, _events) = listening_channel("test").await;
        let unknown = ConnectionId::new("nope");
        assert!(matches!(
            channel.send_message(&unknown, Bytes::new()).await,
            Err(ChannelError::PeerNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_peer() {
        let (channel, mut events) = listening_channel("test").await;
        let mut peer = channel.connect().unwrap();
        let _ = events.recv().await; // PeerConnected

        channel.disconnect_peer(peer.id()).await.unwrap();
        match events.recv().await.unwrap() {
            ChannelEvent::PeerDisconnected { peer: id } => assert_eq!(&id, peer.id()),
            other => panic!("Expected PeerDisconnected, got {:?}", other),
        }

        // The peer's receive stream ends.
        assert!(peer.recv().await.is_none());
        assert_eq!(channel.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_emits_disconnect() {
        let (channel, mut events) = listening_channel("test").await;
        let mut peer = channel.connect().unwrap();
        let _ = events.recv().await; // PeerConnected
        let id = peer.id().clone();

        peer.close();
        match events.recv().await.unwrap() {
            ChannelEvent::PeerDisconnected { peer } => assert_eq!(peer, id),
            other => panic!("Expected PeerDisconnected, got {:?}", other),
        }

        // Closing twice (close then drop) emits one event only.
        drop(peer);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_single_consumer() {
        let channel = LocalChannel::new("test");
        assert!(channel.take_events().is_some());
        assert!(channel.take_events().is_none());
    }
}
