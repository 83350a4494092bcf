//! The two channel connectors.
//!
//! Each connector is an event loop over one physical channel's
//! [`ChannelEvent`] stream, translating low-level connect/disconnect/message
//! events into bus operations. The service side owns the channel registered
//! services connect to; the client side owns the channel clients connect to.
//!
//! Decode policy: any malformed envelope, and any envelope kind that is not
//! valid on the receiving channel, is a protocol violation — the sending
//! peer is unregistered. Nothing is silently skipped.

use crate::bus::Core;
use bytes::Bytes;
use junction_channel::{ChannelEvent, ConnectionId};
use junction_protocol::{Envelope, EnvelopeKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Event loop for the service-side channel.
pub(crate) async fn run_service_side(
    core: Arc<Core>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::PeerConnected { peer } => {
                trace!(peer = %peer, "Service peer connected");
            }
            ChannelEvent::PeerDisconnected { peer } => {
                debug!(peer = %peer, "Service peer dropped");
                core.unregister_service(&peer).await;
            }
            ChannelEvent::MessageReceived { peer, data } => match core.codec().decode(&data) {
                Ok(envelope) => handle_service_message(&core, peer, data, envelope).await,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Malformed envelope from service peer");
                    core.unregister_service(&peer).await;
                }
            },
        }
    }
    debug!("Service-side connector stopped");
}

async fn handle_service_message(
    core: &Arc<Core>,
    peer: ConnectionId,
    raw: Bytes,
    envelope: Envelope,
) {
    match envelope.kind {
        EnvelopeKind::RegisterService => {
            core.register_service(envelope.id, peer).await;
        }
        EnvelopeKind::SendResponse => {
            // The raw bytes are reused unchanged: the payload the client
            // receives is byte-identical to what the service sent.
            let client = ConnectionId::from(envelope.id);
            core.forward_to_client(&client, &peer, raw, envelope.payload)
                .await;
        }
        EnvelopeKind::ConfirmClient => {
            let client = ConnectionId::from(envelope.id);
            core.forward_to_client(&client, &peer, raw, None).await;
        }
        EnvelopeKind::DisconnectClient => {
            core.unregister_client(&ConnectionId::from(envelope.id), false, true)
                .await;
        }
        kind => {
            warn!(peer = %peer, kind = ?kind, "Invalid envelope kind on service channel");
            core.unregister_service(&peer).await;
        }
    }
}

/// Event loop for the client-side channel.
pub(crate) async fn run_client_side(
    core: Arc<Core>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::PeerConnected { peer } => {
                trace!(peer = %peer, "Client peer connected");
            }
            ChannelEvent::PeerDisconnected { peer } => {
                debug!(peer = %peer, "Client peer dropped");
                core.unregister_client(&peer, true, false).await;
            }
            ChannelEvent::MessageReceived { peer, data } => match core.codec().decode(&data) {
                Ok(envelope) => handle_client_message(&core, peer, envelope).await,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Malformed envelope from client peer");
                    core.unregister_client(&peer, true, true).await;
                }
            },
        }
    }
    debug!("Client-side connector stopped");
}

async fn handle_client_message(core: &Arc<Core>, peer: ConnectionId, envelope: Envelope) {
    match envelope.kind {
        EnvelopeKind::ConnectClient => {
            // envelope.id is the desired service id here.
            core.register_client(peer, envelope.id).await;
        }
        EnvelopeKind::SendRequest => {
            // Identity substitution: the transport-verified peer id replaces
            // whatever the client wrote into the envelope, so a client can
            // never claim another client's identity.
            let mut envelope = envelope;
            envelope.id = peer.as_str().to_string();
            core.forward_to_service(&peer, envelope).await;
        }
        kind => {
            warn!(peer = %peer, kind = ?kind, "Invalid envelope kind on client channel");
            core.unregister_client(&peer, true, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{BusEvent, MessageBus};
    use junction_channel::{DuplexInputChannel, LocalChannel, LocalPeer};
    use junction_protocol::{codec, Envelope, EnvelopeKind};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct TestBus {
        bus: MessageBus,
        service_channel: LocalChannel,
        client_channel: LocalChannel,
        events: broadcast::Receiver<BusEvent>,
    }

    async fn start_bus() -> TestBus {
        let bus = MessageBus::new();
        let service_channel = LocalChannel::new("bus-services");
        let client_channel = LocalChannel::new("bus-clients");
        let events = bus.subscribe();
        bus.attach(
            Arc::new(service_channel.clone()),
            Arc::new(client_channel.clone()),
        )
        .await
        .unwrap();
        TestBus {
            bus,
            service_channel,
            client_channel,
            events,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<BusEvent>) -> BusEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for bus event")
            .expect("event stream closed")
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<BusEvent>,
        pred: impl Fn(&BusEvent) -> bool,
    ) -> BusEvent {
        loop {
            let event = next_event(events).await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn recv_raw(peer: &mut LocalPeer) -> bytes::Bytes {
        timeout(Duration::from_secs(5), peer.recv())
            .await
            .expect("timed out waiting for peer message")
            .expect("peer was disconnected")
    }

    async fn recv_envelope(peer: &mut LocalPeer) -> Envelope {
        codec::decode(&recv_raw(peer).await).unwrap()
    }

    async fn recv_none(peer: &mut LocalPeer) {
        let got = timeout(Duration::from_secs(5), peer.recv())
            .await
            .expect("timed out waiting for peer drop");
        assert!(got.is_none(), "expected peer to be disconnected");
    }

    /// Register a service and wait for its event.
    async fn register_service(tb: &mut TestBus, name: &str) -> LocalPeer {
        let peer = tb.service_channel.connect().unwrap();
        peer.send(codec::encode(&Envelope::register_service(name)).unwrap())
            .unwrap();
        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ServiceRegistered { service_id, .. } if service_id == name)
        })
        .await;
        peer
    }

    /// Connect a client to a service and wait for its event.
    async fn connect_client(tb: &mut TestBus, service: &str) -> LocalPeer {
        let peer = tb.client_channel.connect().unwrap();
        peer.send(codec::encode(&Envelope::connect_client(service)).unwrap())
            .unwrap();
        let peer_id = peer.id().clone();
        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ClientConnected { client_connection_id, .. } if client_connection_id == &peer_id)
        })
        .await;
        peer
    }

    #[tokio::test]
    async fn test_service_registration() {
        let mut tb = start_bus().await;
        let peer = register_service(&mut tb, "Echo").await;

        assert_eq!(tb.bus.connected_service_ids(), vec!["Echo".to_string()]);
        drop(peer);
    }

    #[tokio::test]
    async fn test_idempotent_service_registration() {
        let mut tb = start_bus().await;
        let peer = register_service(&mut tb, "Echo").await;

        // Identical re-registration: no second event, no table change.
        let mut fresh = tb.bus.subscribe();
        peer.send(codec::encode(&Envelope::register_service("Echo")).unwrap())
            .unwrap();
        let other = register_service(&mut tb, "Other").await;

        // The only event since the duplicate is Other's registration.
        match next_event(&mut fresh).await {
            BusEvent::ServiceRegistered { service_id, .. } => assert_eq!(service_id, "Other"),
            event => panic!("Expected Other's registration, got {:?}", event),
        }

        let mut ids = tb.bus.connected_service_ids();
        ids.sort();
        assert_eq!(ids, vec!["Echo".to_string(), "Other".to_string()]);
        drop((peer, other));
    }

    #[tokio::test]
    async fn test_conflicting_registration_same_connection() {
        let mut tb = start_bus().await;
        let mut peer = register_service(&mut tb, "Echo").await;

        // Same physical connection claims a second name: hijack attempt.
        peer.send(codec::encode(&Envelope::register_service("Other")).unwrap())
            .unwrap();

        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ServiceUnregistered { service_id, .. } if service_id == "Echo")
        })
        .await;
        recv_none(&mut peer).await;
        assert!(tb.bus.connected_service_ids().is_empty());
    }

    #[tokio::test]
    async fn test_service_name_claimed_twice() {
        let mut tb = start_bus().await;
        let peer1 = register_service(&mut tb, "Echo").await;

        // A different connection claims the same name: the offender is
        // dropped, the existing registration stays.
        let mut peer2 = tb.service_channel.connect().unwrap();
        peer2
            .send(codec::encode(&Envelope::register_service("Echo")).unwrap())
            .unwrap();

        recv_none(&mut peer2).await;
        assert_eq!(tb.bus.connected_service_ids(), vec!["Echo".to_string()]);
        drop(peer1);
    }

    #[tokio::test]
    async fn test_client_connect_handshake() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;

        // The service learns the new client's transport-assigned id.
        let announce = recv_envelope(&mut service).await;
        assert_eq!(announce.kind, EnvelopeKind::ConnectClient);
        assert_eq!(announce.id, client.id().as_str());

        // The service's confirmation reaches the client unwrapped.
        service
            .send(codec::encode(&Envelope::confirm_client(client.id().as_str())).unwrap())
            .unwrap();
        let confirm = recv_envelope(&mut client).await;
        assert_eq!(confirm.kind, EnvelopeKind::ConfirmClient);
        assert_eq!(confirm.id, client.id().as_str());

        assert_eq!(tb.bus.connected_client_count("Echo"), 1);
        assert_eq!(tb.bus.connected_client_ids("Echo"), vec![client.id().clone()]);
    }

    #[tokio::test]
    async fn test_connect_to_unknown_service_rejected() {
        let tb = start_bus().await;
        let mut client = tb.client_channel.connect().unwrap();
        client
            .send(codec::encode(&Envelope::connect_client("Ghost")).unwrap())
            .unwrap();

        recv_none(&mut client).await;
        assert_eq!(tb.bus.connected_client_count("Ghost"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_client_connect_rejected() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        client
            .send(codec::encode(&Envelope::connect_client("Echo")).unwrap())
            .unwrap();

        // The duplicate attempt drops the physical connection, which then
        // tears the original registration down too.
        recv_none(&mut client).await;
        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ClientDisconnected { .. })
        })
        .await;
        assert_eq!(tb.bus.connected_client_count("Echo"), 0);
    }

    #[tokio::test]
    async fn test_request_identity_substitution() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        // The client claims someone else's identity in the envelope.
        client
            .send(codec::encode(&Envelope::request("spoofed", b"ping".to_vec())).unwrap())
            .unwrap();

        let request = recv_envelope(&mut service).await;
        assert_eq!(request.kind, EnvelopeKind::SendRequest);
        assert_eq!(request.id, client.id().as_str());
        assert_eq!(&request.payload.unwrap()[..], b"ping");

        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::MessageToServiceSent { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn test_response_bytes_forwarded_unchanged() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        let wire =
            codec::encode(&Envelope::response(client.id().as_str(), b"pong".to_vec())).unwrap();
        service.send(wire.clone()).unwrap();

        // Byte-identical: no re-serialization on the way through the bus.
        let received = recv_raw(&mut client).await;
        assert_eq!(received, wire);

        let event = wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::MessageToClientSent { .. })
        })
        .await;
        if let BusEvent::MessageToClientSent { bytes, .. } = event {
            assert_eq!(bytes, 4);
        }
    }

    #[tokio::test]
    async fn test_response_from_wrong_service_dropped() {
        let mut tb = start_bus().await;
        let mut echo = register_service(&mut tb, "Echo").await;
        let other = register_service(&mut tb, "Other").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut echo).await; // ConnectClient

        // "Other" pushes a response to a client it is not serving.
        other
            .send(codec::encode(&Envelope::response(client.id().as_str(), b"spoof".to_vec())).unwrap())
            .unwrap();
        // A legitimate response follows through the same connector loop.
        echo.send(codec::encode(&Envelope::response(client.id().as_str(), b"real".to_vec())).unwrap())
            .unwrap();

        let received = recv_envelope(&mut client).await;
        assert_eq!(&received.payload.unwrap()[..], b"real");
        assert!(client.try_recv().is_err(), "spoofed response was delivered");
    }

    #[tokio::test]
    async fn test_per_client_request_ordering() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let client_a = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient a
        let client_b = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient b

        for i in 0..50u32 {
            client_a
                .send(codec::encode(&Envelope::request("x", i.to_be_bytes().to_vec())).unwrap())
                .unwrap();
            client_b
                .send(codec::encode(&Envelope::request("x", i.to_be_bytes().to_vec())).unwrap())
                .unwrap();
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while seen_a.len() < 50 || seen_b.len() < 50 {
            let envelope = recv_envelope(&mut service).await;
            let value = u32::from_be_bytes(envelope.payload.unwrap()[..].try_into().unwrap());
            if envelope.id == client_a.id().as_str() {
                seen_a.push(value);
            } else {
                assert_eq!(envelope.id, client_b.id().as_str());
                seen_b.push(value);
            }
        }

        // Order within each client's stream is preserved.
        assert_eq!(seen_a, (0..50).collect::<Vec<_>>());
        assert_eq!(seen_b, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_service_drop_cascades_to_clients() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        service.close();

        let event = wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ClientDisconnected { .. })
        })
        .await;
        if let BusEvent::ClientDisconnected { service_id, .. } = event {
            assert_eq!(service_id, "Echo");
        }
        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ServiceUnregistered { service_id, .. } if service_id == "Echo")
        })
        .await;

        recv_none(&mut client).await;
        assert!(tb.bus.connected_client_ids("Echo").is_empty());
        assert!(tb.bus.connected_service_ids().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_service_by_id() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        tb.bus.disconnect_service("Echo").await;

        recv_none(&mut client).await;
        recv_none(&mut service).await;
        assert!(tb.bus.connected_service_ids().is_empty());
        assert_eq!(tb.bus.connected_client_count("Echo"), 0);
    }

    #[tokio::test]
    async fn test_malformed_envelope_from_service() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;

        service.send(bytes::Bytes::from_static(b"garbage")).unwrap();

        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ServiceUnregistered { service_id, .. } if service_id == "Echo")
        })
        .await;
        recv_none(&mut service).await;
    }

    #[tokio::test]
    async fn test_malformed_envelope_from_client() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        client.send(bytes::Bytes::from_static(b"\xFFgarbage")).unwrap();

        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ClientDisconnected { .. })
        })
        .await;
        recv_none(&mut client).await;

        // The service was told its client went away.
        let close = recv_envelope(&mut service).await;
        assert_eq!(close.kind, EnvelopeKind::DisconnectClient);
        assert_eq!(close.id, client.id().as_str());
    }

    #[tokio::test]
    async fn test_invalid_kind_on_client_channel() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        // RegisterService is a service-channel message; on the client
        // channel it is a protocol violation.
        client
            .send(codec::encode(&Envelope::register_service("Sneaky")).unwrap())
            .unwrap();

        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ClientDisconnected { .. })
        })
        .await;
        recv_none(&mut client).await;
        assert!(tb.bus.connected_service_ids().contains(&"Echo".to_string()));
    }

    #[tokio::test]
    async fn test_client_drop_notifies_service() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient
        let client_id = client.id().clone();

        client.close();

        let close = recv_envelope(&mut service).await;
        assert_eq!(close.kind, EnvelopeKind::DisconnectClient);
        assert_eq!(close.id, client_id.as_str());
        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ClientDisconnected { client_connection_id, .. } if client_connection_id == &client_id)
        })
        .await;
    }

    #[tokio::test]
    async fn test_service_initiated_client_disconnect() {
        let mut tb = start_bus().await;
        let mut service = register_service(&mut tb, "Echo").await;
        let mut client = connect_client(&mut tb, "Echo").await;
        let _ = recv_envelope(&mut service).await; // ConnectClient

        service
            .send(codec::encode(&Envelope::disconnect_client(client.id().as_str())).unwrap())
            .unwrap();

        recv_none(&mut client).await;
        wait_for(&mut tb.events, |e| {
            matches!(e, BusEvent::ClientDisconnected { .. })
        })
        .await;
        assert_eq!(tb.bus.connected_client_count("Echo"), 0);
    }

    #[tokio::test]
    async fn test_attach_detach_lifecycle() {
        let mut tb = start_bus().await;
        let _service = register_service(&mut tb, "Echo").await;

        let err = tb
            .bus
            .attach(
                Arc::new(tb.service_channel.clone()),
                Arc::new(tb.client_channel.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::BusError::AlreadyAttached));

        tb.bus.detach().await.unwrap();
        assert!(!tb.bus.is_attached().await);
        assert!(tb.bus.connected_service_ids().is_empty());
        assert!(!tb.service_channel.is_listening());

        let err = tb.bus.detach().await.unwrap_err();
        assert!(matches!(err, crate::BusError::NotAttached));
    }
}
