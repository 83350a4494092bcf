//! The bus orchestrator.
//!
//! [`MessageBus`] owns the registration tables, the event channel, and the
//! two attached physical channels. All state transitions — register, connect,
//! forward, unregister — run through it.
//!
//! Locking discipline: the table mutex protects only short, I/O-free
//! critical sections; events are raised after it is released. The attachment
//! state has its own lock, since attach/detach is a coarse startup/shutdown
//! operation that must not contend with per-message traffic.

use crate::dispatch::SerialQueue;
use crate::events::BusEvent;
use crate::tables::{ClientConnection, Tables};
use junction_channel::{ChannelError, ConnectionId, DuplexInputChannel};
use junction_protocol::{Envelope, EnvelopeCodec};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Broadcast capacity for bus events.
const EVENT_CAPACITY: usize = 256;

/// Bus errors surfaced through the public API.
///
/// Protocol violations and forwarding failures never appear here; they are
/// handled internally by tearing down the offending peer.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus already has channels attached.
    #[error("Bus is already attached")]
    AlreadyAttached,

    /// The bus has no channels attached.
    #[error("Bus is not attached")]
    NotAttached,

    /// A channel's event stream was already consumed elsewhere.
    #[error("Event stream of channel {0:?} is unavailable")]
    EventsUnavailable(String),

    /// Error from an underlying channel.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// The two attached channels and their connector loops.
struct Attachment {
    service_channel: Arc<dyn DuplexInputChannel>,
    client_channel: Arc<dyn DuplexInputChannel>,
    service_loop: JoinHandle<()>,
    client_loop: JoinHandle<()>,
}

/// Shared bus state; connector loops hold an `Arc` to this.
pub(crate) struct Core {
    tables: Mutex<Tables>,
    events: broadcast::Sender<BusEvent>,
    codec: EnvelopeCodec,
    attachment: tokio::sync::Mutex<Option<Attachment>>,
}

/// A message bus multiplexing many clients to many named services over two
/// shared physical channels.
pub struct MessageBus {
    core: Arc<Core>,
}

impl MessageBus {
    /// Create a bus using the default (network byte order) codec.
    #[must_use]
    pub fn new() -> Self {
        Self::with_codec(EnvelopeCodec::new())
    }

    /// Create a bus with an explicit envelope codec.
    #[must_use]
    pub fn with_codec(codec: EnvelopeCodec) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core: Arc::new(Core {
                tables: Mutex::new(Tables::default()),
                events,
                codec,
                attachment: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Subscribe to bus events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.core.events.subscribe()
    }

    /// Attach the two physical channels and start routing.
    ///
    /// `service_channel` is the endpoint services connect and register on;
    /// `client_channel` is the endpoint clients connect on.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is already attached, a channel fails to
    /// start listening, or a channel's event stream was already taken.
    pub async fn attach(
        &self,
        service_channel: Arc<dyn DuplexInputChannel>,
        client_channel: Arc<dyn DuplexInputChannel>,
    ) -> Result<(), BusError> {
        let mut attachment = self.core.attachment.lock().await;
        if attachment.is_some() {
            return Err(BusError::AlreadyAttached);
        }

        service_channel.start_listening().await?;
        client_channel.start_listening().await?;

        let service_events = service_channel
            .take_events()
            .ok_or_else(|| BusError::EventsUnavailable(service_channel.channel_id().to_string()))?;
        let client_events = client_channel
            .take_events()
            .ok_or_else(|| BusError::EventsUnavailable(client_channel.channel_id().to_string()))?;

        let service_loop = tokio::spawn(crate::connectors::run_service_side(
            Arc::clone(&self.core),
            service_events,
        ));
        let client_loop = tokio::spawn(crate::connectors::run_client_side(
            Arc::clone(&self.core),
            client_events,
        ));

        info!(
            service_channel = %service_channel.channel_id(),
            client_channel = %client_channel.channel_id(),
            "Bus attached"
        );

        *attachment = Some(Attachment {
            service_channel,
            client_channel,
            service_loop,
            client_loop,
        });
        Ok(())
    }

    /// Detach the channels and stop routing.
    ///
    /// Both tables are cleared; peers are dropped by the channels without
    /// per-peer teardown.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is not attached.
    pub async fn detach(&self) -> Result<(), BusError> {
        let mut attachment = self.core.attachment.lock().await;
        let Some(attached) = attachment.take() else {
            return Err(BusError::NotAttached);
        };

        attached.service_loop.abort();
        attached.client_loop.abort();
        attached.service_channel.stop_listening().await;
        attached.client_channel.stop_listening().await;

        let mut tables = self.core.tables.lock().unwrap();
        *tables = Tables::default();
        drop(tables);

        info!("Bus detached");
        Ok(())
    }

    /// Whether channels are currently attached.
    pub async fn is_attached(&self) -> bool {
        self.core.attachment.lock().await.is_some()
    }

    /// Ids of all registered services.
    #[must_use]
    pub fn connected_service_ids(&self) -> Vec<String> {
        self.core.tables.lock().unwrap().service_ids()
    }

    /// Connection ids of all clients routed to the named service.
    #[must_use]
    pub fn connected_client_ids(&self, service_id: &str) -> Vec<ConnectionId> {
        self.core
            .tables
            .lock()
            .unwrap()
            .client_ids_of_service(service_id)
    }

    /// Number of clients routed to the named service.
    #[must_use]
    pub fn connected_client_count(&self, service_id: &str) -> usize {
        self.connected_client_ids(service_id).len()
    }

    /// Disconnect a service by its service id, cascading to its clients.
    pub async fn disconnect_service(&self, service_id: &str) {
        let connection_id = {
            let tables = self.core.tables.lock().unwrap();
            tables.find_service(service_id).cloned()
        };
        match connection_id {
            Some(connection_id) => self.core.unregister_service(&connection_id).await,
            None => debug!(service = %service_id, "Disconnect of unknown service ignored"),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the locked phase of `register_service`.
enum RegisterServiceOutcome {
    Inserted,
    Duplicate,
    Conflict,
}

/// Outcome of the locked phase of `register_client`.
enum RegisterClientOutcome {
    DuplicateClient,
    NoSuchService,
    Inserted { service_connection_id: ConnectionId },
}

impl Core {
    pub(crate) fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    fn emit(&self, event: BusEvent) {
        trace!(event = ?event, "Bus event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Clone the attached channel pair, if any.
    async fn channels(
        &self,
    ) -> Option<(Arc<dyn DuplexInputChannel>, Arc<dyn DuplexInputChannel>)> {
        self.attachment
            .lock()
            .await
            .as_ref()
            .map(|a| (Arc::clone(&a.service_channel), Arc::clone(&a.client_channel)))
    }

    /// Register a service under `service_id` on physical connection
    /// `connection_id`.
    ///
    /// Re-registration of the identical pair is a no-op. A registration that
    /// matches one key but not the other is a hijack attempt or stale state;
    /// the offending connection is torn down.
    pub(crate) async fn register_service(
        self: &Arc<Self>,
        service_id: String,
        connection_id: ConnectionId,
    ) {
        let outcome = {
            let mut tables = self.tables.lock().unwrap();
            let by_id = tables.find_service(&service_id).cloned();
            let by_connection = tables.find_service_by_connection(&connection_id).cloned();
            match (by_id, by_connection) {
                (None, None) => {
                    tables.insert_service(service_id.clone(), connection_id.clone());
                    RegisterServiceOutcome::Inserted
                }
                (Some(existing), _) if existing == connection_id => {
                    RegisterServiceOutcome::Duplicate
                }
                _ => RegisterServiceOutcome::Conflict,
            }
        };

        match outcome {
            RegisterServiceOutcome::Inserted => {
                info!(service = %service_id, connection = %connection_id, "Service registered");
                self.emit(BusEvent::ServiceRegistered {
                    service_id,
                    connection_id,
                });
            }
            RegisterServiceOutcome::Duplicate => {
                debug!(service = %service_id, connection = %connection_id, "Duplicate service registration ignored");
            }
            RegisterServiceOutcome::Conflict => {
                warn!(
                    service = %service_id,
                    connection = %connection_id,
                    "Conflicting service registration; tearing down connection"
                );
                self.unregister_service(&connection_id).await;
            }
        }
    }

    /// Remove the service on `connection_id` and cascade to its clients.
    ///
    /// The physical disconnects are best-effort; the service connection is
    /// dropped even when no registration matched it.
    pub(crate) async fn unregister_service(self: &Arc<Self>, connection_id: &ConnectionId) {
        let (removed, clients) = {
            let mut tables = self.tables.lock().unwrap();
            let removed = tables.remove_service_by_connection(connection_id);
            let clients = tables.remove_clients_of_service(connection_id);
            (removed, clients)
        };

        let channels = self.channels().await;

        for client in &clients {
            if let Some((_, client_channel)) = &channels {
                if let Err(e) = client_channel.disconnect_peer(&client.connection_id).await {
                    debug!(client = %client.connection_id, error = %e, "Cascade disconnect failed");
                }
            }
        }
        if let Some((service_channel, _)) = &channels {
            if let Err(e) = service_channel.disconnect_peer(connection_id).await {
                debug!(connection = %connection_id, error = %e, "Service disconnect failed");
            }
        }

        for client in clients {
            self.emit(BusEvent::ClientDisconnected {
                service_id: client.service_id,
                service_connection_id: client.service_connection_id,
                client_connection_id: client.connection_id,
            });
        }
        if let Some(registration) = removed {
            info!(
                service = %registration.service_id,
                connection = %connection_id,
                "Service unregistered"
            );
            self.emit(BusEvent::ServiceUnregistered {
                service_id: registration.service_id,
                connection_id: registration.connection_id,
            });
        }
    }

    /// Route a new client to the service named `service_id`.
    ///
    /// Rejection (duplicate client id, unknown service) drops the client's
    /// physical connection; the failure never crosses the bus boundary.
    pub(crate) async fn register_client(
        self: &Arc<Self>,
        client_connection_id: ConnectionId,
        service_id: String,
    ) {
        let outcome = {
            let mut tables = self.tables.lock().unwrap();
            if tables.contains_client(&client_connection_id) {
                RegisterClientOutcome::DuplicateClient
            } else {
                match tables.find_service(&service_id).cloned() {
                    None => RegisterClientOutcome::NoSuchService,
                    Some(service_connection_id) => {
                        tables.insert_client(ClientConnection {
                            connection_id: client_connection_id.clone(),
                            service_id: service_id.clone(),
                            service_connection_id: service_connection_id.clone(),
                            to_service: SerialQueue::spawn(format!(
                                "to-service:{}",
                                client_connection_id
                            )),
                            to_client: SerialQueue::spawn(format!(
                                "to-client:{}",
                                client_connection_id
                            )),
                        });
                        RegisterClientOutcome::Inserted {
                            service_connection_id,
                        }
                    }
                }
            }
        };

        match outcome {
            RegisterClientOutcome::DuplicateClient => {
                warn!(client = %client_connection_id, "Duplicate client connect rejected");
                self.disconnect_client_peer(&client_connection_id).await;
            }
            RegisterClientOutcome::NoSuchService => {
                warn!(
                    client = %client_connection_id,
                    service = %service_id,
                    "Client connect to unknown service rejected"
                );
                self.disconnect_client_peer(&client_connection_id).await;
            }
            RegisterClientOutcome::Inserted {
                service_connection_id,
            } => {
                // Tell the service about its new client. A failure here means
                // the client never becomes active; the service itself may just
                // be overloaded, so only the client is torn down.
                let envelope = Envelope::connect_client(client_connection_id.as_str());
                if let Err(e) = self
                    .send_to_service(&service_connection_id, &envelope)
                    .await
                {
                    warn!(
                        client = %client_connection_id,
                        service = %service_id,
                        error = %e,
                        "Failed to announce client to service"
                    );
                    self.unregister_client(&client_connection_id, false, true)
                        .await;
                    return;
                }

                debug!(
                    client = %client_connection_id,
                    service = %service_id,
                    "Client connected"
                );
                self.emit(BusEvent::ClientConnected {
                    service_id,
                    service_connection_id,
                    client_connection_id,
                });
            }
        }
    }

    /// Remove a client connection.
    ///
    /// `send_close_to_service` tells the service with a `DisconnectClient`
    /// envelope; `disconnect_physical` drops the client's physical
    /// connection. Both are best-effort.
    pub(crate) async fn unregister_client(
        self: &Arc<Self>,
        client_connection_id: &ConnectionId,
        send_close_to_service: bool,
        disconnect_physical: bool,
    ) {
        let removed = {
            let mut tables = self.tables.lock().unwrap();
            tables.remove_client(client_connection_id)
        };

        if let Some(client) = &removed {
            if send_close_to_service {
                let envelope = Envelope::disconnect_client(client_connection_id.as_str());
                if let Err(e) = self
                    .send_to_service(&client.service_connection_id, &envelope)
                    .await
                {
                    debug!(
                        client = %client_connection_id,
                        service = %client.service_id,
                        error = %e,
                        "Close notification to service failed"
                    );
                }
            }
        }

        if disconnect_physical {
            self.disconnect_client_peer(client_connection_id).await;
        }

        if let Some(client) = removed {
            debug!(client = %client_connection_id, service = %client.service_id, "Client disconnected");
            self.emit(BusEvent::ClientDisconnected {
                service_id: client.service_id,
                service_connection_id: client.service_connection_id,
                client_connection_id: client.connection_id,
            });
        }
    }

    /// Forward a client request to its service.
    ///
    /// The envelope id is overwritten with the transport-verified client
    /// connection id; the client-supplied id is never trusted. Delivery runs
    /// on the client's to-service serial queue, so order within one client's
    /// stream is preserved without serializing unrelated peers.
    pub(crate) async fn forward_to_service(
        self: &Arc<Self>,
        client_connection_id: &ConnectionId,
        mut envelope: Envelope,
    ) {
        let route = {
            let tables = self.tables.lock().unwrap();
            tables.get_client(client_connection_id).map(|c| {
                (
                    c.service_id.clone(),
                    c.service_connection_id.clone(),
                    c.to_service.clone(),
                )
            })
        };
        let Some((service_id, service_connection_id, queue)) = route else {
            warn!(client = %client_connection_id, "Request from unknown client dropped");
            return;
        };

        // Identity substitution, re-asserted even though the connector
        // already did it.
        envelope.id = client_connection_id.as_str().to_string();

        let core = Arc::clone(self);
        let client_connection_id = client_connection_id.clone();
        queue.submit(async move {
            let data = match core.codec.encode(&envelope) {
                Ok(data) => data,
                Err(e) => {
                    warn!(client = %client_connection_id, error = %e, "Failed to encode request");
                    return;
                }
            };
            let Some((service_channel, _)) = core.channels().await else {
                warn!(client = %client_connection_id, "Request dropped: bus detached");
                return;
            };

            let bytes = data.len();
            match service_channel.send_message(&service_connection_id, data).await {
                Ok(()) => {
                    core.emit(BusEvent::MessageToServiceSent {
                        service_id,
                        service_connection_id,
                        client_connection_id,
                        bytes,
                    });
                }
                Err(e) => {
                    // A broken service connection invalidates routing for
                    // everyone behind it: full cascade, not just this client.
                    warn!(
                        service = %service_id,
                        connection = %service_connection_id,
                        error = %e,
                        "Forward to service failed; unregistering service"
                    );
                    core.unregister_service(&service_connection_id).await;
                }
            }
        });
    }

    /// Forward a service message to a client, bytes unchanged.
    ///
    /// The lookup matches both the client connection id and the sending
    /// service's connection id — a service cannot push to a client it is not
    /// actually serving. `payload_for_event` is `Some` for response traffic
    /// (raising `MessageToClientSent`) and `None` for confirmations.
    pub(crate) async fn forward_to_client(
        self: &Arc<Self>,
        client_connection_id: &ConnectionId,
        service_connection_id: &ConnectionId,
        raw: bytes::Bytes,
        payload_for_event: Option<bytes::Bytes>,
    ) {
        let route = {
            let tables = self.tables.lock().unwrap();
            tables
                .get_client(client_connection_id)
                .filter(|c| &c.service_connection_id == service_connection_id)
                .map(|c| (c.service_id.clone(), c.to_client.clone()))
        };
        let Some((service_id, queue)) = route else {
            warn!(
                client = %client_connection_id,
                service_connection = %service_connection_id,
                "Message for unknown or mismatched client dropped"
            );
            return;
        };

        let core = Arc::clone(self);
        let client_connection_id = client_connection_id.clone();
        let service_connection_id = service_connection_id.clone();
        queue.submit(async move {
            let Some((_, client_channel)) = core.channels().await else {
                warn!(client = %client_connection_id, "Message dropped: bus detached");
                return;
            };

            match client_channel.send_message(&client_connection_id, raw).await {
                Ok(()) => {
                    if let Some(payload) = payload_for_event {
                        core.emit(BusEvent::MessageToClientSent {
                            service_id,
                            service_connection_id,
                            client_connection_id,
                            bytes: payload.len(),
                        });
                    }
                }
                Err(e) => {
                    // One bad client does not imply the service is broken;
                    // only this client is torn down.
                    warn!(
                        client = %client_connection_id,
                        error = %e,
                        "Forward to client failed; unregistering client"
                    );
                    core.unregister_client(&client_connection_id, true, true).await;
                }
            }
        });
    }

    /// Encode and send a control envelope to a service connection.
    async fn send_to_service(
        &self,
        service_connection_id: &ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), ChannelError> {
        let data = self
            .codec
            .encode(envelope)
            .map_err(|e| ChannelError::Other(e.to_string()))?;
        let Some((service_channel, _)) = self.channels().await else {
            return Err(ChannelError::NotListening);
        };
        service_channel.send_message(service_connection_id, data).await
    }

    /// Best-effort physical disconnect of a client peer.
    async fn disconnect_client_peer(&self, client_connection_id: &ConnectionId) {
        let Some((_, client_channel)) = self.channels().await else {
            return;
        };
        if let Err(e) = client_channel.disconnect_peer(client_connection_id).await {
            debug!(client = %client_connection_id, error = %e, "Client disconnect failed");
        }
    }
}
