//! Bus lifecycle and traffic events.
//!
//! Observers subscribe through [`crate::MessageBus::subscribe`]; events are
//! always emitted after the registration tables' mutex has been released, so
//! a subscriber may call back into the bus without deadlocking.

use junction_channel::ConnectionId;

/// An event raised by the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A service registered under a new service id.
    ServiceRegistered {
        /// Business-level service name.
        service_id: String,
        /// The service's physical connection identity.
        connection_id: ConnectionId,
    },

    /// A service registration was removed.
    ServiceUnregistered {
        /// Business-level service name.
        service_id: String,
        /// The service's physical connection identity.
        connection_id: ConnectionId,
    },

    /// A client was routed to a service.
    ClientConnected {
        /// The service the client targets.
        service_id: String,
        /// The service's physical connection identity at connect time.
        service_connection_id: ConnectionId,
        /// The client's physical connection identity.
        client_connection_id: ConnectionId,
    },

    /// A client connection was removed.
    ClientDisconnected {
        /// The service the client targeted.
        service_id: String,
        /// The service's physical connection identity at connect time.
        service_connection_id: ConnectionId,
        /// The client's physical connection identity.
        client_connection_id: ConnectionId,
    },

    /// A client request was delivered to its service.
    MessageToServiceSent {
        /// The target service.
        service_id: String,
        /// The service's physical connection identity.
        service_connection_id: ConnectionId,
        /// The originating client.
        client_connection_id: ConnectionId,
        /// Size of the forwarded envelope in bytes.
        bytes: usize,
    },

    /// A service response was delivered to its client.
    MessageToClientSent {
        /// The originating service.
        service_id: String,
        /// The service's physical connection identity.
        service_connection_id: ConnectionId,
        /// The target client.
        client_connection_id: ConnectionId,
        /// Size of the forwarded payload in bytes.
        bytes: usize,
    },
}
