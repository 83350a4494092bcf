//! Registration tables.
//!
//! Two logically independent collections — registered services and connected
//! clients — kept in one struct so a single mutex (held by the orchestrator)
//! guards them both. Critical sections stay short: no I/O and no event
//! raising happen while the lock is held.

use crate::dispatch::SerialQueue;
use junction_channel::ConnectionId;
use std::collections::HashMap;

/// One registered service.
///
/// Exactly one live registration may exist per distinct `service_id` and per
/// distinct `connection_id`; the orchestrator enforces this before inserting.
#[derive(Debug, Clone)]
pub(crate) struct ServiceRegistration {
    /// Business-level name chosen by the service.
    pub service_id: String,
    /// Physical connection identity on the service channel.
    pub connection_id: ConnectionId,
}

/// One client routed to a service.
#[derive(Debug)]
pub(crate) struct ClientConnection {
    /// Physical connection identity on the client channel.
    pub connection_id: ConnectionId,
    /// The service this client targets.
    pub service_id: String,
    /// The target service's physical identity, pinned at connect time.
    pub service_connection_id: ConnectionId,
    /// Serial queue for client → service traffic.
    pub to_service: SerialQueue,
    /// Serial queue for service → client traffic.
    pub to_client: SerialQueue,
}

/// The two registration tables.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    /// Registered services by service id.
    services: HashMap<String, ConnectionId>,
    /// Reverse index: service connection id → service id.
    service_connections: HashMap<ConnectionId, String>,
    /// Connected clients by client connection id.
    clients: HashMap<ConnectionId, ClientConnection>,
}

impl Tables {
    /// Look up a service's connection by service id.
    pub fn find_service(&self, service_id: &str) -> Option<&ConnectionId> {
        self.services.get(service_id)
    }

    /// Look up a service id by its connection.
    pub fn find_service_by_connection(&self, connection_id: &ConnectionId) -> Option<&String> {
        self.service_connections.get(connection_id)
    }

    /// Insert a service registration. The caller has already checked both
    /// uniqueness keys.
    pub fn insert_service(&mut self, service_id: String, connection_id: ConnectionId) {
        self.service_connections
            .insert(connection_id.clone(), service_id.clone());
        self.services.insert(service_id, connection_id);
    }

    /// Remove the service registered on `connection_id`, if any.
    pub fn remove_service_by_connection(
        &mut self,
        connection_id: &ConnectionId,
    ) -> Option<ServiceRegistration> {
        let service_id = self.service_connections.remove(connection_id)?;
        self.services.remove(&service_id);
        Some(ServiceRegistration {
            service_id,
            connection_id: connection_id.clone(),
        })
    }

    /// All registered service ids.
    pub fn service_ids(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Whether a client connection is registered.
    pub fn contains_client(&self, connection_id: &ConnectionId) -> bool {
        self.clients.contains_key(connection_id)
    }

    /// Look up a client connection.
    pub fn get_client(&self, connection_id: &ConnectionId) -> Option<&ClientConnection> {
        self.clients.get(connection_id)
    }

    /// Insert a client connection. The caller has already checked for a
    /// duplicate id.
    pub fn insert_client(&mut self, client: ClientConnection) {
        self.clients.insert(client.connection_id.clone(), client);
    }

    /// Remove a client connection, if present.
    pub fn remove_client(&mut self, connection_id: &ConnectionId) -> Option<ClientConnection> {
        self.clients.remove(connection_id)
    }

    /// Remove every client pinned to the given service connection.
    pub fn remove_clients_of_service(
        &mut self,
        service_connection_id: &ConnectionId,
    ) -> Vec<ClientConnection> {
        let ids: Vec<ConnectionId> = self
            .clients
            .values()
            .filter(|c| &c.service_connection_id == service_connection_id)
            .map(|c| c.connection_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.clients.remove(id))
            .collect()
    }

    /// Connection ids of every client routed to the named service.
    pub fn client_ids_of_service(&self, service_id: &str) -> Vec<ConnectionId> {
        self.clients
            .values()
            .filter(|c| c.service_id == service_id)
            .map(|c| c.connection_id.clone())
            .collect()
    }
}
