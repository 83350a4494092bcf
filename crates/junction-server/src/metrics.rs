//! Metrics collection and export for the Junction node.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Counters and gauges are fed from the
//! bus event stream.

use junction_bus::BusEvent;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SERVICES_TOTAL: &str = "junction_services_total";
    pub const SERVICES_ACTIVE: &str = "junction_services_active";
    pub const CLIENTS_TOTAL: &str = "junction_clients_total";
    pub const CLIENTS_ACTIVE: &str = "junction_clients_active";
    pub const MESSAGES_TOTAL: &str = "junction_messages_total";
    pub const MESSAGES_BYTES: &str = "junction_messages_bytes";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SERVICES_TOTAL,
        "Total number of service registrations since node start"
    );
    metrics::describe_gauge!(
        names::SERVICES_ACTIVE,
        "Current number of registered services"
    );
    metrics::describe_counter!(
        names::CLIENTS_TOTAL,
        "Total number of client connections since node start"
    );
    metrics::describe_gauge!(names::CLIENTS_ACTIVE, "Current number of connected clients");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages forwarded");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages forwarded");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a bus event.
pub fn record_event(event: &BusEvent) {
    match event {
        BusEvent::ServiceRegistered { .. } => {
            counter!(names::SERVICES_TOTAL).increment(1);
            gauge!(names::SERVICES_ACTIVE).increment(1.0);
        }
        BusEvent::ServiceUnregistered { .. } => {
            gauge!(names::SERVICES_ACTIVE).decrement(1.0);
        }
        BusEvent::ClientConnected { .. } => {
            counter!(names::CLIENTS_TOTAL).increment(1);
            gauge!(names::CLIENTS_ACTIVE).increment(1.0);
        }
        BusEvent::ClientDisconnected { .. } => {
            gauge!(names::CLIENTS_ACTIVE).decrement(1.0);
        }
        BusEvent::MessageToServiceSent { bytes, .. } => {
            record_forward(*bytes, "to_service");
        }
        BusEvent::MessageToClientSent { bytes, .. } => {
            record_forward(*bytes, "to_client");
        }
    }
}

/// Record a forwarded message.
fn record_forward(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use junction_bus::ConnectionId;

    #[test]
    fn test_record_event_does_not_panic() {
        record_event(&BusEvent::ServiceRegistered {
            service_id: "Echo".to_string(),
            connection_id: ConnectionId::new("sc1"),
        });
        record_event(&BusEvent::MessageToClientSent {
            service_id: "Echo".to_string(),
            service_connection_id: ConnectionId::new("sc1"),
            client_connection_id: ConnectionId::new("cc1"),
            bytes: 42,
        });
    }
}
