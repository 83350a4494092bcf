//! # junction-bus
//!
//! Routing core of the Junction message bus.
//!
//! The bus multiplexes many clients to many named services over two shared
//! physical channels: services connect and register on one, clients connect
//! on the other, and the bus routes connection requests and request/response
//! traffic between them.
//!
//! ## Architecture
//!
//! ```text
//! services ──▶ service channel ──▶ service connector ─┐
//!                                                     ▼
//!                                              ┌─────────────┐
//!                                              │ MessageBus  │──▶ events
//!                                              │  (tables)   │
//!                                              └─────────────┘
//!                                                     ▲
//! clients ───▶ client channel ───▶ client connector ──┘
//! ```
//!
//! Per-client serial queues carry the forwarded traffic, one per direction,
//! so delivery order is preserved per peer while a slow peer never blocks
//! anyone else.
//!
//! ## Example
//!
//! ```rust,ignore
//! use junction_bus::MessageBus;
//! use junction_channel::LocalChannel;
//! use std::sync::Arc;
//!
//! let bus = MessageBus::new();
//! let services = LocalChannel::new("bus-services");
//! let clients = LocalChannel::new("bus-clients");
//! bus.attach(Arc::new(services), Arc::new(clients)).await?;
//! ```

mod bus;
mod connectors;
mod dispatch;
mod events;
mod tables;

pub use bus::{BusError, MessageBus};
pub use dispatch::SerialQueue;
pub use events::BusEvent;

pub use junction_channel::ConnectionId;
