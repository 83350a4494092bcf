//! # junction-channel
//!
//! Duplex channel abstraction for the Junction message bus.
//!
//! The bus never talks to sockets directly. It consumes two instances of the
//! [`DuplexInputChannel`] trait — one that services connect to and one that
//! clients connect to — and reacts to the [`ChannelEvent`] stream each one
//! produces. Transport implementations (TCP, HTTP polling, shared memory)
//! plug in behind this trait.
//!
//! This crate ships one implementation, [`LocalChannel`], an in-process
//! channel used for embedding the bus in a single process and for end-to-end
//! tests.
//!
//! ```rust,ignore
//! use junction_channel::{DuplexInputChannel, LocalChannel};
//!
//! let channel = LocalChannel::new("service-endpoint");
//! channel.start_listening().await?;
//! let mut events = channel.take_events().unwrap();
//! while let Some(event) = events.recv().await {
//!     // React to peer connects, disconnects, and messages
//! }
//! ```

pub mod local;
pub mod traits;

pub use local::{LocalChannel, LocalPeer};
pub use traits::{ChannelError, ChannelEvent, ConnectionId, DuplexInputChannel};
