//! # junction-protocol
//!
//! Wire protocol definitions for the Junction message bus.
//!
//! This crate defines the single message type exchanged with the bus — the
//! [`Envelope`] — together with its compact binary encoding and protocol
//! versioning.
//!
//! ## Envelope kinds
//!
//! - `RegisterService` — a service announces itself under a business-level id
//! - `ConnectClient` / `ConfirmClient` — client connection handshake
//! - `DisconnectClient` — either side tears a client down
//! - `SendRequest` / `SendResponse` — opaque request/response traffic
//!
//! ## Example
//!
//! ```rust
//! use junction_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::request("client-1", b"payload".to_vec());
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod version;

pub use codec::{decode, encode, ByteOrder, EnvelopeCodec, ProtocolError};
pub use envelope::{Envelope, EnvelopeKind};
pub use version::{Version, PROTOCOL_VERSION};
