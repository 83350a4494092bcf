//! The envelope type exchanged with the bus.
//!
//! An envelope is the only message shape the bus understands: a kind, an id
//! whose meaning depends on the kind (client connection id or service id),
//! and an opaque payload carried only by request/response traffic.

use bytes::Bytes;

/// Envelope kind identifiers.
///
/// The `u8` values are the wire codes written by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// A service registers itself under `id` (its service id).
    RegisterService = 0x01,
    /// A client asks to be routed to the service named by `id`; when sent by
    /// the bus to a service, `id` is the new client's connection id.
    ConnectClient = 0x02,
    /// Disconnect the client identified by `id`.
    DisconnectClient = 0x03,
    /// A service acknowledges the client identified by `id`.
    ConfirmClient = 0x04,
    /// Client → service traffic; `id` is the client connection id.
    SendRequest = 0x05,
    /// Service → client traffic; `id` is the target client connection id.
    SendResponse = 0x06,
}

impl EnvelopeKind {
    /// Whether this kind carries a payload.
    #[must_use]
    pub fn carries_payload(self) -> bool {
        matches!(self, EnvelopeKind::SendRequest | EnvelopeKind::SendResponse)
    }
}

impl From<EnvelopeKind> for u8 {
    fn from(kind: EnvelopeKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(EnvelopeKind::RegisterService),
            0x02 => Ok(EnvelopeKind::ConnectClient),
            0x03 => Ok(EnvelopeKind::DisconnectClient),
            0x04 => Ok(EnvelopeKind::ConfirmClient),
            0x05 => Ok(EnvelopeKind::SendRequest),
            0x06 => Ok(EnvelopeKind::SendResponse),
            other => Err(other),
        }
    }
}

/// A bus message.
///
/// Invariant: `payload` is `Some` exactly when `kind.carries_payload()`.
/// The codec enforces this on both encode and decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// What this message means.
    pub kind: EnvelopeKind,
    /// Client connection id or service id, depending on `kind`.
    pub id: String,
    /// Opaque payload for request/response traffic.
    pub payload: Option<Bytes>,
}

impl Envelope {
    /// Create a control envelope (no payload).
    ///
    /// # Panics
    ///
    /// Panics if `kind` is a payload-carrying kind; use [`Envelope::request`]
    /// or [`Envelope::response`] for those.
    #[must_use]
    pub fn control(kind: EnvelopeKind, id: impl Into<String>) -> Self {
        assert!(!kind.carries_payload(), "control envelopes carry no payload");
        Self {
            kind,
            id: id.into(),
            payload: None,
        }
    }

    /// Create a `RegisterService` envelope.
    #[must_use]
    pub fn register_service(service_id: impl Into<String>) -> Self {
        Self::control(EnvelopeKind::RegisterService, service_id)
    }

    /// Create a `ConnectClient` envelope.
    #[must_use]
    pub fn connect_client(id: impl Into<String>) -> Self {
        Self::control(EnvelopeKind::ConnectClient, id)
    }

    /// Create a `DisconnectClient` envelope.
    #[must_use]
    pub fn disconnect_client(client_id: impl Into<String>) -> Self {
        Self::control(EnvelopeKind::DisconnectClient, client_id)
    }

    /// Create a `ConfirmClient` envelope.
    #[must_use]
    pub fn confirm_client(client_id: impl Into<String>) -> Self {
        Self::control(EnvelopeKind::ConfirmClient, client_id)
    }

    /// Create a `SendRequest` envelope.
    #[must_use]
    pub fn request(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: EnvelopeKind::SendRequest,
            id: id.into(),
            payload: Some(payload.into()),
        }
    }

    /// Create a `SendResponse` envelope.
    #[must_use]
    pub fn response(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: EnvelopeKind::SendResponse,
            id: id.into(),
            payload: Some(payload.into()),
        }
    }

    /// Check the payload-presence invariant.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.kind.carries_payload() == self.payload.is_some()
    }
}
