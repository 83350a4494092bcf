//! Codec for encoding and decoding bus envelopes.
//!
//! The wire format is deliberately small:
//!
//! - 1 byte: envelope kind
//! - 4 bytes: id length, followed by that many UTF-8 bytes
//! - for `SendRequest` / `SendResponse` only: 4 bytes payload length,
//!   followed by that many opaque bytes
//!
//! The byte order of the two length prefixes is configurable for
//! cross-platform peers; the free [`encode`] / [`decode`] functions use
//! network (big-endian) order.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeKind};

/// Maximum id length in bytes (1 KiB).
pub const MAX_ID_LENGTH: usize = 1024;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Size of a length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
///
/// Every malformation is a hard error: the bus treats any decode failure as
/// a protocol violation by the sending peer. Unknown wire codes are rejected,
/// never skipped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Unknown envelope kind wire code.
    #[error("Unknown envelope kind: {0:#04x}")]
    UnknownKind(u8),

    /// Not enough data to decode the envelope.
    #[error("Incomplete envelope: need {0} more bytes")]
    Incomplete(usize),

    /// Id exceeds the maximum length.
    #[error("Id length {0} exceeds maximum {MAX_ID_LENGTH}")]
    IdTooLong(usize),

    /// Payload exceeds the maximum size.
    #[error("Payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    /// Id is not valid UTF-8.
    #[error("Invalid id: {0}")]
    InvalidId(#[from] std::str::Utf8Error),

    /// A payload-carrying kind was encoded without a payload.
    #[error("Envelope kind {0:?} requires a payload")]
    MissingPayload(EnvelopeKind),

    /// A control kind was encoded with a payload.
    #[error("Envelope kind {0:?} must not carry a payload")]
    UnexpectedPayload(EnvelopeKind),

    /// Data remained after a complete envelope was decoded.
    #[error("Trailing bytes after envelope: {0}")]
    TrailingBytes(usize),
}

/// Byte order for the length prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network order, the default.
    #[default]
    Big,
    /// Little-endian, for peers that negotiated it.
    Little,
}

impl ByteOrder {
    fn put_u32(self, buf: &mut BytesMut, value: u32) {
        match self {
            ByteOrder::Big => buf.put_u32(value),
            ByteOrder::Little => buf.put_u32_le(value),
        }
    }

    fn read_u32(self, bytes: [u8; LENGTH_PREFIX_SIZE]) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }
}

/// Encode an envelope using network byte order.
///
/// # Errors
///
/// Returns an error if the envelope violates the payload invariant or
/// exceeds size limits.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    EnvelopeCodec::default().encode(envelope)
}

/// Decode an envelope using network byte order.
///
/// # Errors
///
/// Returns an error if the data is incomplete, malformed, or carries an
/// unknown kind.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    EnvelopeCodec::default().decode(data)
}

/// Codec for bus envelopes with a configurable byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    byte_order: ByteOrder,
}

impl EnvelopeCodec {
    /// Create a codec using network byte order.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with an explicit byte order.
    #[must_use]
    pub fn with_byte_order(byte_order: ByteOrder) -> Self {
        Self { byte_order }
    }

    /// Get the codec's byte order.
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Encode an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope violates the payload invariant or
    /// exceeds size limits.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let id = envelope.id.as_bytes();
        if id.len() > MAX_ID_LENGTH {
            return Err(ProtocolError::IdTooLong(id.len()));
        }

        let payload = match (&envelope.payload, envelope.kind.carries_payload()) {
            (Some(payload), true) => {
                if payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(ProtocolError::PayloadTooLarge(payload.len()));
                }
                Some(payload)
            }
            (None, false) => None,
            (None, true) => return Err(ProtocolError::MissingPayload(envelope.kind)),
            (Some(_), false) => return Err(ProtocolError::UnexpectedPayload(envelope.kind)),
        };

        let capacity = 1
            + LENGTH_PREFIX_SIZE
            + id.len()
            + payload.map_or(0, |p| LENGTH_PREFIX_SIZE + p.len());
        let mut buf = BytesMut::with_capacity(capacity);

        buf.put_u8(envelope.kind.into());
        self.byte_order.put_u32(&mut buf, id.len() as u32);
        buf.extend_from_slice(id);

        if let Some(payload) = payload {
            self.byte_order.put_u32(&mut buf, payload.len() as u32);
            buf.extend_from_slice(payload);
        }

        Ok(buf.freeze())
    }

    /// Decode an envelope.
    ///
    /// The whole input must be exactly one envelope; trailing bytes are a
    /// protocol error.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is incomplete, malformed, or carries an
    /// unknown kind.
    pub fn decode(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::Incomplete(1));
        }

        let kind = EnvelopeKind::try_from(data[0]).map_err(ProtocolError::UnknownKind)?;
        let mut offset = 1;

        let id_len = self.read_length(data, offset)?;
        offset += LENGTH_PREFIX_SIZE;
        if id_len > MAX_ID_LENGTH {
            return Err(ProtocolError::IdTooLong(id_len));
        }
        let id_bytes = Self::take(data, offset, id_len)?;
        let id = std::str::from_utf8(id_bytes)?.to_string();
        offset += id_len;

        let payload = if kind.carries_payload() {
            let payload_len = self.read_length(data, offset)?;
            offset += LENGTH_PREFIX_SIZE;
            if payload_len > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::PayloadTooLarge(payload_len));
            }
            let payload = Self::take(data, offset, payload_len)?;
            offset += payload_len;
            Some(Bytes::copy_from_slice(payload))
        } else {
            None
        };

        if offset < data.len() {
            return Err(ProtocolError::TrailingBytes(data.len() - offset));
        }

        Ok(Envelope { kind, id, payload })
    }

    fn read_length(&self, data: &[u8], offset: usize) -> Result<usize, ProtocolError> {
        let bytes = Self::take(data, offset, LENGTH_PREFIX_SIZE)?;
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(bytes);
        Ok(self.byte_order.read_u32(prefix) as usize)
    }

    fn take(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ProtocolError> {
        let end = offset + len;
        if data.len() < end {
            return Err(ProtocolError::Incomplete(end - data.len()));
        }
        Ok(&data[offset..end])
    }
}
