//! DoIP message handling.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{GatewayError, Result};
use crate::header::{DoipHeader, LogicalAddress, HEADER_SIZE};
use crate::types::{ActivationCode, NackCode, PayloadType, ACK_CODE_OK};

/// Size of the (source, target) address prefix of diagnostic payloads.
pub const ADDRESS_PREFIX_SIZE: usize = 4;

/// A complete DoIP message (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoipMessage {
    /// Message header.
    pub header: DoipHeader,
    /// Message payload.
    pub payload: Bytes,
}

impl DoipMessage {
    /// Create a new message; the header length is taken from the payload.
    pub fn new(mut header: DoipHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        header.payload_length = payload.len() as u32;
        Self { header, payload }
    }

    /// Create a message of the given type with the default protocol version.
    pub fn with_payload(payload_type: PayloadType, payload: impl Into<Bytes>) -> Self {
        Self::new(DoipHeader::new(payload_type, 0), payload)
    }

    /// Routing activation response (0x0006).
    ///
    /// Payload: tester address, entity address, response code, 4 reserved bytes.
    pub fn routing_activation_response(
        tester: LogicalAddress,
        entity: LogicalAddress,
        code: ActivationCode,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u16(tester.0);
        buf.put_u16(entity.0);
        buf.put_u8(code as u8);
        buf.put_u32(0);
        Self::with_payload(PayloadType::RoutingActivationResponse, buf.freeze())
    }

    /// Diagnostic message positive acknowledge (0x8002).
    pub fn diagnostic_ack(source: LogicalAddress, target: LogicalAddress) -> Self {
        Self::with_payload(
            PayloadType::DiagnosticMessageAck,
            ack_payload(source, target, ACK_CODE_OK),
        )
    }

    /// Diagnostic message negative acknowledge (0x8003).
    pub fn diagnostic_nack(source: LogicalAddress, target: LogicalAddress, code: NackCode) -> Self {
        Self::with_payload(
            PayloadType::DiagnosticMessageNack,
            ack_payload(source, target, code as u8),
        )
    }

    /// Diagnostic message (0x8001) carrying UDS bytes.
    pub fn diagnostic(source: LogicalAddress, target: LogicalAddress, user_data: &[u8]) -> Self {
        let message = DiagnosticMessage {
            source,
            target,
            user_data: Bytes::copy_from_slice(user_data),
        };
        Self::with_payload(PayloadType::DiagnosticMessage, message.to_payload())
    }

    /// Override the protocol version (and its inverse).
    pub fn version(mut self, version: u8) -> Self {
        self.header.protocol_version = version;
        self.header.inverse_version = !version;
        self
    }

    /// Get the payload type.
    pub fn payload_type(&self) -> PayloadType {
        self.header.payload_type
    }

    /// Parse a message from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = DoipHeader::from_bytes(data)?;
        let expected_total = HEADER_SIZE + header.payload_length as usize;

        if data.len() < expected_total {
            return Err(GatewayError::MessageTooShort {
                expected: expected_total,
                actual: data.len(),
            });
        }

        let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..expected_total]);
        Ok(Self { header, payload })
    }

    /// Serialize the message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Get the total message size (header + payload).
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

fn ack_payload(source: LogicalAddress, target: LogicalAddress, code: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u16(source.0);
    buf.put_u16(target.0);
    buf.put_u8(code);
    buf.freeze()
}

/// Payload of a diagnostic message: addresses followed by opaque UDS bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    /// Source logical address.
    pub source: LogicalAddress,
    /// Target logical address.
    pub target: LogicalAddress,
    /// UDS bytes.
    pub user_data: Bytes,
}

impl DiagnosticMessage {
    /// Split a 0x8001 payload into its address prefix and UDS bytes.
    pub fn from_payload(payload: &Bytes) -> Result<Self> {
        if payload.len() < ADDRESS_PREFIX_SIZE {
            return Err(GatewayError::MessageTooShort {
                expected: ADDRESS_PREFIX_SIZE,
                actual: payload.len(),
            });
        }

        Ok(Self {
            source: LogicalAddress::from_be_slice(&payload[0..2])?,
            target: LogicalAddress::from_be_slice(&payload[2..4])?,
            user_data: payload.slice(ADDRESS_PREFIX_SIZE..),
        })
    }

    /// Serialize to a 0x8001 payload.
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ADDRESS_PREFIX_SIZE + self.user_data.len());
        buf.put_u16(self.source.0);
        buf.put_u16(self.target.0);
        buf.put_slice(&self.user_data);
        buf.freeze()
    }
}

/// Routing activation request (0x0005).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingActivationRequest {
    /// Tester source address.
    pub source: LogicalAddress,
    /// Requested activation type.
    pub activation_type: u8,
}

impl RoutingActivationRequest {
    /// Parse a 0x0005 payload (at least source address and activation type).
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < 3 {
            return Err(GatewayError::MessageTooShort {
                expected: 3,
                actual: payload.len(),
            });
        }
        Ok(Self {
            source: LogicalAddress::from_be_slice(payload)?,
            activation_type: payload[2],
        })
    }

    /// Serialize with zeroed reserved bytes.
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(7);
        buf.put_u16(self.source.0);
        buf.put_u8(self.activation_type);
        buf.put_u32(0);
        buf.freeze()
    }
}
