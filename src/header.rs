//! DoIP generic header and logical address newtype.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::types::{PayloadType, PROTOCOL_VERSION};

/// Size of the DoIP generic header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Logical address of a DoIP entity (tester or ECU).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalAddress(pub u16);

impl LogicalAddress {
    /// Read a big-endian address from the first two bytes of `data`.
    pub fn from_be_slice(data: &[u8]) -> Result<Self> {
        match data {
            [hi, lo, ..] => Ok(Self(u16::from_be_bytes([*hi, *lo]))),
            _ => Err(GatewayError::MessageTooShort {
                expected: 2,
                actual: data.len(),
            }),
        }
    }

    /// Big-endian wire bytes.
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// DoIP generic header (8 bytes).
///
/// ```text
/// +----------+----------+----------+----------+
/// | Version  | ~Version |   Payload Type      |
/// +----------+----------+----------+----------+
/// |           Payload Length (32 bits)        |
/// +----------+----------+----------+----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoipHeader {
    /// Protocol version.
    pub protocol_version: u8,
    /// Bitwise inverse of the protocol version.
    pub inverse_version: u8,
    /// Payload type.
    pub payload_type: PayloadType,
    /// Length of the payload following the header.
    pub payload_length: u32,
}

impl DoipHeader {
    /// Create a header with the default protocol version.
    pub fn new(payload_type: PayloadType, payload_length: u32) -> Self {
        Self::with_version(PROTOCOL_VERSION, payload_type, payload_length)
    }

    /// Create a header with an explicit protocol version.
    pub fn with_version(version: u8, payload_type: PayloadType, payload_length: u32) -> Self {
        Self {
            protocol_version: version,
            inverse_version: !version,
            payload_type,
            payload_length,
        }
    }

    /// Check that the inverse version byte matches the version.
    pub fn is_valid(&self) -> bool {
        self.inverse_version == !self.protocol_version
    }

    /// Fail with [`GatewayError::InvalidInverseVersion`] unless [`is_valid`](Self::is_valid).
    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(GatewayError::InvalidInverseVersion {
                version: self.protocol_version,
                inverse: self.inverse_version,
            })
        }
    }

    /// Parse a header from bytes.
    ///
    /// The inverse version byte is not checked here; call
    /// [`validate`](Self::validate) to reject corrupted headers.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(GatewayError::MessageTooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            protocol_version: data[0],
            inverse_version: data[1],
            payload_type: PayloadType::from_u16(u16::from_be_bytes([data[2], data[3]])),
            payload_length: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    /// Serialize the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.protocol_version;
        buf[1] = self.inverse_version;
        buf[2..4].copy_from_slice(&self.payload_type.as_u16().to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }
}
