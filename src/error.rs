//! Error types for gateway operations.

use std::io;
use thiserror::Error;

use crate::isotp::{FlowStatus, FrameKind};

/// Errors that can occur while bridging DoIP and ISO-TP.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// I/O error on the TCP or CAN socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid DoIP header.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Inverse version byte is not the one's complement of the version.
    #[error("Invalid inverse protocol version: version 0x{version:02X}, inverse 0x{inverse:02X}")]
    InvalidInverseVersion { version: u8, inverse: u8 },

    /// Malformed DoIP payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Buffer too short to contain the expected structure.
    #[error("Message too short: expected at least {expected} bytes, got {actual}")]
    MessageTooShort { expected: usize, actual: usize },

    /// Payload too large.
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Empty payload where at least one byte is required.
    #[error("Empty payload")]
    EmptyPayload,

    /// CAN identifier outside the 11-bit standard range.
    #[error("Invalid CAN identifier: 0x{0:X}")]
    InvalidCanId(u32),

    /// CAN frame data longer than 8 bytes.
    #[error("Invalid CAN frame length: {0}")]
    InvalidFrameLength(usize),

    /// Frame does not carry a usable ISO-TP PCI.
    #[error("Invalid ISO-TP frame: {0}")]
    InvalidFrame(String),

    /// A frame of the wrong kind arrived.
    #[error("Unexpected {actual:?} frame, expected {expected:?}")]
    UnexpectedFrame { expected: FrameKind, actual: FrameKind },

    /// Consecutive frame out of order.
    #[error("Sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    /// Single frame length nibble outside 1..=7.
    #[error("Invalid single frame length: {0}")]
    InvalidSingleFrameLength(u8),

    /// First frame declares a length that needs no segmentation.
    #[error("Invalid first frame length: {0}")]
    InvalidFirstFrameLength(usize),

    /// Receiver answered with overflow or a reserved flow status.
    #[error("Flow control aborted transfer: {0:?}")]
    FlowControlAborted(FlowStatus),

    /// No flow control frame arrived in time.
    #[error("Flow control timed out after {0:?}")]
    FlowControlTimeout(std::time::Duration),

    /// The flow control relay was closed by session teardown.
    #[error("Flow control relay closed")]
    RelayClosed,

    /// Connection closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a new invalid header error.
    pub fn invalid_header(msg: impl Into<String>) -> Self {
        Self::InvalidHeader(msg.into())
    }

    /// Create a new invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is transient: the same read may simply be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            )
        )
    }

    /// Check if this error only invalidates the message in progress.
    ///
    /// Framing errors drop the current message; the session keeps running.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::InvalidHeader(_)
                | Self::InvalidInverseVersion { .. }
                | Self::InvalidPayload(_)
                | Self::MessageTooShort { .. }
                | Self::PayloadTooLarge { .. }
                | Self::InvalidFrame(_)
                | Self::UnexpectedFrame { .. }
                | Self::SequenceMismatch { .. }
                | Self::InvalidSingleFrameLength(_)
                | Self::InvalidFirstFrameLength(_)
        )
    }

    /// Check if this error means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
