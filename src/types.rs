//! Core DoIP types and constants.

/// DoIP protocol version used by this gateway (ISO 13400-2:2012).
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Default TCP port for DoIP.
pub const DEFAULT_PORT: u16 = 13400;

/// UDS positive response marker for ReadDataByIdentifier.
pub const RDBI_POSITIVE_RESPONSE: u8 = 0x62;

/// DoIP payload types.
///
/// Values not known to this gateway are kept as [`PayloadType::Unknown`]
/// so the session can skip them without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    /// Generic DoIP header negative acknowledge.
    GenericNack,
    /// Vehicle identification request.
    VehicleIdentificationRequest,
    /// Vehicle announcement / identification response.
    VehicleAnnouncement,
    /// Routing activation request.
    RoutingActivationRequest,
    /// Routing activation response.
    RoutingActivationResponse,
    /// Alive check request.
    AliveCheckRequest,
    /// Alive check response.
    AliveCheckResponse,
    /// Diagnostic message carrying UDS bytes.
    DiagnosticMessage,
    /// Diagnostic message positive acknowledge.
    DiagnosticMessageAck,
    /// Diagnostic message negative acknowledge.
    DiagnosticMessageNack,
    /// Any other payload type.
    Unknown(u16),
}

impl PayloadType {
    /// Create a PayloadType from its wire value.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Self::GenericNack,
            0x0001 => Self::VehicleIdentificationRequest,
            0x0004 => Self::VehicleAnnouncement,
            0x0005 => Self::RoutingActivationRequest,
            0x0006 => Self::RoutingActivationResponse,
            0x0007 => Self::AliveCheckRequest,
            0x0008 => Self::AliveCheckResponse,
            0x8001 => Self::DiagnosticMessage,
            0x8002 => Self::DiagnosticMessageAck,
            0x8003 => Self::DiagnosticMessageNack,
            other => Self::Unknown(other),
        }
    }

    /// Get the wire value.
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::GenericNack => 0x0000,
            Self::VehicleIdentificationRequest => 0x0001,
            Self::VehicleAnnouncement => 0x0004,
            Self::RoutingActivationRequest => 0x0005,
            Self::RoutingActivationResponse => 0x0006,
            Self::AliveCheckRequest => 0x0007,
            Self::AliveCheckResponse => 0x0008,
            Self::DiagnosticMessage => 0x8001,
            Self::DiagnosticMessageAck => 0x8002,
            Self::DiagnosticMessageNack => 0x8003,
            Self::Unknown(value) => *value,
        }
    }

    /// Check if this is a diagnostic message type (0x8001..=0x8003).
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            Self::DiagnosticMessage | Self::DiagnosticMessageAck | Self::DiagnosticMessageNack
        )
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.as_u16())
    }
}

/// Routing activation response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActivationCode {
    /// Unknown source address.
    DeniedUnknownSource = 0x00,
    /// All TCP sockets are registered and active.
    DeniedNoSocket = 0x01,
    /// Missing authentication.
    DeniedMissingAuthentication = 0x04,
    /// Unsupported activation type.
    DeniedUnsupportedType = 0x06,
    /// Routing successfully activated.
    Success = 0x10,
    /// Activated, confirmation required.
    ConfirmationRequired = 0x11,
}

impl ActivationCode {
    /// Create an ActivationCode from a raw byte value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::DeniedUnknownSource),
            0x01 => Some(Self::DeniedNoSocket),
            0x04 => Some(Self::DeniedMissingAuthentication),
            0x06 => Some(Self::DeniedUnsupportedType),
            0x10 => Some(Self::Success),
            0x11 => Some(Self::ConfirmationRequired),
            _ => None,
        }
    }

    /// Check if routing was activated.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::ConfirmationRequired)
    }
}

/// Diagnostic message negative acknowledge codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NackCode {
    /// Invalid source address.
    InvalidSourceAddress = 0x02,
    /// Unknown target address.
    UnknownTargetAddress = 0x03,
    /// Diagnostic message too large.
    MessageTooLarge = 0x04,
    /// Out of memory.
    OutOfMemory = 0x05,
    /// Target unreachable.
    TargetUnreachable = 0x06,
    /// Unknown network.
    UnknownNetwork = 0x07,
    /// Transport protocol error on the vehicle side.
    TransportProtocolError = 0x08,
}

impl NackCode {
    /// Create a NackCode from a raw byte value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::InvalidSourceAddress),
            0x03 => Some(Self::UnknownTargetAddress),
            0x04 => Some(Self::MessageTooLarge),
            0x05 => Some(Self::OutOfMemory),
            0x06 => Some(Self::TargetUnreachable),
            0x07 => Some(Self::UnknownNetwork),
            0x08 => Some(Self::TransportProtocolError),
            _ => None,
        }
    }
}

/// Positive acknowledge code for diagnostic messages.
pub const ACK_CODE_OK: u8 = 0x00;
