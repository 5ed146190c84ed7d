//! Gateway configuration.
//!
//! Every field has a default matching a typical single-ECU deployment
//! (`can0`, 0x7E0/0x7E8, tester 0x0E00, ECU 0x1000, port 13400), so an
//! empty TOML file is a valid configuration.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::header::LogicalAddress;
use crate::isotp::MAX_MESSAGE_LEN;
use crate::message::ADDRESS_PREFIX_SIZE;
use crate::transport::MAX_STANDARD_ID;
use crate::types::{DEFAULT_PORT, PROTOCOL_VERSION};

/// A request/response identifier pair used by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanChannel {
    /// Identifier for tester -> ECU frames.
    pub request_id: u16,
    /// Identifier for ECU -> tester frames.
    pub response_id: u16,
}

/// CAN bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Interface name.
    pub interface: String,
    /// Identifier for tester -> ECU frames.
    pub request_id: u16,
    /// Identifier for ECU -> tester frames; the only one the receive filter passes.
    pub response_id: u16,
    /// Bus read timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// Identifiers owned by other bus users (the vehicle-control service).
    pub reserved_ids: Vec<u16>,
    /// Extra identifier pairs for concurrent sessions.
    ///
    /// Sessions sharing one pair would all see the same ECU frames, so with
    /// `concurrent_sessions` every tester gets a pair of its own.
    pub session_channels: Vec<CanChannel>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            request_id: 0x7E0,
            response_id: 0x7E8,
            read_timeout_ms: 2000,
            reserved_ids: vec![0x100, 0x101],
            session_channels: Vec::new(),
        }
    }
}

impl CanConfig {
    /// Bus read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// The pair configured by `request_id` and `response_id`.
    pub fn primary_channel(&self) -> CanChannel {
        CanChannel {
            request_id: self.request_id,
            response_id: self.response_id,
        }
    }

    /// Every pair a session may use, primary first.
    pub fn channels(&self) -> Vec<CanChannel> {
        std::iter::once(self.primary_channel())
            .chain(self.session_channels.iter().copied())
            .collect()
    }
}

/// Logical addresses of the two diagnostic roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressingConfig {
    /// Tester (client) address.
    pub tester: LogicalAddress,
    /// ECU (server) address.
    pub ecu: LogicalAddress,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            tester: LogicalAddress(0x0E00),
            ecu: LogicalAddress(0x1000),
        }
    }
}

/// ISO-TP timing and flow control parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoTpConfig {
    /// How long the sender waits for a flow control frame, in milliseconds.
    pub fc_timeout_ms: u64,
    /// Pause after a flow control Wait, in milliseconds.
    pub wait_backoff_ms: u64,
    /// Block size advertised in our own flow control frames.
    pub rx_block_size: u8,
    /// Raw STmin byte advertised in our own flow control frames.
    pub rx_st_min: u8,
    /// Filler for unused data bytes.
    pub padding: u8,
    /// Flow control frames buffered in the relay.
    pub relay_capacity: usize,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            fc_timeout_ms: 2000,
            wait_backoff_ms: 100,
            rx_block_size: 0,
            rx_st_min: 0x0A,
            padding: 0x00,
            relay_capacity: 8,
        }
    }
}

impl IsoTpConfig {
    /// Flow control wait timeout.
    pub fn fc_timeout(&self) -> Duration {
        Duration::from_millis(self.fc_timeout_ms)
    }

    /// Backoff after a Wait flow status.
    pub fn wait_backoff(&self) -> Duration {
        Duration::from_millis(self.wait_backoff_ms)
    }

    /// Set the flow control timeout.
    pub fn with_fc_timeout(mut self, timeout: Duration) -> Self {
        self.fc_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the Wait backoff.
    pub fn with_wait_backoff(mut self, backoff: Duration) -> Self {
        self.wait_backoff_ms = backoff.as_millis() as u64;
        self
    }
}

/// Per-session behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest DoIP payload accepted; bigger ones are skipped.
    pub max_payload_len: usize,
    /// Report failed bus sends to the tester with a diagnostic NACK.
    pub nack_on_send_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload_len: ADDRESS_PREFIX_SIZE + MAX_MESSAGE_LEN,
            nack_on_send_failure: true,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// TCP listen address.
    pub listen_addr: SocketAddr,
    /// DoIP protocol version written in outgoing headers.
    pub protocol_version: u8,
    /// Serve several testers at once instead of one at a time.
    pub concurrent_sessions: bool,
    /// CAN bus settings.
    pub can: CanConfig,
    /// Logical addresses.
    pub addressing: AddressingConfig,
    /// ISO-TP parameters.
    pub isotp: IsoTpConfig,
    /// Session behavior.
    pub session: SessionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            protocol_version: PROTOCOL_VERSION,
            concurrent_sessions: false,
            can: CanConfig::default(),
            addressing: AddressingConfig::default(),
            isotp: IsoTpConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| GatewayError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GatewayError::config(e.to_string()))
    }

    /// Check invariants the gateway relies on.
    pub fn validate(&self) -> Result<()> {
        let can = &self.can;
        let mut seen = HashSet::new();
        for channel in can.channels() {
            for (name, id) in [("request_id", channel.request_id), ("response_id", channel.response_id)] {
                if id > MAX_STANDARD_ID {
                    return Err(GatewayError::config(format!(
                        "can.{name} 0x{id:X} is not an 11-bit identifier"
                    )));
                }
                if can.reserved_ids.contains(&id) {
                    return Err(GatewayError::config(format!(
                        "can.{name} 0x{id:03X} collides with a reserved identifier"
                    )));
                }
                if !seen.insert(id) {
                    return Err(GatewayError::config(format!(
                        "CAN identifier 0x{id:03X} is used more than once"
                    )));
                }
            }
        }
        if self.concurrent_sessions && can.session_channels.is_empty() {
            return Err(GatewayError::config(
                "concurrent_sessions needs can.session_channels so each tester has its own identifiers",
            ));
        }
        if can.interface.is_empty() {
            return Err(GatewayError::config("can.interface must not be empty"));
        }
        if can.read_timeout_ms == 0 || self.isotp.fc_timeout_ms == 0 {
            return Err(GatewayError::config("timeouts must be non-zero"));
        }
        if self.isotp.relay_capacity == 0 {
            return Err(GatewayError::config("isotp.relay_capacity must be at least 1"));
        }
        if self.addressing.tester == self.addressing.ecu {
            return Err(GatewayError::config(
                "addressing.tester and addressing.ecu must differ",
            ));
        }
        if self.session.max_payload_len < ADDRESS_PREFIX_SIZE {
            return Err(GatewayError::config(format!(
                "session.max_payload_len must be at least {ADDRESS_PREFIX_SIZE}"
            )));
        }
        Ok(())
    }

    /// Set the listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the CAN interface name.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.can.interface = interface.into();
        self
    }

    /// Set the request and response identifiers.
    pub fn with_can_ids(mut self, request_id: u16, response_id: u16) -> Self {
        self.can.request_id = request_id;
        self.can.response_id = response_id;
        self
    }

    /// Set the extra identifier pairs for concurrent sessions.
    pub fn with_session_channels(mut self, channels: Vec<CanChannel>) -> Self {
        self.can.session_channels = channels;
        self
    }

    /// Set the bus read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.can.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the tester and ECU logical addresses.
    pub fn with_addresses(mut self, tester: LogicalAddress, ecu: LogicalAddress) -> Self {
        self.addressing = AddressingConfig { tester, ecu };
        self
    }

    /// Set the ISO-TP parameters.
    pub fn with_isotp(mut self, isotp: IsoTpConfig) -> Self {
        self.isotp = isotp;
        self
    }

    /// Enable or disable NACKs for failed bus sends.
    pub fn with_nack_on_send_failure(mut self, enabled: bool) -> Self {
        self.session.nack_on_send_failure = enabled;
        self
    }

    /// Serve connections concurrently.
    pub fn with_concurrent_sessions(mut self, enabled: bool) -> Self {
        self.concurrent_sessions = enabled;
        self
    }
}
