//! DoIP to ISO-TP/CAN diagnostic gateway built on std::net.
//!
//! This crate bridges Diagnostics over IP (ISO 13400-2) testers to an ECU on
//! a CAN bus speaking ISO-TP (ISO 15765-2). UDS payloads are carried as
//! opaque bytes in both directions.
//!
//! # Features
//!
//! - DoIP header framing with inverse-version validation
//! - Routing activation and diagnostic message acknowledgement
//! - ISO-TP single and multi-frame send honoring block size and STmin
//! - ISO-TP reassembly of ECU responses with flow control
//! - Pluggable [`CanBus`](transport::CanBus): Linux SocketCAN or in-memory
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use doip_gateway::{Gateway, GatewayConfig};
//! use doip_gateway::transport::MockBus;
//!
//! let config = GatewayConfig::default().with_listen_addr("127.0.0.1:13400".parse().unwrap());
//! let gateway = Gateway::bind(config, |_| Ok(Arc::new(MockBus::new()))).unwrap();
//! gateway.run().unwrap();
//! ```
//!
//! # Threads
//!
//! Each session runs two threads. The session thread reads DoIP messages and
//! segments requests onto the bus; the forwarder thread reads the bus and
//! reassembles responses. Flow control frames seen by the forwarder reach the
//! sender through a [`FlowControlRelay`](relay::FlowControlRelay), and TCP
//! writes from both threads go through one [`DoipWriter`](transport::DoipWriter).
//!
//! ```text
//! tester --TCP--> Session --ISO-TP--> CanBus --> ECU
//! tester <--TCP-- Forwarder <--ISO-TP-- CanBus <-- ECU
//!                      \--FC--> FlowControlRelay --> Session
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod header;
pub mod isotp;
pub mod message;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{CanChannel, GatewayConfig};
pub use error::{GatewayError, Result};
pub use header::{DoipHeader, LogicalAddress, HEADER_SIZE};
pub use message::{DiagnosticMessage, DoipMessage};
pub use server::Gateway;
pub use session::{Session, SessionState};
pub use types::{PayloadType, DEFAULT_PORT, PROTOCOL_VERSION};
