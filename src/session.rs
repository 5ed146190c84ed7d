//! Per-connection DoIP session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::forwarder::Forwarder;
use crate::isotp::IsoTpSender;
use crate::message::{DiagnosticMessage, DoipMessage, RoutingActivationRequest};
use crate::relay::FlowControlRelay;
use crate::transport::{CanBus, DoipConnection};
use crate::types::{ActivationCode, NackCode, PayloadType};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connection accepted, no routing activation yet.
    Connected,
    /// Routing activated.
    Activated,
    /// At least one diagnostic exchange handled.
    Active,
    /// Session ended.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Activated => "activated",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One tester connection bridged to the bus.
///
/// The session thread reads DoIP messages and sends requests over ISO-TP.
/// A [`Forwarder`] thread reads the bus and writes ECU responses back through
/// the same connection.
pub struct Session<B: CanBus + ?Sized> {
    connection: DoipConnection,
    bus: Arc<B>,
    relay: Arc<FlowControlRelay>,
    active: Arc<AtomicBool>,
    state: SessionState,
    config: GatewayConfig,
}

impl<B: CanBus + ?Sized + 'static> Session<B> {
    /// Create a session for an accepted connection.
    pub fn new(connection: DoipConnection, bus: Arc<B>, config: GatewayConfig) -> Self {
        let connection = connection.with_max_payload(config.session.max_payload_len);
        Self {
            connection,
            bus,
            relay: Arc::new(FlowControlRelay::new(config.isotp.relay_capacity)),
            active: Arc::new(AtomicBool::new(true)),
            state: SessionState::Connected,
            config,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// Serve the connection until the tester disconnects or a transport error.
    ///
    /// Both threads are stopped and joined before this returns.
    pub fn run(mut self) -> Result<()> {
        let peer = self.peer_addr();
        tracing::info!(%peer, "session started");

        let forwarder = Forwarder::new(
            &self.config,
            self.bus.clone(),
            self.relay.clone(),
            self.connection.writer(),
            self.active.clone(),
        )
        .spawn()?;

        let result = self.serve();

        self.state = SessionState::Closed;
        self.active.store(false, Ordering::Release);
        self.relay.close();
        if let Err(e) = self.connection.shutdown() {
            tracing::debug!(%peer, error = %e, "shutdown");
        }
        if forwarder.join().is_err() {
            tracing::error!(%peer, "forwarder thread panicked");
        }

        match &result {
            Ok(()) => tracing::info!(%peer, "session closed"),
            Err(e) => tracing::error!(%peer, error = %e, "session ended with error"),
        }
        result
    }

    fn serve(&mut self) -> Result<()> {
        while self.active.load(Ordering::Acquire) {
            let message = match self.connection.read_message() {
                Ok(message) => message,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) if e.is_framing() => {
                    tracing::warn!(error = %e, "dropping malformed DoIP message");
                    continue;
                }
                // The forwarder shut the stream down after its own failure.
                Err(_) if !self.active.load(Ordering::Acquire) => return Ok(()),
                Err(e) => return Err(e),
            };

            self.handle(message)?;
        }
        Ok(())
    }

    /// Dispatch one message. Only transport errors are returned.
    fn handle(&mut self, message: DoipMessage) -> Result<()> {
        match message.payload_type() {
            PayloadType::RoutingActivationRequest => self.activate_routing(&message),
            PayloadType::DiagnosticMessage => self.forward_request(&message),
            // Acknowledgements flow from the gateway to the tester only.
            other if other.is_diagnostic() => {
                tracing::warn!(payload_type = %other, "unexpected diagnostic acknowledgement from tester");
                Ok(())
            }
            other => {
                tracing::debug!(payload_type = %other, "ignoring payload type");
                Ok(())
            }
        }
    }

    fn activate_routing(&mut self, message: &DoipMessage) -> Result<()> {
        let tester = self.config.addressing.tester;
        match RoutingActivationRequest::from_payload(&message.payload) {
            Ok(request) if request.source != tester => tracing::warn!(
                source = %request.source,
                configured = %tester,
                "routing activation from unexpected tester address"
            ),
            Ok(request) => tracing::debug!(activation_type = request.activation_type, "routing activation"),
            Err(e) => tracing::warn!(error = %e, "short routing activation request"),
        }

        self.reply(DoipMessage::routing_activation_response(
            tester,
            self.config.addressing.ecu,
            ActivationCode::Success,
        ))?;

        if self.state == SessionState::Connected {
            self.state = SessionState::Activated;
        }
        tracing::info!(peer = %self.peer_addr(), "routing activated");
        Ok(())
    }

    fn forward_request(&mut self, message: &DoipMessage) -> Result<()> {
        let request = match DiagnosticMessage::from_payload(&message.payload) {
            Ok(request) if request.user_data.is_empty() => {
                tracing::warn!("diagnostic message without UDS data");
                return Ok(());
            }
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "dropping diagnostic message");
                return Ok(());
            }
        };

        if self.state == SessionState::Connected {
            tracing::warn!("diagnostic message before routing activation");
        }

        let tester = self.config.addressing.tester;
        let ecu = self.config.addressing.ecu;
        self.reply(DoipMessage::diagnostic_ack(ecu, tester))?;

        let sender = IsoTpSender::new(self.bus.as_ref(), &self.relay, self.config.isotp);
        match sender.send(self.config.can.request_id, &request.user_data) {
            Ok(()) => {
                tracing::debug!(len = request.user_data.len(), "request sent to ECU");
                self.state = SessionState::Active;
                Ok(())
            }
            Err(GatewayError::RelayClosed) => {
                tracing::debug!("send interrupted by session shutdown");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, len = request.user_data.len(), "request not delivered");
                if self.config.session.nack_on_send_failure {
                    self.reply(DoipMessage::diagnostic_nack(
                        ecu,
                        tester,
                        NackCode::TransportProtocolError,
                    ))?;
                }
                Ok(())
            }
        }
    }

    fn reply(&self, message: DoipMessage) -> Result<()> {
        self.connection
            .write_message(&message.version(self.config.protocol_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsoTpConfig;
    use crate::header::{DoipHeader, LogicalAddress};
    use crate::isotp::{single_frame, FlowControl};
    use crate::transport::{BusFrame, DoipClient, DoipListener, MockBus};
    use std::io::Write;
    use std::net::TcpStream;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const TESTER: LogicalAddress = LogicalAddress(0x0E00);
    const ECU: LogicalAddress = LogicalAddress(0x1000);

    fn test_config() -> GatewayConfig {
        GatewayConfig::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_isotp(IsoTpConfig::default().with_fc_timeout(Duration::from_millis(100)))
    }

    fn start(config: GatewayConfig, bus: Arc<MockBus>) -> (std::net::SocketAddr, JoinHandle<Result<()>>) {
        let listener = DoipListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();
        let handle = thread::spawn(move || {
            let connection = listener.accept()?;
            Session::new(connection, bus, config).run()
        });
        (addr, handle)
    }

    fn connect(addr: std::net::SocketAddr) -> DoipClient {
        let client = DoipClient::connect(addr, TESTER).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client
    }

    #[test]
    fn test_routing_activation_response_bytes() {
        let (addr, handle) = start(test_config(), Arc::new(MockBus::new()));
        let mut client = connect(addr);

        assert_eq!(client.activate_routing(0x00).unwrap(), ActivationCode::Success);
        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_routing_activation_wire_format() {
        let (addr, handle) = start(test_config(), Arc::new(MockBus::new()));
        let mut client = connect(addr);

        let request = RoutingActivationRequest {
            source: TESTER,
            activation_type: 0,
        };
        client
            .send_raw(&DoipMessage::with_payload(
                PayloadType::RoutingActivationRequest,
                request.to_payload(),
            ))
            .unwrap();

        let response = client.receive().unwrap();
        assert_eq!(
            response.to_bytes(),
            vec![
                0x02, 0xFD, 0x00, 0x06, 0x00, 0x00, 0x00, 0x09, 0x0E, 0x00, 0x10, 0x00, 0x10, 0x00,
                0x00, 0x00, 0x00
            ]
        );
        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_diagnostic_request_acked_then_sent() {
        let bus = Arc::new(MockBus::new());
        let (addr, handle) = start(test_config(), bus.clone());
        let mut client = connect(addr);

        client.activate_routing(0).unwrap();
        client.send_diagnostic(ECU, &[0x22, 0xF1, 0x90]).unwrap();

        let ack = client.receive().unwrap();
        assert_eq!(ack.payload_type(), PayloadType::DiagnosticMessageAck);
        assert_eq!(ack.payload.as_ref(), &[0x10, 0x00, 0x0E, 0x00, 0x00]);

        let written = bus.wait_for_written(1, Duration::from_secs(1));
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].id(), 0x7E0);
        assert_eq!(written[0].data(), &[0x03, 0x22, 0xF1, 0x90, 0, 0, 0, 0]);

        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_request_response_round_trip() {
        let bus = Arc::new(MockBus::new());
        bus.set_responder(|frame: &BusFrame| match frame.data() {
            [0x03, 0x22, 0xF1, 0x90, ..] => {
                vec![single_frame(0x7E8, &[0xF1, 0x90, 0x57], 0).unwrap()]
            }
            _ => Vec::new(),
        });
        let (addr, handle) = start(test_config(), bus);
        let mut client = connect(addr);

        client.activate_routing(0).unwrap();
        client.send_diagnostic(ECU, &[0x22, 0xF1, 0x90]).unwrap();
        let response = client.receive_diagnostic().unwrap();

        assert_eq!(response.source, ECU);
        assert_eq!(response.target, TESTER);
        assert_eq!(response.user_data.as_ref(), &[0x62, 0xF1, 0x90, 0x57]);

        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_multi_frame_request_with_ecu_flow_control() {
        let bus = Arc::new(MockBus::new());
        bus.set_responder(|frame: &BusFrame| {
            if frame.data()[0] & 0xF0 == 0x10 {
                vec![FlowControl::continue_to_send(0, 0).to_frame(0x7E8, 0).unwrap()]
            } else {
                Vec::new()
            }
        });
        let (addr, handle) = start(test_config(), bus.clone());
        let mut client = connect(addr);
        let request: Vec<u8> = std::iter::once(0x2E).chain(0..20).collect();

        client.activate_routing(0).unwrap();
        client.send_diagnostic(ECU, &request).unwrap();
        assert_eq!(
            client.receive().unwrap().payload_type(),
            PayloadType::DiagnosticMessageAck
        );

        let written = bus.wait_for_written(4, Duration::from_secs(1));
        assert_eq!(written.len(), 4);
        assert_eq!(&written[0].data()[..2], &[0x10, 21]);
        assert_eq!(written[3].data()[0], 0x23);

        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_send_failure_reported_as_nack() {
        let bus = Arc::new(MockBus::new());
        let (addr, handle) = start(test_config(), bus.clone());
        let mut client = connect(addr);

        client.activate_routing(0).unwrap();
        client.send_diagnostic(ECU, &[0x2E; 20]).unwrap();

        assert_eq!(
            client.receive().unwrap().payload_type(),
            PayloadType::DiagnosticMessageAck
        );
        let nack = client.receive().unwrap();
        assert_eq!(nack.payload_type(), PayloadType::DiagnosticMessageNack);
        assert_eq!(nack.payload.as_ref(), &[0x10, 0x00, 0x0E, 0x00, 0x08]);
        assert_eq!(bus.written().len(), 1);

        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_send_failure_silent_when_disabled() {
        let bus = Arc::new(MockBus::new());
        let config = test_config().with_nack_on_send_failure(false);
        let (addr, handle) = start(config, bus);
        let mut client = connect(addr);
        client
            .set_read_timeout(Some(Duration::from_millis(400)))
            .unwrap();

        client.send_diagnostic(ECU, &[0x2E; 20]).unwrap();
        assert_eq!(
            client.receive().unwrap().payload_type(),
            PayloadType::DiagnosticMessageAck
        );
        assert!(client.receive().is_err());

        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_unknown_and_malformed_messages_skipped() {
        let bus = Arc::new(MockBus::new());
        let (addr, handle) = start(test_config(), bus.clone());
        let mut client = connect(addr);

        // Alive check response: ignored.
        client
            .send_raw(&DoipMessage::with_payload(PayloadType::AliveCheckResponse, vec![0x0E, 0x00]))
            .unwrap();
        // Bad inverse version: payload skipped.
        let mut bad = DoipMessage::diagnostic(TESTER, ECU, &[0x10, 0x01]);
        bad.header = DoipHeader {
            inverse_version: 0x00,
            ..bad.header
        };
        client.send_raw(&bad).unwrap();
        // Address prefix only: no ack.
        client
            .send_raw(&DoipMessage::with_payload(
                PayloadType::DiagnosticMessage,
                vec![0x0E, 0x00, 0x10, 0x00],
            ))
            .unwrap();

        client.send_diagnostic(ECU, &[0x3E, 0x00]).unwrap();
        let ack = client.receive().unwrap();
        assert_eq!(ack.payload_type(), PayloadType::DiagnosticMessageAck);

        let written = bus.wait_for_written(1, Duration::from_secs(1));
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0].data()[..3], &[0x02, 0x3E, 0x00]);

        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_acknowledgement_from_tester_ignored() {
        let bus = Arc::new(MockBus::new());
        let (addr, handle) = start(test_config(), bus.clone());
        let mut client = connect(addr);

        client.send_raw(&DoipMessage::diagnostic_ack(TESTER, ECU)).unwrap();
        client
            .send_raw(&DoipMessage::diagnostic_nack(
                TESTER,
                ECU,
                NackCode::TargetUnreachable,
            ))
            .unwrap();

        // No reply to either; the next response is the routing activation.
        assert_eq!(client.activate_routing(0).unwrap(), ActivationCode::Success);
        assert!(bus.written().is_empty());

        client.close().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_disconnect_mid_header_closes_session() {
        let bus = Arc::new(MockBus::new());
        let (addr, handle) = start(test_config(), bus.clone());
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&[0x02, 0xFD, 0x80]).unwrap();
        drop(stream);

        handle.join().unwrap().unwrap();
        assert!(bus.written().is_empty());
    }
}
