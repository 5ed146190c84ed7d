//! TCP transport for DoIP.

use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{read_message, write_message};
use crate::error::{GatewayError, Result};
use crate::header::LogicalAddress;
use crate::message::{DiagnosticMessage, DoipMessage, RoutingActivationRequest, ADDRESS_PREFIX_SIZE};
use crate::isotp::MAX_MESSAGE_LEN;
use crate::types::{ActivationCode, NackCode, PayloadType};

/// Largest DoIP payload accepted by default: addresses plus one ISO-TP message.
pub const DEFAULT_MAX_PAYLOAD: usize = ADDRESS_PREFIX_SIZE + MAX_MESSAGE_LEN;

/// Write half of a DoIP connection.
///
/// Clones share one lock, so whole messages from different threads never
/// interleave on the wire.
#[derive(Debug, Clone)]
pub struct DoipWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl DoipWriter {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Write one complete message.
    pub fn write_message(&self, message: &DoipMessage) -> Result<()> {
        let mut stream = self.stream.lock();
        write_message(&mut *stream, message)
    }

    /// Shut down both directions, waking any blocked reader.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.lock().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// A TCP connection with DoIP framing.
#[derive(Debug)]
pub struct DoipConnection {
    reader: BufReader<TcpStream>,
    writer: DoipWriter,
    peer_addr: SocketAddr,
    max_payload: usize,
}

impl DoipConnection {
    /// Create a new connection from a TcpStream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: DoipWriter::new(stream),
            peer_addr,
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
    }

    /// Limit the payload size accepted by [`read_message`](Self::read_message).
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Set read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)
    }

    /// Read the next DoIP message.
    pub fn read_message(&mut self) -> Result<DoipMessage> {
        read_message(&mut self.reader, self.max_payload)
    }

    /// Write a DoIP message.
    pub fn write_message(&self, message: &DoipMessage) -> Result<()> {
        self.writer.write_message(message)
    }

    /// A writer handle that can be moved to another thread.
    pub fn writer(&self) -> DoipWriter {
        self.writer.clone()
    }

    /// Shutdown the connection.
    pub fn shutdown(&self) -> io::Result<()> {
        self.writer.shutdown()
    }
}

/// Listening socket for tester connections.
#[derive(Debug)]
pub struct DoipListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl DoipListener {
    /// Bind to an address and start listening.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept a new connection.
    pub fn accept(&self) -> Result<DoipConnection> {
        let (stream, _) = self.listener.accept()?;
        Ok(DoipConnection::new(stream)?)
    }
}

/// Minimal tester-side client.
///
/// Used by the demo binary and the end-to-end tests.
#[derive(Debug)]
pub struct DoipClient {
    connection: DoipConnection,
    tester: LogicalAddress,
}

impl DoipClient {
    /// Connect to a gateway.
    pub fn connect<A: ToSocketAddrs>(addr: A, tester: LogicalAddress) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            connection: DoipConnection::new(stream)?,
            tester,
        })
    }

    /// Set read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.connection.set_read_timeout(timeout)
    }

    /// Request routing activation and return the gateway's response code.
    pub fn activate_routing(&mut self, activation_type: u8) -> Result<ActivationCode> {
        let request = RoutingActivationRequest {
            source: self.tester,
            activation_type,
        };
        self.connection.write_message(&DoipMessage::with_payload(
            PayloadType::RoutingActivationRequest,
            request.to_payload(),
        ))?;

        let response = self.receive()?;
        if response.payload_type() != PayloadType::RoutingActivationResponse {
            return Err(GatewayError::invalid_payload(format!(
                "expected routing activation response, got {}",
                response.payload_type()
            )));
        }
        let code = *response
            .payload
            .get(4)
            .ok_or(GatewayError::MessageTooShort {
                expected: 5,
                actual: response.payload.len(),
            })?;
        ActivationCode::from_u8(code)
            .ok_or_else(|| GatewayError::invalid_payload(format!("unknown activation code 0x{code:02X}")))
    }

    /// Send UDS bytes to `target`.
    pub fn send_diagnostic(&self, target: LogicalAddress, uds: &[u8]) -> Result<()> {
        self.connection
            .write_message(&DoipMessage::diagnostic(self.tester, target, uds))
    }

    /// Wait for the next diagnostic message and return its payload.
    ///
    /// Acknowledgements are skipped; a negative acknowledgement is an error.
    pub fn receive_diagnostic(&mut self) -> Result<DiagnosticMessage> {
        loop {
            let message = self.receive()?;
            match message.payload_type() {
                PayloadType::DiagnosticMessage => {
                    return DiagnosticMessage::from_payload(&message.payload)
                }
                PayloadType::DiagnosticMessageAck => continue,
                PayloadType::DiagnosticMessageNack => {
                    let reason = match message.payload.get(ADDRESS_PREFIX_SIZE) {
                        Some(&code) => match NackCode::from_u8(code) {
                            Some(nack) => format!("{nack:?}"),
                            None => format!("code 0x{code:02X}"),
                        },
                        None => "no code".to_string(),
                    };
                    return Err(GatewayError::invalid_payload(format!(
                        "diagnostic message rejected: {reason}"
                    )));
                }
                other => tracing::debug!(payload_type = %other, "ignoring message"),
            }
        }
    }

    /// Send any message as is.
    pub fn send_raw(&self, message: &DoipMessage) -> Result<()> {
        self.connection.write_message(message)
    }

    /// Read the next message of any type.
    pub fn receive(&mut self) -> Result<DoipMessage> {
        self.connection.read_message()
    }

    /// Close the connection.
    pub fn close(self) -> io::Result<()> {
        self.connection.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TESTER: LogicalAddress = LogicalAddress(0x0E00);
    const ECU: LogicalAddress = LogicalAddress(0x1000);

    #[test]
    fn test_client_listener_exchange() {
        let listener = DoipListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();

        let server = thread::spawn(move || {
            let mut conn = listener.accept().unwrap();
            let request = conn.read_message().unwrap();
            assert_eq!(request.payload_type(), PayloadType::RoutingActivationRequest);
            conn.write_message(&DoipMessage::routing_activation_response(
                TESTER,
                ECU,
                ActivationCode::Success,
            ))
            .unwrap();

            let diag = conn.read_message().unwrap();
            let diag = DiagnosticMessage::from_payload(&diag.payload).unwrap();
            assert_eq!(diag.user_data.as_ref(), &[0x22, 0xF1, 0x90]);
            conn.write_message(&DoipMessage::diagnostic_ack(ECU, TESTER))
                .unwrap();
            conn.write_message(&DoipMessage::diagnostic(ECU, TESTER, &[0x62, 0xF1, 0x90]))
                .unwrap();
        });

        let mut client = DoipClient::connect(addr, TESTER).unwrap();
        assert_eq!(client.activate_routing(0).unwrap(), ActivationCode::Success);

        client.send_diagnostic(ECU, &[0x22, 0xF1, 0x90]).unwrap();
        let response = client.receive_diagnostic().unwrap();
        assert_eq!(response.source, ECU);
        assert_eq!(response.user_data.as_ref(), &[0x62, 0xF1, 0x90]);

        server.join().unwrap();
    }

    #[test]
    fn test_writer_clones_share_stream() {
        let listener = DoipListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();

        let server = thread::spawn(move || {
            let conn = listener.accept().unwrap();
            let writers: Vec<_> = (0..4).map(|_| conn.writer()).collect();
            let handles: Vec<_> = writers
                .into_iter()
                .enumerate()
                .map(|(i, writer)| {
                    thread::spawn(move || {
                        for _ in 0..25 {
                            writer
                                .write_message(&DoipMessage::diagnostic(ECU, TESTER, &[i as u8; 64]))
                                .unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });

        let mut client = DoipClient::connect(addr, TESTER).unwrap();
        for _ in 0..100 {
            let message = client.receive_diagnostic().unwrap();
            let first = message.user_data[0];
            assert!(message.user_data.iter().all(|&b| b == first));
        }
        server.join().unwrap();
    }

    #[test]
    fn test_receive_diagnostic_reports_nack_code() {
        let listener = DoipListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();

        let server = thread::spawn(move || {
            let conn = listener.accept().unwrap();
            conn.write_message(&DoipMessage::diagnostic_ack(ECU, TESTER))
                .unwrap();
            conn.write_message(&DoipMessage::diagnostic_nack(
                ECU,
                TESTER,
                NackCode::TransportProtocolError,
            ))
            .unwrap();
        });

        let mut client = DoipClient::connect(addr, TESTER).unwrap();
        let err = client.receive_diagnostic().unwrap_err();
        assert!(matches!(&err, GatewayError::InvalidPayload(msg) if msg.contains("TransportProtocolError")));
        server.join().unwrap();
    }

    #[test]
    fn test_shutdown_ends_reader() {
        let listener = DoipListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();

        let server = thread::spawn(move || {
            let conn = listener.accept().unwrap();
            conn.shutdown().unwrap();
        });

        let mut client = DoipClient::connect(addr, TESTER).unwrap();
        server.join().unwrap();
        assert!(client.receive().unwrap_err().is_disconnect());
    }
}
