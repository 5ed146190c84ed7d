//! CAN to DoIP forwarding.
//!
//! The forwarder owns the bus read side of a session. Flow control frames
//! are handed to the [`FlowControlRelay`] for the sender; everything else is
//! reassembled into ECU responses and written to the tester.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::header::LogicalAddress;
use crate::isotp::{FlowControl, FrameKind, IsoTpReceiver, ReassemblyState, Reception};
use crate::message::DoipMessage;
use crate::relay::FlowControlRelay;
use crate::transport::{BusFrame, CanBus, DoipWriter};
use crate::types::RDBI_POSITIVE_RESPONSE;

/// Wrap reassembled ECU bytes for the tester.
///
/// UDS responses (first byte 0x40..=0x7F) pass through unchanged. Anything
/// else gets a 0x62 prefix so testers see it as a ReadDataByIdentifier
/// positive response.
pub fn wrap_ecu_response(data: &[u8]) -> Bytes {
    match data.first() {
        Some(0x40..=0x7F) => Bytes::copy_from_slice(data),
        _ => {
            let mut buf = BytesMut::with_capacity(data.len() + 1);
            buf.put_u8(RDBI_POSITIVE_RESPONSE);
            buf.put_slice(data);
            buf.freeze()
        }
    }
}

/// Bus reader for one session.
pub struct Forwarder<B: CanBus + ?Sized> {
    bus: Arc<B>,
    relay: Arc<FlowControlRelay>,
    writer: DoipWriter,
    active: Arc<AtomicBool>,
    request_id: u16,
    response_id: u16,
    read_timeout: Duration,
    tester: LogicalAddress,
    ecu: LogicalAddress,
    protocol_version: u8,
    flow_control: FlowControl,
    padding: u8,
}

impl<B: CanBus + ?Sized + 'static> Forwarder<B> {
    /// Create a forwarder for the session sharing `relay`, `writer` and `active`.
    pub fn new(
        config: &GatewayConfig,
        bus: Arc<B>,
        relay: Arc<FlowControlRelay>,
        writer: DoipWriter,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bus,
            relay,
            writer,
            active,
            request_id: config.can.request_id,
            response_id: config.can.response_id,
            read_timeout: config.can.read_timeout(),
            tester: config.addressing.tester,
            ecu: config.addressing.ecu,
            protocol_version: config.protocol_version,
            flow_control: FlowControl::continue_to_send(
                config.isotp.rx_block_size,
                config.isotp.rx_st_min,
            ),
            padding: config.isotp.padding,
        }
    }

    /// Run the forwarder on its own thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("doip-forwarder".into())
            .spawn(move || self.run())
    }

    /// Read and forward until the session is no longer active.
    ///
    /// A bus or TCP failure ends the whole session: the active flag is
    /// cleared, the relay closed and the TCP stream shut down.
    pub fn run(self) {
        tracing::debug!(response_id = format!("0x{:03X}", self.response_id), "forwarder started");

        if let Err(e) = self.forward() {
            tracing::error!(error = %e, "forwarder failed, closing session");
            self.active.store(false, Ordering::Release);
            self.relay.close();
            if let Err(e) = self.writer.shutdown() {
                tracing::debug!(error = %e, "shutdown after forwarder failure");
            }
        }

        tracing::debug!("forwarder stopped");
    }

    fn forward(&self) -> Result<()> {
        let receiver = IsoTpReceiver::new(
            self.bus.as_ref(),
            self.request_id,
            self.flow_control,
            self.padding,
        );
        let mut pending: Option<ReassemblyState> = None;

        while self.active.load(Ordering::Acquire) {
            let Some(frame) = self.bus.read(self.read_timeout)? else {
                if let Some(state) = pending.take() {
                    tracing::warn!(
                        received = state.received(),
                        total = state.total_len(),
                        "timed out waiting for consecutive frame, dropping response"
                    );
                }
                continue;
            };

            if frame.id() != self.response_id {
                tracing::trace!(can_id = format!("0x{:03X}", frame.id()), "ignoring frame");
                continue;
            }

            if FrameKind::of(frame.data()) == FrameKind::FlowControl {
                self.relay_flow_control(&frame);
                continue;
            }

            let result = match pending.take() {
                Some(state) if FrameKind::of(frame.data()) == FrameKind::Consecutive => {
                    receiver.receive_continue(state, &frame)
                }
                Some(state) => {
                    tracing::warn!(
                        received = state.received(),
                        total = state.total_len(),
                        "new message started during reassembly, dropping partial response"
                    );
                    receiver.receive_start(&frame)
                }
                None => receiver.receive_start(&frame),
            };

            match result {
                Ok(Reception::Complete(data)) => self.deliver(&data)?,
                Ok(Reception::Partial(state)) => pending = Some(state),
                Err(e) if e.is_framing() => {
                    tracing::warn!(error = %e, ?frame, "dropping ECU message");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn relay_flow_control(&self, frame: &BusFrame) {
        match FlowControl::from_data(frame.data()) {
            Ok(fc) => {
                tracing::debug!(status = ?fc.status, block_size = fc.block_size, "flow control received");
                self.relay.push(fc);
            }
            Err(e) => tracing::warn!(error = %e, ?frame, "malformed flow control frame"),
        }
    }

    fn deliver(&self, data: &[u8]) -> Result<()> {
        let payload = wrap_ecu_response(data);
        let message =
            DoipMessage::diagnostic(self.ecu, self.tester, &payload).version(self.protocol_version);

        self.writer.write_message(&message)?;
        tracing::debug!(len = payload.len(), "forwarded ECU response");
        Ok(())
    }
}
