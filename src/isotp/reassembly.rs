//! ISO-TP message reassembly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{GatewayError, Result};
use crate::transport::{BusFrame, CanBus};

use super::frame::{FlowControl, FrameKind, IsoTpFrame, FIRST_FRAME_DATA, SINGLE_FRAME_MAX};

/// State for one inbound multi-frame message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyState {
    total_len: usize,
    buffer: BytesMut,
    expected_seq: u8,
    /// Consecutive frames received since our last flow control frame.
    block_count: u8,
}

impl ReassemblyState {
    fn new(total_len: usize, first: &[u8]) -> Self {
        let mut buffer = BytesMut::with_capacity(total_len);
        buffer.put_slice(&first[..first.len().min(total_len)]);
        Self {
            total_len,
            buffer,
            expected_seq: 1,
            block_count: 0,
        }
    }

    /// Declared message length.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Next sequence number accepted.
    pub fn expected_seq(&self) -> u8 {
        self.expected_seq
    }

    fn remaining(&self) -> usize {
        self.total_len - self.buffer.len()
    }

    fn is_complete(&self) -> bool {
        self.buffer.len() >= self.total_len
    }
}

/// Outcome of feeding one frame to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reception {
    /// A whole UDS message.
    Complete(Bytes),
    /// More consecutive frames are needed.
    Partial(ReassemblyState),
}

/// Reassembles ECU responses and answers first frames with flow control.
pub struct IsoTpReceiver<'a, B: CanBus + ?Sized> {
    bus: &'a B,
    tx_id: u16,
    flow_control: FlowControl,
    padding: u8,
}

impl<'a, B: CanBus + ?Sized> IsoTpReceiver<'a, B> {
    /// Create a receiver that sends its flow control frames on `tx_id`.
    pub fn new(bus: &'a B, tx_id: u16, flow_control: FlowControl, padding: u8) -> Self {
        Self {
            bus,
            tx_id,
            flow_control,
            padding,
        }
    }

    /// Handle the frame that starts a new message.
    ///
    /// A single frame completes immediately. A first frame seeds the buffer and
    /// triggers our flow control frame on the bus.
    pub fn receive_start(&self, frame: &BusFrame) -> Result<Reception> {
        match IsoTpFrame::parse(frame.data())? {
            IsoTpFrame::Single(data) => Ok(Reception::Complete(Bytes::copy_from_slice(data))),
            IsoTpFrame::First { total_len, data } => {
                if total_len <= SINGLE_FRAME_MAX {
                    return Err(GatewayError::InvalidFirstFrameLength(total_len));
                }
                if data.len() < FIRST_FRAME_DATA {
                    return Err(GatewayError::InvalidFrame("truncated first frame".into()));
                }

                let state = ReassemblyState::new(total_len, &data[..FIRST_FRAME_DATA]);
                self.send_flow_control()?;
                tracing::debug!(total_len, "first frame received, flow control sent");
                Ok(Reception::Partial(state))
            }
            other => Err(GatewayError::UnexpectedFrame {
                expected: FrameKind::First,
                actual: other.kind(),
            }),
        }
    }

    /// Feed the next consecutive frame of an in-progress message.
    ///
    /// With a non-zero advertised block size, a new flow control frame is
    /// sent after every full block. Any error discards the state.
    pub fn receive_continue(&self, mut state: ReassemblyState, frame: &BusFrame) -> Result<Reception> {
        let (seq, data) = match IsoTpFrame::parse(frame.data())? {
            IsoTpFrame::Consecutive { seq, data } => (seq, data),
            other => {
                return Err(GatewayError::UnexpectedFrame {
                    expected: FrameKind::Consecutive,
                    actual: other.kind(),
                })
            }
        };

        if seq != state.expected_seq {
            return Err(GatewayError::SequenceMismatch {
                expected: state.expected_seq,
                actual: seq,
            });
        }

        let take = data.len().min(state.remaining());
        state.buffer.put_slice(&data[..take]);
        state.expected_seq = (state.expected_seq + 1) & 0x0F;

        if state.is_complete() {
            tracing::debug!(len = state.total_len, "multi-frame message reassembled");
            return Ok(Reception::Complete(state.buffer.freeze()));
        }

        let block_size = self.flow_control.block_size;
        if block_size > 0 {
            state.block_count += 1;
            if state.block_count >= block_size {
                state.block_count = 0;
                self.send_flow_control()?;
                tracing::trace!(received = state.received(), "block complete, flow control sent");
            }
        }
        Ok(Reception::Partial(state))
    }

    fn send_flow_control(&self) -> Result<()> {
        self.bus
            .write(&self.flow_control.to_frame(self.tx_id, self.padding)?)
    }
}
