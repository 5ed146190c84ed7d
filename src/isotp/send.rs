//! Segmenting sender.

use std::thread;

use crate::config::IsoTpConfig;
use crate::error::{GatewayError, Result};
use crate::relay::FlowControlRelay;
use crate::transport::CanBus;

use super::frame::{
    consecutive_frame, first_frame, single_frame, FlowControl, FlowStatus,
    CONSECUTIVE_FRAME_DATA, FIRST_FRAME_DATA, MAX_MESSAGE_LEN, SINGLE_FRAME_MAX,
};

/// Progress of one outbound multi-frame message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SendState {
    sent: usize,
    seq: u8,
}

impl SendState {
    fn after_first_frame() -> Self {
        Self {
            sent: FIRST_FRAME_DATA,
            seq: 1,
        }
    }

    fn advance(&mut self, bytes: usize) {
        self.sent += bytes;
        self.seq = (self.seq + 1) & 0x0F;
    }
}

/// Sends UDS payloads as ISO-TP frames.
///
/// Flow control frames are not read from the bus here; the forwarder thread
/// pushes them into the relay and the sender waits on it.
pub struct IsoTpSender<'a, B: CanBus + ?Sized> {
    bus: &'a B,
    relay: &'a FlowControlRelay,
    config: IsoTpConfig,
}

impl<'a, B: CanBus + ?Sized> IsoTpSender<'a, B> {
    /// Create a sender writing to `bus` and taking flow control from `relay`.
    pub fn new(bus: &'a B, relay: &'a FlowControlRelay, config: IsoTpConfig) -> Self {
        Self { bus, relay, config }
    }

    /// Send `data` on identifier `id`.
    ///
    /// Up to 7 bytes go out as one single frame. Longer payloads use a first
    /// frame followed by consecutive frames paced by the receiver's flow
    /// control. A flow control timeout or overflow abandons the message.
    pub fn send(&self, id: u16, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(GatewayError::EmptyPayload);
        }
        if data.len() > MAX_MESSAGE_LEN {
            return Err(GatewayError::PayloadTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_LEN,
            });
        }

        if data.len() <= SINGLE_FRAME_MAX {
            self.bus.write(&single_frame(id, data, self.config.padding)?)?;
            tracing::debug!(can_id = format!("0x{id:03X}"), len = data.len(), "sent single frame");
            return Ok(());
        }

        self.send_segmented(id, data)
    }

    fn send_segmented(&self, id: u16, data: &[u8]) -> Result<()> {
        let stale = self.relay.clear();
        if stale > 0 {
            tracing::debug!(stale, "discarded flow control frames from before this message");
        }

        self.bus.write(&first_frame(id, data.len(), data)?)?;
        tracing::debug!(can_id = format!("0x{id:03X}"), len = data.len(), "sent first frame");

        let mut state = SendState::after_first_frame();
        while state.sent < data.len() {
            let fc = self.wait_for_clearance()?;
            self.send_block(id, data, &mut state, fc)?;
        }

        tracing::debug!(can_id = format!("0x{id:03X}"), len = data.len(), "multi-frame send complete");
        Ok(())
    }

    /// Wait until the receiver says continue-to-send.
    fn wait_for_clearance(&self) -> Result<FlowControl> {
        loop {
            let fc = self.relay.wait(self.config.fc_timeout())?;
            match fc.status {
                FlowStatus::ContinueToSend => return Ok(fc),
                FlowStatus::Wait => {
                    tracing::debug!("flow control wait, backing off");
                    thread::sleep(self.config.wait_backoff());
                }
                status @ (FlowStatus::Overflow | FlowStatus::Reserved(_)) => {
                    return Err(GatewayError::FlowControlAborted(status));
                }
            }
        }
    }

    /// Send one block of consecutive frames.
    fn send_block(
        &self,
        id: u16,
        data: &[u8],
        state: &mut SendState,
        fc: FlowControl,
    ) -> Result<()> {
        let st_min = fc.st_min.as_duration();
        let mut in_block: usize = 0;

        while state.sent < data.len() && (fc.block_size == 0 || in_block < fc.block_size as usize) {
            let end = (state.sent + CONSECUTIVE_FRAME_DATA).min(data.len());
            let chunk = &data[state.sent..end];

            self.bus
                .write(&consecutive_frame(id, state.seq, chunk, self.config.padding)?)?;
            state.advance(chunk.len());
            in_block += 1;

            if state.sent < data.len() && !st_min.is_zero() {
                thread::sleep(st_min);
            }
        }

        tracing::trace!(frames = in_block, block_size = fc.block_size, "sent block");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isotp::frame::{FrameKind, IsoTpFrame};
    use crate::transport::{BusFrame, MockBus};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const REQUEST_ID: u16 = 0x7E0;

    fn fast_config() -> IsoTpConfig {
        IsoTpConfig::default()
            .with_fc_timeout(Duration::from_millis(100))
            .with_wait_backoff(Duration::from_millis(5))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn sequence_numbers(frames: &[BusFrame]) -> Vec<u8> {
        frames
            .iter()
            .filter(|f| FrameKind::of(f.data()) == FrameKind::Consecutive)
            .map(|f| f.data()[0] & 0x0F)
            .collect()
    }

    #[test]
    fn test_single_frame_boundary() {
        for len in 1..=7 {
            let bus = MockBus::new();
            let relay = FlowControlRelay::new(4);
            let sender = IsoTpSender::new(&bus, &relay, fast_config());

            sender.send(REQUEST_ID, &payload(len)).unwrap();

            let written = bus.written();
            assert_eq!(written.len(), 1);
            assert_eq!(written[0].id(), REQUEST_ID);
            assert_eq!(written[0].data()[0], len as u8);
        }
    }

    #[test]
    fn test_reject_empty_and_oversized() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        let sender = IsoTpSender::new(&bus, &relay, fast_config());

        assert!(matches!(
            sender.send(REQUEST_ID, &[]),
            Err(GatewayError::EmptyPayload)
        ));
        assert!(matches!(
            sender.send(REQUEST_ID, &payload(4096)),
            Err(GatewayError::PayloadTooLarge { size: 4096, .. })
        ));
        assert!(bus.written().is_empty());
    }

    #[test]
    fn test_uds_request_single_frame_bytes() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        IsoTpSender::new(&bus, &relay, fast_config())
            .send(REQUEST_ID, &[0x22, 0xF1, 0x90])
            .unwrap();

        assert_eq!(
            bus.written()[0].data(),
            &[0x03, 0x22, 0xF1, 0x90, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_multi_frame_sequence_wraps() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        // Left over from an earlier exchange; must not release this message.
        relay.push(FlowControl::overflow());
        let data = payload(6 + 7 * 20);

        thread::scope(|scope| {
            let send = scope.spawn(|| IsoTpSender::new(&bus, &relay, fast_config()).send(REQUEST_ID, &data));
            bus.wait_for_written(1, Duration::from_secs(1));
            relay.push(FlowControl::continue_to_send(0, 0));
            send.join().unwrap().unwrap();
        });

        let written = bus.written();
        assert_eq!(written.len(), 21);
        assert_eq!(FrameKind::of(written[0].data()), FrameKind::First);

        let expected: Vec<u8> = (1..=20u8).map(|i| i % 16).collect();
        assert_eq!(sequence_numbers(&written), expected);
        assert_eq!(&sequence_numbers(&written)[14..16], &[15, 0]);
    }

    #[test]
    fn test_block_size_is_honored() {
        let bus = Arc::new(MockBus::new());
        let relay = Arc::new(FlowControlRelay::new(4));
        let data = payload(6 + 7 * 5);

        let send = {
            let bus = bus.clone();
            let relay = relay.clone();
            thread::spawn(move || {
                IsoTpSender::new(bus.as_ref(), relay.as_ref(), fast_config()).send(REQUEST_ID, &data)
            })
        };

        bus.wait_for_written(1, Duration::from_secs(1));
        relay.push(FlowControl::continue_to_send(2, 0));

        // Two consecutive frames, then the sender blocks and finally times out.
        let result = send.join().unwrap();
        assert!(matches!(result, Err(GatewayError::FlowControlTimeout(_))));

        let written = bus.written();
        assert_eq!(written.len(), 3);
        assert_eq!(sequence_numbers(&written), vec![1, 2]);
    }

    #[test]
    fn test_multiple_blocks() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        let relay_ref = &relay;
        let data = payload(6 + 7 * 5);

        thread::scope(|scope| {
            let send = scope.spawn(|| {
                IsoTpSender::new(&bus, relay_ref, fast_config()).send(REQUEST_ID, &data)
            });
            for expected in [1, 3, 5] {
                let written = bus.wait_for_written(expected, Duration::from_secs(1));
                assert_eq!(written.len(), expected);
                relay_ref.push(FlowControl::continue_to_send(2, 0));
            }
            send.join().unwrap().unwrap();
        });

        assert_eq!(sequence_numbers(&bus.written()), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_wait_status_retries_block() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        let data = payload(20);

        thread::scope(|scope| {
            let send = scope.spawn(|| IsoTpSender::new(&bus, &relay, fast_config()).send(REQUEST_ID, &data));
            bus.wait_for_written(1, Duration::from_secs(1));
            relay.push(FlowControl::wait());
            relay.push(FlowControl::wait());
            relay.push(FlowControl::continue_to_send(0, 0));
            send.join().unwrap().unwrap();
        });

        assert_eq!(bus.written().len(), 3);
    }

    #[test]
    fn test_overflow_aborts() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        let data = payload(20);

        let result = thread::scope(|scope| {
            let send = scope.spawn(|| IsoTpSender::new(&bus, &relay, fast_config()).send(REQUEST_ID, &data));
            bus.wait_for_written(1, Duration::from_secs(1));
            relay.push(FlowControl::overflow());
            send.join().unwrap()
        });

        assert!(matches!(
            result,
            Err(GatewayError::FlowControlAborted(FlowStatus::Overflow))
        ));
        assert_eq!(bus.written().len(), 1);
    }

    #[test]
    fn test_timeout_sends_nothing_after_first_frame() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        let start = Instant::now();

        let result = IsoTpSender::new(&bus, &relay, fast_config()).send(REQUEST_ID, &payload(100));

        assert!(matches!(result, Err(GatewayError::FlowControlTimeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(100));
        let written = bus.written();
        assert_eq!(written.len(), 1);
        assert!(matches!(
            IsoTpFrame::parse(written[0].data()).unwrap(),
            IsoTpFrame::First { total_len: 100, .. }
        ));
    }

    #[test]
    fn test_separation_time_applied() {
        let bus = MockBus::new();
        let relay = FlowControlRelay::new(4);
        let data = payload(6 + 7 * 3);

        let elapsed = thread::scope(|scope| {
            let send = scope.spawn(|| {
                let start = Instant::now();
                IsoTpSender::new(&bus, &relay, fast_config())
                    .send(REQUEST_ID, &data)
                    .map(|_| start.elapsed())
            });
            bus.wait_for_written(1, Duration::from_secs(1));
            relay.push(FlowControl::continue_to_send(0, 20));
            send.join().unwrap().unwrap()
        });

        // Three consecutive frames, two gaps.
        assert!(elapsed >= Duration::from_millis(40));
    }
}
