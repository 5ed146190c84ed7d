//! Flow control hand-off between the forwarder and the sender.
//!
//! The forwarder thread owns all bus reads. When it sees a flow control
//! frame it pushes it here; an in-flight multi-frame send on the session
//! thread waits for it. Only [`FlowControl`] values cross this boundary.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{GatewayError, Result};
use crate::isotp::FlowControl;

#[derive(Debug, Default)]
struct RelayState {
    frames: VecDeque<FlowControl>,
    closed: bool,
}

/// Bounded mailbox of flow control frames with a timed receive.
#[derive(Debug)]
pub struct FlowControlRelay {
    state: Mutex<RelayState>,
    available: Condvar,
    capacity: usize,
}

impl FlowControlRelay {
    /// Create a relay holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Deliver a frame and wake one waiter.
    ///
    /// When the mailbox is full the oldest frame is dropped. Returns `false`
    /// if the relay is closed and the frame was discarded.
    pub fn push(&self, frame: FlowControl) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.frames.len() >= self.capacity {
            if let Some(dropped) = state.frames.pop_front() {
                tracing::warn!(?dropped, "flow control relay full, dropping oldest frame");
            }
        }
        state.frames.push_back(frame);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Take the oldest frame, blocking for at most `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<FlowControl> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(GatewayError::RelayClosed);
            }
            if let Some(frame) = state.frames.pop_front() {
                return Ok(frame);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return Err(GatewayError::RelayClosed);
                }
                return state
                    .frames
                    .pop_front()
                    .ok_or(GatewayError::FlowControlTimeout(timeout));
            }
        }
    }

    /// Drop any buffered frames; returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.frames.len();
        state.frames.clear();
        dropped
    }

    /// Close the relay and wake every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Check if the relay was closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Check if no frames are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_frames_delivered_in_receipt_order() {
        let relay = FlowControlRelay::new(8);
        relay.push(FlowControl::wait());
        relay.push(FlowControl::continue_to_send(2, 0));

        assert_eq!(relay.wait(Duration::ZERO).unwrap(), FlowControl::wait());
        assert_eq!(
            relay.wait(Duration::ZERO).unwrap(),
            FlowControl::continue_to_send(2, 0)
        );
        assert!(relay.is_empty());
    }

    #[test]
    fn test_wait_times_out() {
        let relay = FlowControlRelay::new(1);
        let start = Instant::now();
        let result = relay.wait(Duration::from_millis(30));

        assert!(matches!(result, Err(GatewayError::FlowControlTimeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_push_wakes_waiter() {
        let relay = Arc::new(FlowControlRelay::new(1));
        let waiter = {
            let relay = relay.clone();
            thread::spawn(move || relay.wait(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        relay.push(FlowControl::continue_to_send(0, 0));

        assert_eq!(
            waiter.join().unwrap().unwrap(),
            FlowControl::continue_to_send(0, 0)
        );
    }

    #[test]
    fn test_close_wakes_waiter() {
        let relay = Arc::new(FlowControlRelay::new(1));
        let waiter = {
            let relay = relay.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (relay.wait(Duration::from_secs(5)), start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        relay.close();

        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(GatewayError::RelayClosed)));
        assert!(elapsed < Duration::from_secs(5));
        assert!(!relay.push(FlowControl::wait()));
    }

    #[test]
    fn test_full_relay_drops_oldest() {
        let relay = FlowControlRelay::new(2);
        relay.push(FlowControl::continue_to_send(1, 0));
        relay.push(FlowControl::continue_to_send(2, 0));
        relay.push(FlowControl::continue_to_send(3, 0));

        assert_eq!(relay.len(), 2);
        assert_eq!(relay.wait(Duration::ZERO).unwrap().block_size, 2);
        assert_eq!(relay.wait(Duration::ZERO).unwrap().block_size, 3);
    }

    #[test]
    fn test_clear() {
        let relay = FlowControlRelay::new(4);
        relay.push(FlowControl::wait());
        relay.push(FlowControl::wait());
        assert_eq!(relay.clear(), 2);
        assert!(relay.is_empty());
    }
}
