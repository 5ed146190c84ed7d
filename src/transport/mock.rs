//! In-memory bus for tests and bench setups.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{BusFrame, CanBus};
use crate::error::Result;

type Responder = Box<dyn FnMut(&BusFrame) -> Vec<BusFrame> + Send>;

/// In-memory [`CanBus`].
///
/// Frames passed to [`inject`](Self::inject) are returned by `read`; frames
/// written by the gateway are recorded. An optional responder plays the ECU:
/// it sees every written frame and its replies are queued for reading.
pub struct MockBus {
    inbound: Mutex<VecDeque<BusFrame>>,
    inbound_ready: Condvar,
    written: Mutex<Vec<BusFrame>>,
    written_ready: Condvar,
    responder: Mutex<Option<Responder>>,
}

impl MockBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Condvar::new(),
            written: Mutex::new(Vec::new()),
            written_ready: Condvar::new(),
            responder: Mutex::new(None),
        }
    }

    /// Queue a frame as if the ECU had sent it.
    pub fn inject(&self, frame: BusFrame) {
        self.inbound.lock().push_back(frame);
        self.inbound_ready.notify_one();
    }

    /// Install the ECU responder.
    pub fn set_responder(&self, responder: impl FnMut(&BusFrame) -> Vec<BusFrame> + Send + 'static) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// All frames written so far.
    pub fn written(&self) -> Vec<BusFrame> {
        self.written.lock().clone()
    }

    /// Wait until at least `count` frames were written, or `timeout` elapses.
    ///
    /// Returns everything written so far either way.
    pub fn wait_for_written(&self, count: usize, timeout: Duration) -> Vec<BusFrame> {
        let deadline = Instant::now() + timeout;
        let mut written = self.written.lock();
        while written.len() < count {
            if self.written_ready.wait_until(&mut written, deadline).timed_out() {
                break;
            }
        }
        written.clone()
    }

    /// Frames not yet read.
    pub fn pending(&self) -> usize {
        self.inbound.lock().len()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CanBus for MockBus {
    fn read(&self, timeout: Duration) -> Result<Option<BusFrame>> {
        let deadline = Instant::now() + timeout;
        let mut inbound = self.inbound.lock();
        loop {
            if let Some(frame) = inbound.pop_front() {
                return Ok(Some(frame));
            }
            if self.inbound_ready.wait_until(&mut inbound, deadline).timed_out() {
                return Ok(inbound.pop_front());
            }
        }
    }

    fn write(&self, frame: &BusFrame) -> Result<()> {
        {
            self.written.lock().push(*frame);
            self.written_ready.notify_all();
        }

        let replies = match self.responder.lock().as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        for reply in replies {
            self.inject(reply);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBus")
            .field("pending", &self.pending())
            .field("written", &self.written.lock().len())
            .finish()
    }
}
