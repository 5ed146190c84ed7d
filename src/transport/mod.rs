//! Bus transport.
//!
//! [`CanBus`] is the seam between the ISO-TP logic and the physical bus:
//! [`SocketCanBus`] talks to a Linux raw CAN socket, [`MockBus`] is an
//! in-memory bus for tests and bench setups. [`tcp`] carries DoIP between
//! the tester and the gateway.

use std::time::Duration;

use crate::error::Result;

mod frame;
pub mod mock;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;
pub mod tcp;

pub use frame::{BusFrame, MAX_DATA_LEN, MAX_STANDARD_ID};
pub use mock::MockBus;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use self::socketcan::SocketCanBus;
pub use tcp::{DoipClient, DoipConnection, DoipListener, DoipWriter, DEFAULT_MAX_PAYLOAD};

/// A CAN bus handle shared by the session and forwarder threads.
///
/// Both methods take `&self`: one thread reads while the other writes.
pub trait CanBus: Send + Sync {
    /// Read the next frame, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a frame.
    fn read(&self, timeout: Duration) -> Result<Option<BusFrame>>;

    /// Write one frame. Failures are reported, never retried here.
    fn write(&self, frame: &BusFrame) -> Result<()>;
}
