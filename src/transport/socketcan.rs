//! Raw SocketCAN bus.

use std::io;
use std::time::{Duration, Instant};

use ::socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions, StandardId,
};
use parking_lot::Mutex;

use super::{BusFrame, CanBus};
use crate::config::CanConfig;
use crate::error::{GatewayError, Result};

/// Mask matching all 11 identifier bits of a standard frame.
const STANDARD_ID_MASK: u32 = 0x7FF;

/// Shortest socket timeout worth arming.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// A raw CAN socket bound to one interface, filtered to one response identifier.
pub struct SocketCanBus {
    socket: CanSocket,
    interface: String,
    read_timeout: Mutex<Option<Duration>>,
}

impl SocketCanBus {
    /// Open the interface named in `config` and install the response filter.
    pub fn open(config: &CanConfig) -> Result<Self> {
        Self::open_filtered(&config.interface, config.response_id, config.read_timeout())
    }

    /// Open `interface`, pass only frames with `response_id`, and set the read timeout.
    pub fn open_filtered(interface: &str, response_id: u16, read_timeout: Duration) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(|e| {
            GatewayError::Io(io::Error::new(
                e.kind(),
                format!("failed to open CAN interface {interface}: {e}"),
            ))
        })?;

        socket.set_filters(&[CanFilter::new(response_id as u32, STANDARD_ID_MASK)])?;
        socket.set_read_timeout(read_timeout)?;

        tracing::debug!(
            interface,
            response_id = format!("0x{response_id:03X}"),
            ?read_timeout,
            "CAN socket open"
        );

        Ok(Self {
            socket,
            interface: interface.to_string(),
            read_timeout: Mutex::new(Some(read_timeout)),
        })
    }

    /// Interface name.
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl SocketCanBus {
    fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let mut current = self.read_timeout.lock();
        if *current != Some(timeout) {
            self.socket.set_read_timeout(timeout)?;
            *current = Some(timeout);
        }
        Ok(())
    }
}

impl CanBus for SocketCanBus {
    /// Wait up to `timeout` for a standard data frame.
    ///
    /// Remote, error and extended frames never carry ISO-TP traffic here;
    /// they are skipped without ending the wait early.
    fn read(&self, timeout: Duration) -> Result<Option<BusFrame>> {
        let deadline = Instant::now() + timeout;
        let mut wait = timeout;
        loop {
            // SO_RCVTIMEO rounds to microseconds, and zero blocks forever.
            if wait < MIN_READ_TIMEOUT {
                return Ok(None);
            }
            self.set_timeout(wait)?;

            match self.socket.read_frame() {
                Ok(CanFrame::Data(frame)) if !frame.is_extended() => {
                    return BusFrame::new(frame.raw_id() as u16, frame.data()).map(Some);
                }
                Ok(_) => tracing::trace!("skipping non-data CAN frame"),
                Err(e) => {
                    let e = GatewayError::from(e);
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                }
            }
            wait = deadline.saturating_duration_since(Instant::now());
        }
    }

    fn write(&self, frame: &BusFrame) -> Result<()> {
        let id = StandardId::new(frame.id()).ok_or(GatewayError::InvalidCanId(frame.id() as u32))?;
        let can_frame = CanFrame::new(id, frame.data())
            .ok_or(GatewayError::InvalidFrameLength(frame.len()))?;
        self.socket.write_frame(&can_frame)?;
        Ok(())
    }
}

impl std::fmt::Debug for SocketCanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanBus")
            .field("interface", &self.interface)
            .finish()
    }
}
