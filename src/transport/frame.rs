//! Classic CAN data frame with an 11-bit identifier.

use crate::error::{GatewayError, Result};

/// Maximum data bytes in a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

/// Largest 11-bit standard identifier.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// A bus frame: identifier, length and up to 8 data bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusFrame {
    id: u16,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl BusFrame {
    /// Create a frame carrying exactly `data`.
    pub fn new(id: u16, data: &[u8]) -> Result<Self> {
        if id > MAX_STANDARD_ID {
            return Err(GatewayError::InvalidCanId(id as u32));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(GatewayError::InvalidFrameLength(data.len()));
        }

        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Create a full 8-byte frame, filling unused bytes with `padding`.
    pub fn padded(id: u16, data: &[u8], padding: u8) -> Result<Self> {
        let mut frame = Self::new(id, data)?;
        frame.data[data.len()..].fill(padding);
        frame.len = MAX_DATA_LEN as u8;
        Ok(frame)
    }

    /// Identifier.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Data bytes (`len` of them).
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Data length code.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Check if the frame carries no data.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for BusFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BusFrame(0x{:03X} [", self.id)?;
        for (i, byte) in self.data().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        f.write_str("])")
    }
}
