//! ISO-TP protocol control information.
//!
//! ```text
//! Single      | 0 | len |  data[1..=7]
//! First       | 1 | len(11..8) | len(7..0) | data[2..8]
//! Consecutive | 2 | seq |  data[1..=7]
//! FlowControl | 3 | fs  | block size | STmin
//! ```

use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::transport::BusFrame;

/// Payload bytes in a single frame.
pub const SINGLE_FRAME_MAX: usize = 7;
/// Payload bytes in a first frame.
pub const FIRST_FRAME_DATA: usize = 6;
/// Payload bytes in a consecutive frame.
pub const CONSECUTIVE_FRAME_DATA: usize = 7;
/// Largest message expressible with a 12-bit first frame length.
pub const MAX_MESSAGE_LEN: usize = 0x0FFF;

/// Frame type from the high nibble of the first data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Complete message in one frame.
    Single,
    /// Start of a segmented message.
    First,
    /// Continuation of a segmented message.
    Consecutive,
    /// Receiver pacing.
    FlowControl,
    /// Any other PCI nibble (or an empty frame).
    Unknown(u8),
}

impl FrameKind {
    /// Classify raw frame data.
    pub fn of(data: &[u8]) -> Self {
        match data.first().map(|b| b >> 4) {
            Some(0) => Self::Single,
            Some(1) => Self::First,
            Some(2) => Self::Consecutive,
            Some(3) => Self::FlowControl,
            Some(other) => Self::Unknown(other),
            None => Self::Unknown(0xFF),
        }
    }
}

/// Flow status of a flow control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowStatus {
    /// Continue to send.
    ContinueToSend,
    /// Wait for another flow control frame.
    Wait,
    /// Receiver buffer overflow; abort.
    Overflow,
    /// Reserved value; treated like overflow.
    Reserved(u8),
}

impl FlowStatus {
    /// Create a FlowStatus from the low nibble.
    pub fn from_nibble(value: u8) -> Self {
        match value & 0x0F {
            0 => Self::ContinueToSend,
            1 => Self::Wait,
            2 => Self::Overflow,
            other => Self::Reserved(other),
        }
    }

    /// Wire nibble.
    pub fn as_nibble(&self) -> u8 {
        match self {
            Self::ContinueToSend => 0,
            Self::Wait => 1,
            Self::Overflow => 2,
            Self::Reserved(value) => *value & 0x0F,
        }
    }
}

/// Separation time minimum (STmin) as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeparationTime(pub u8);

impl SeparationTime {
    /// Delay the sender must leave between consecutive frames.
    ///
    /// 0x00..=0x7F are milliseconds, 0xF1..=0xF9 are 100..=900 microseconds.
    /// Reserved values fall back to the longest defined time, 127 ms.
    pub fn as_duration(&self) -> Duration {
        match self.0 {
            ms @ 0x00..=0x7F => Duration::from_millis(ms as u64),
            us @ 0xF1..=0xF9 => Duration::from_micros((us - 0xF0) as u64 * 100),
            _ => Duration::from_millis(0x7F),
        }
    }
}

/// Parsed flow control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowControl {
    /// Flow status.
    pub status: FlowStatus,
    /// Consecutive frames per block; 0 means no limit.
    pub block_size: u8,
    /// Minimum gap between consecutive frames.
    pub st_min: SeparationTime,
}

impl FlowControl {
    /// Continue-to-send with the given block size and raw STmin.
    pub fn continue_to_send(block_size: u8, st_min: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            st_min: SeparationTime(st_min),
        }
    }

    /// Wait status.
    pub fn wait() -> Self {
        Self {
            status: FlowStatus::Wait,
            block_size: 0,
            st_min: SeparationTime(0),
        }
    }

    /// Overflow status.
    pub fn overflow() -> Self {
        Self {
            status: FlowStatus::Overflow,
            block_size: 0,
            st_min: SeparationTime(0),
        }
    }

    /// Parse frame data; the PCI nibble must be 3.
    pub fn from_data(data: &[u8]) -> Result<Self> {
        match IsoTpFrame::parse(data)? {
            IsoTpFrame::FlowControl(fc) => Ok(fc),
            other => Err(GatewayError::UnexpectedFrame {
                expected: FrameKind::FlowControl,
                actual: other.kind(),
            }),
        }
    }

    /// Encode as a padded bus frame.
    pub fn to_frame(&self, id: u16, padding: u8) -> Result<BusFrame> {
        BusFrame::padded(
            id,
            &[0x30 | self.status.as_nibble(), self.block_size, self.st_min.0],
            padding,
        )
    }
}

/// A parsed ISO-TP frame borrowing its payload from the bus frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoTpFrame<'a> {
    /// Single frame payload.
    Single(&'a [u8]),
    /// First frame: declared total length and the first bytes.
    First { total_len: usize, data: &'a [u8] },
    /// Consecutive frame: 4-bit sequence number and payload.
    Consecutive { seq: u8, data: &'a [u8] },
    /// Flow control.
    FlowControl(FlowControl),
}

impl<'a> IsoTpFrame<'a> {
    /// Parse raw frame data.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let pci = *data
            .first()
            .ok_or_else(|| GatewayError::InvalidFrame("empty frame".into()))?;

        match FrameKind::of(data) {
            FrameKind::Single => {
                let len = pci & 0x0F;
                if len == 0 || len as usize > SINGLE_FRAME_MAX || len as usize >= data.len() {
                    return Err(GatewayError::InvalidSingleFrameLength(len));
                }
                Ok(Self::Single(&data[1..=len as usize]))
            }
            FrameKind::First => {
                if data.len() < 2 {
                    return Err(GatewayError::InvalidFrame("truncated first frame".into()));
                }
                let total_len = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
                Ok(Self::First {
                    total_len,
                    data: &data[2..],
                })
            }
            FrameKind::Consecutive => Ok(Self::Consecutive {
                seq: pci & 0x0F,
                data: &data[1..],
            }),
            FrameKind::FlowControl => {
                if data.len() < 3 {
                    return Err(GatewayError::InvalidFrame(
                        "truncated flow control frame".into(),
                    ));
                }
                Ok(Self::FlowControl(FlowControl {
                    status: FlowStatus::from_nibble(pci),
                    block_size: data[1],
                    st_min: SeparationTime(data[2]),
                }))
            }
            FrameKind::Unknown(nibble) => Err(GatewayError::InvalidFrame(format!(
                "unknown PCI type {nibble}"
            ))),
        }
    }

    /// Frame kind.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Single(_) => FrameKind::Single,
            Self::First { .. } => FrameKind::First,
            Self::Consecutive { .. } => FrameKind::Consecutive,
            Self::FlowControl(_) => FrameKind::FlowControl,
        }
    }
}

/// Encode a single frame.
pub fn single_frame(id: u16, data: &[u8], padding: u8) -> Result<BusFrame> {
    if data.is_empty() || data.len() > SINGLE_FRAME_MAX {
        return Err(GatewayError::InvalidSingleFrameLength(data.len() as u8));
    }
    let mut buf = [0u8; 8];
    buf[0] = data.len() as u8;
    buf[1..=data.len()].copy_from_slice(data);
    BusFrame::padded(id, &buf[..=data.len()], padding)
}

/// Encode a first frame for a message of `total_len` bytes.
pub fn first_frame(id: u16, total_len: usize, data: &[u8]) -> Result<BusFrame> {
    if total_len > MAX_MESSAGE_LEN {
        return Err(GatewayError::PayloadTooLarge {
            size: total_len,
            max: MAX_MESSAGE_LEN,
        });
    }
    if total_len <= SINGLE_FRAME_MAX || data.len() < FIRST_FRAME_DATA {
        return Err(GatewayError::InvalidFirstFrameLength(total_len));
    }
    let mut buf = [0u8; 8];
    buf[0] = 0x10 | ((total_len >> 8) & 0x0F) as u8;
    buf[1] = (total_len & 0xFF) as u8;
    buf[2..].copy_from_slice(&data[..FIRST_FRAME_DATA]);
    BusFrame::new(id, &buf)
}

/// Encode a consecutive frame.
pub fn consecutive_frame(id: u16, seq: u8, data: &[u8], padding: u8) -> Result<BusFrame> {
    if data.is_empty() || data.len() > CONSECUTIVE_FRAME_DATA {
        return Err(GatewayError::InvalidFrameLength(data.len() + 1));
    }
    let mut buf = [0u8; 8];
    buf[0] = 0x20 | (seq & 0x0F);
    buf[1..=data.len()].copy_from_slice(data);
    BusFrame::padded(id, &buf[..=data.len()], padding)
}
