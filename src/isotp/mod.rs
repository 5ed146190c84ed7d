//! ISO 15765-2 (ISO-TP) transport.
//!
//! [`IsoTpFrame`] parses the four frame types. [`IsoTpSender`] segments outbound
//! requests and consumes flow control from a
//! [`FlowControlRelay`](crate::relay::FlowControlRelay);
//! [`IsoTpReceiver`] reassembles ECU responses.

mod frame;
mod reassembly;
mod send;

pub use frame::{
    consecutive_frame, first_frame, single_frame, FlowControl, FlowStatus, FrameKind, IsoTpFrame,
    SeparationTime, CONSECUTIVE_FRAME_DATA, FIRST_FRAME_DATA, MAX_MESSAGE_LEN, SINGLE_FRAME_MAX,
};
pub use reassembly::{IsoTpReceiver, ReassemblyState, Reception};
pub use send::IsoTpSender;
