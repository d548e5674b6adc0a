//! Frame codec for the reflector's UDP wire protocol.
//!
//! Every control and data frame starts with a 4-byte ASCII kind. Control
//! frames carry a single space-padded callsign; data frames carry the
//! gateway, source and destination callsigns followed by an opaque voice
//! payload which this crate never interprets.

mod callsign;
mod error;
mod frame;

pub use callsign::{Callsign, CALLSIGN_LEN};
pub use error::FrameError;
pub use frame::{
    poll, status, unlink, Frame, FrameKind, CONTROL_FRAME_LEN, DATA_FRAME_LEN, KIND_LEN,
    STATUS_FRAME_LEN,
};
