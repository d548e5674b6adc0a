use thiserror::Error;

/// A frame that could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The datagram is shorter than the 4-byte kind discriminant.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    /// The kind bytes match no known frame kind.
    #[error("unknown frame kind: {0:?}")]
    UnknownKind([u8; 4]),
    /// A frame of a known kind with an impossible length.
    #[error("invalid length {len} for {kind} frame")]
    InvalidLength {
        /// The frame kind that was recognized.
        kind: &'static str,
        /// The actual datagram length.
        len: usize,
    },
    /// The callsign field contains bytes outside printable ASCII.
    #[error("callsign contains non-printable bytes")]
    InvalidCallsign,
}
