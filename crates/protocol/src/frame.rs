use crate::{Callsign, FrameError, CALLSIGN_LEN};

/// Length of the kind discriminant.
pub const KIND_LEN: usize = 4;
/// Length of poll and unlink frames: kind plus one callsign.
pub const CONTROL_FRAME_LEN: usize = KIND_LEN + CALLSIGN_LEN;
/// Length of a status response: kind, reflector callsign, 3-digit count.
pub const STATUS_FRAME_LEN: usize = KIND_LEN + CALLSIGN_LEN + 3;
/// Length of a data frame: kind, three callsigns, voice payload.
pub const DATA_FRAME_LEN: usize = 155;

const GATEWAY_OFFSET: usize = KIND_LEN;
const SOURCE_OFFSET: usize = KIND_LEN + CALLSIGN_LEN;
const DEST_OFFSET: usize = KIND_LEN + 2 * CALLSIGN_LEN;

/// The four frame kinds the reflector consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Keep-alive, client to reflector and reflector to bridge peer.
    Poll,
    /// Graceful disconnect.
    Unlink,
    /// Status probe or response.
    Status,
    /// Voice/data frame.
    Data,
}

impl FrameKind {
    /// Match the kind discriminant. Returns `None` for unknown kinds.
    pub fn from_bytes(bytes: &[u8; KIND_LEN]) -> Option<Self> {
        match bytes {
            b"YSFP" => Some(Self::Poll),
            b"YSFU" => Some(Self::Unlink),
            b"YSFS" => Some(Self::Status),
            b"YSFD" => Some(Self::Data),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &'static [u8; KIND_LEN] {
        match self {
            Self::Poll => b"YSFP",
            Self::Unlink => b"YSFU",
            Self::Status => b"YSFS",
            Self::Data => b"YSFD",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Unlink => "unlink",
            Self::Status => "status",
            Self::Data => "data",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded frame header.
///
/// Only the header fields are extracted; the voice payload of a data frame
/// stays in the caller's buffer so forwarding never copies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Poll {
        callsign: Callsign,
    },
    Unlink {
        callsign: Callsign,
    },
    /// A status probe. Arrives either full-length (with the sender's
    /// callsign) or as the abbreviated 4-byte form some peers send.
    StatusProbe {
        callsign: Option<Callsign>,
    },
    Data {
        gateway: Callsign,
        source: Callsign,
        destination: Callsign,
    },
}

impl Frame {
    /// Decode a datagram. Rejects anything shorter than the kind
    /// discriminant, unknown kinds, impossible lengths and callsign fields
    /// with non-printable bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < KIND_LEN {
            return Err(FrameError::TooShort(buf.len()));
        }
        let mut kind_bytes = [0u8; KIND_LEN];
        kind_bytes.copy_from_slice(&buf[..KIND_LEN]);
        let kind = FrameKind::from_bytes(&kind_bytes)
            .ok_or(FrameError::UnknownKind(kind_bytes))?;

        match kind {
            FrameKind::Poll | FrameKind::Unlink => {
                if buf.len() < CONTROL_FRAME_LEN {
                    return Err(FrameError::InvalidLength {
                        kind: kind.name(),
                        len: buf.len(),
                    });
                }
                let callsign = Callsign::from_field(&buf[KIND_LEN..CONTROL_FRAME_LEN])?;
                Ok(match kind {
                    FrameKind::Poll => Frame::Poll { callsign },
                    _ => Frame::Unlink { callsign },
                })
            }
            FrameKind::Status => {
                // The abbreviated probe is the bare kind.
                if buf.len() == KIND_LEN {
                    return Ok(Frame::StatusProbe { callsign: None });
                }
                if buf.len() < CONTROL_FRAME_LEN {
                    return Err(FrameError::InvalidLength {
                        kind: kind.name(),
                        len: buf.len(),
                    });
                }
                let callsign = Callsign::from_field(&buf[KIND_LEN..CONTROL_FRAME_LEN])?;
                Ok(Frame::StatusProbe {
                    callsign: Some(callsign),
                })
            }
            FrameKind::Data => {
                if buf.len() != DATA_FRAME_LEN {
                    return Err(FrameError::InvalidLength {
                        kind: kind.name(),
                        len: buf.len(),
                    });
                }
                Ok(Frame::Data {
                    gateway: Callsign::from_field(&buf[GATEWAY_OFFSET..SOURCE_OFFSET])?,
                    source: Callsign::from_field(&buf[SOURCE_OFFSET..DEST_OFFSET])?,
                    destination: Callsign::from_field(&buf[DEST_OFFSET..DEST_OFFSET + CALLSIGN_LEN])?,
                })
            }
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Poll { .. } => FrameKind::Poll,
            Frame::Unlink { .. } => FrameKind::Unlink,
            Frame::StatusProbe { .. } => FrameKind::Status,
            Frame::Data { .. } => FrameKind::Data,
        }
    }

    /// The callsign appropriate to the kind: gateway for poll and unlink,
    /// source for data, the probe callsign (possibly absent) for status.
    pub fn callsign(&self) -> Option<&Callsign> {
        match self {
            Frame::Poll { callsign } | Frame::Unlink { callsign } => Some(callsign),
            Frame::StatusProbe { callsign } => callsign.as_ref(),
            Frame::Data { source, .. } => Some(source),
        }
    }
}

/// Build a poll frame carrying the given callsign.
pub fn poll(callsign: &Callsign) -> [u8; CONTROL_FRAME_LEN] {
    control(FrameKind::Poll, callsign)
}

/// Build an unlink frame carrying the given callsign.
pub fn unlink(callsign: &Callsign) -> [u8; CONTROL_FRAME_LEN] {
    control(FrameKind::Unlink, callsign)
}

/// Build a status response: reflector identity plus the number of
/// connected peers, zero-padded to three digits (saturating at 999).
pub fn status(reflector: &Callsign, connected: usize) -> [u8; STATUS_FRAME_LEN] {
    let mut buf = [b' '; STATUS_FRAME_LEN];
    buf[..KIND_LEN].copy_from_slice(FrameKind::Status.as_bytes());
    buf[KIND_LEN..KIND_LEN + CALLSIGN_LEN].copy_from_slice(&reflector.to_field());
    let count = connected.min(999);
    let digits = format!("{count:03}");
    buf[KIND_LEN + CALLSIGN_LEN..].copy_from_slice(digits.as_bytes());
    buf
}

fn control(kind: FrameKind, callsign: &Callsign) -> [u8; CONTROL_FRAME_LEN] {
    let mut buf = [b' '; CONTROL_FRAME_LEN];
    buf[..KIND_LEN].copy_from_slice(kind.as_bytes());
    buf[KIND_LEN..].copy_from_slice(&callsign.to_field());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callsign(s: &str) -> Callsign {
        Callsign::new(s).unwrap()
    }

    #[test]
    fn poll_round_trip() {
        let frame = Frame::parse(&poll(&callsign("DK0ABC"))).unwrap();
        assert_eq!(
            frame,
            Frame::Poll {
                callsign: callsign("DK0ABC")
            }
        );
    }

    #[test]
    fn unlink_round_trip() {
        let frame = Frame::parse(&unlink(&callsign("R1"))).unwrap();
        assert_eq!(frame.kind(), FrameKind::Unlink);
        assert_eq!(frame.callsign().unwrap().as_str(), "R1");
    }

    #[test]
    fn short_status_probe_is_accepted() {
        let frame = Frame::parse(b"YSFS").unwrap();
        assert_eq!(frame, Frame::StatusProbe { callsign: None });
    }

    #[test]
    fn full_status_probe_carries_callsign() {
        let frame = Frame::parse(b"YSFSDK0ABC    ").unwrap();
        assert_eq!(
            frame.callsign().map(Callsign::as_str),
            Some("DK0ABC")
        );
    }

    #[test]
    fn status_response_layout() {
        let buf = status(&callsign("REFLECTOR"), 42);
        assert_eq!(&buf[..4], b"YSFS");
        assert_eq!(&buf[4..14], b"REFLECTOR ");
        assert_eq!(&buf[14..], b"042");
    }

    #[test]
    fn status_count_saturates() {
        let buf = status(&callsign("REF"), 12345);
        assert_eq!(&buf[14..], b"999");
    }

    #[test]
    fn data_frame_extracts_source() {
        let mut buf = vec![0u8; DATA_FRAME_LEN];
        buf[..4].copy_from_slice(b"YSFD");
        buf[4..14].copy_from_slice(b"GW0GATE   ");
        buf[14..24].copy_from_slice(b"dk0abc    ");
        buf[24..34].copy_from_slice(b"ALL       ");
        let frame = Frame::parse(&buf).unwrap();
        match frame {
            Frame::Data { source, destination, .. } => {
                assert_eq!(source.as_str(), "DK0ABC");
                assert_eq!(destination.as_str(), "ALL");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_datagram() {
        assert_eq!(Frame::parse(b"YS"), Err(FrameError::TooShort(2)));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(matches!(
            Frame::parse(b"ABCD"),
            Err(FrameError::UnknownKind(_))
        ));
    }

    #[test]
    fn rejects_wrong_data_length() {
        let mut buf = vec![0u8; 100];
        buf[..4].copy_from_slice(b"YSFD");
        assert!(matches!(
            Frame::parse(&buf),
            Err(FrameError::InvalidLength { kind: "data", .. })
        ));
    }

    #[test]
    fn rejects_binary_callsign() {
        let mut buf = [0u8; CONTROL_FRAME_LEN];
        buf[..4].copy_from_slice(b"YSFP");
        buf[4] = 0x7f;
        assert_eq!(Frame::parse(&buf), Err(FrameError::InvalidCallsign));
    }
}
