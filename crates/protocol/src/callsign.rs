use std::fmt;

use crate::FrameError;

/// Width of a callsign field on the wire.
pub const CALLSIGN_LEN: usize = 10;

/// A station callsign as carried in frame headers.
///
/// Stored trimmed and upper-cased; the wire form is space-padded to
/// [`CALLSIGN_LEN`] bytes. Callsigns are display metadata only: peers are
/// identified by their transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Callsign(String);

impl Callsign {
    /// Build a callsign from operator input, truncating at the field width.
    pub fn new(s: &str) -> Result<Self, FrameError> {
        let trimmed = s.trim();
        if !trimmed.bytes().all(is_printable) {
            return Err(FrameError::InvalidCallsign);
        }
        let mut owned = trimmed.to_ascii_uppercase();
        owned.truncate(CALLSIGN_LEN);
        Ok(Self(owned))
    }

    /// Decode a 10-byte wire field: right-trim spaces and NULs, upper-case.
    pub fn from_field(field: &[u8]) -> Result<Self, FrameError> {
        let end = field
            .iter()
            .rposition(|&b| b != b' ' && b != 0)
            .map_or(0, |i| i + 1);
        let trimmed = &field[..end];
        if !trimmed.iter().copied().all(is_printable) {
            return Err(FrameError::InvalidCallsign);
        }
        let s = std::str::from_utf8(trimmed)
            .map_err(|_| FrameError::InvalidCallsign)?
            .to_ascii_uppercase();
        Ok(Self(s))
    }

    /// The wire form: space-padded to the field width.
    pub fn to_field(&self) -> [u8; CALLSIGN_LEN] {
        let mut field = [b' '; CALLSIGN_LEN];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Callsign {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b)
}
