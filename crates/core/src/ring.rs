use std::collections::VecDeque;

use serde::Serialize;

use crate::arbitrator::EndedTalk;
use crate::event::mask_addr;

/// How many finished transmissions are retained by default.
pub const DEFAULT_TALK_RING_CAPACITY: usize = 1000;

/// One finished transmission, address already masked.
#[derive(Debug, Clone, Serialize)]
pub struct TalkRecord {
    pub callsign: String,
    pub address: String,
    pub started_at: u64,
    pub duration_ms: u64,
}

impl From<&EndedTalk> for TalkRecord {
    fn from(talk: &EndedTalk) -> Self {
        Self {
            callsign: talk.callsign.clone(),
            address: mask_addr(&talk.addr),
            started_at: talk.started_at.as_millis(),
            duration_ms: talk.duration.as_millis(),
        }
    }
}

/// Bounded ring of the most recent finished transmissions. The only talk
/// history the reflector keeps; restart starts empty.
#[derive(Debug)]
pub struct TalkRing {
    entries: VecDeque<TalkRecord>,
    capacity: usize,
}

impl TalkRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, talk: &EndedTalk) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TalkRecord::from(talk));
    }

    /// Most recent first.
    pub fn records(&self) -> Vec<TalkRecord> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TalkRing {
    fn default() -> Self {
        Self::new(DEFAULT_TALK_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{LocalDuration, LocalTime};

    fn talk(n: u64) -> EndedTalk {
        EndedTalk {
            callsign: format!("R{n}"),
            addr: "127.0.0.1:40000".parse().unwrap(),
            started_at: LocalTime::from_secs(n),
            duration: LocalDuration::from_secs(1),
        }
    }

    #[test]
    fn oldest_records_are_evicted() {
        let mut ring = TalkRing::new(3);
        for n in 0..5 {
            ring.push(&talk(n));
        }
        assert_eq!(ring.len(), 3);
        let records = ring.records();
        assert_eq!(records[0].callsign, "R4");
        assert_eq!(records[2].callsign, "R2");
    }
}
