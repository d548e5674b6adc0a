use std::net::SocketAddr;

use serde::Serialize;
use ysfr_protocol::Callsign;

use crate::event::mask_addr;
use crate::time::LocalTime;

/// A connected repeater or hotspot.
///
/// Identified by its transport address; the callsign is display metadata.
#[derive(Debug, Clone)]
pub struct Peer {
    pub callsign: Callsign,
    pub addr: SocketAddr,
    pub connected_at: LocalTime,
    pub last_seen: LocalTime,
    /// Set while the peer holds the floor.
    pub talk_start: Option<LocalTime>,
    /// Last data frame while talking.
    pub last_data: LocalTime,
    pub packets: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}

impl Peer {
    pub fn new(callsign: Callsign, addr: SocketAddr, now: LocalTime) -> Self {
        Self {
            callsign,
            addr,
            connected_at: now,
            last_seen: now,
            talk_start: None,
            last_data: LocalTime::default(),
            packets: 0,
            bytes_rx: 0,
            bytes_tx: 0,
        }
    }

    pub fn is_talking(&self) -> bool {
        self.talk_start.is_some()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            callsign: self.callsign.to_string(),
            address: mask_addr(&self.addr),
            connected_at: self.connected_at.as_millis(),
            last_seen: self.last_seen.as_millis(),
            is_talking: self.is_talking(),
            packets: self.packets,
            bytes_rx: self.bytes_rx,
            bytes_tx: self.bytes_tx,
        }
    }
}

/// Per-peer view served to snapshot consumers, address masked.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub callsign: String,
    pub address: String,
    pub connected_at: u64,
    pub last_seen: u64,
    pub is_talking: bool,
    pub packets: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}
