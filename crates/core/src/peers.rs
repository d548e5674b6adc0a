//! The connection table: who is connected, since when, and how much
//! traffic they have moved.

use std::collections::HashMap;
use std::net::SocketAddr;

use event_bus::EventBus;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use ysfr_protocol::Callsign;

use crate::blocklist::Blocklist;
use crate::event::{EventKind, ReflectorEvent};
use crate::peer::{Peer, PeerSummary};
use crate::time::{LocalDuration, LocalTime};

/// Why a handshake was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPeerError {
    #[error("callsign is on the blocklist")]
    Blocked,
    #[error("connection table is full")]
    CapacityExceeded,
}

/// Aggregate counters across the lifetime of the table.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TableStats {
    /// Connections accepted since startup.
    pub total_connections: u64,
    /// Currently connected peers.
    pub active_connections: usize,
    /// Handshakes refused by the blocklist.
    pub blocked: u64,
    /// Handshakes refused at capacity.
    pub refused: u64,
    /// Peers evicted for inactivity.
    pub timed_out: u64,
    pub packets: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}

/// Mapping from transport address to peer record. The single source of
/// truth for "who is connected"; all mutation happens on the reflector
/// service task.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<SocketAddr, Peer>,
    blocklist: Blocklist,
    max_connections: usize,
    stats: TableStats,
    event_bus: EventBus,
}

impl PeerTable {
    pub fn new(blocklist: Blocklist, max_connections: usize, event_bus: EventBus) -> Self {
        Self {
            peers: HashMap::new(),
            blocklist,
            max_connections,
            stats: TableStats::default(),
            event_bus,
        }
    }

    /// Accept or refresh a peer. Returns the peer and whether it is new.
    ///
    /// A refused handshake publishes `blocked` (blocklist) or only logs
    /// (capacity); neither inserts a peer or emits `connect`.
    pub fn add_or_touch(
        &mut self,
        callsign: &Callsign,
        addr: SocketAddr,
        now: LocalTime,
    ) -> Result<(&mut Peer, bool), AddPeerError> {
        if self.peers.contains_key(&addr) {
            let peer = self.peers.get_mut(&addr).expect("checked above");
            peer.last_seen = now;
            return Ok((peer, false));
        }

        if self.blocklist.contains(callsign.as_str()) {
            self.stats.blocked += 1;
            self.event_bus.publish(ReflectorEvent::new(
                EventKind::Blocked,
                callsign.as_str(),
                &addr,
                now,
            ));
            return Err(AddPeerError::Blocked);
        }

        if self.peers.len() >= self.max_connections {
            self.stats.refused += 1;
            warn!(%callsign, %addr, "connection table full, handshake refused");
            return Err(AddPeerError::CapacityExceeded);
        }

        self.stats.total_connections += 1;
        debug!(%callsign, %addr, "peer connected");
        self.event_bus.publish(ReflectorEvent::new(
            EventKind::Connect,
            callsign.as_str(),
            &addr,
            now,
        ));
        let peer = self
            .peers
            .entry(addr)
            .or_insert_with(|| Peer::new(callsign.clone(), addr, now));
        Ok((peer, true))
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        self.peers.get_mut(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Remove a peer, publishing the given event kind (`Disconnect` for
    /// unlinks and operator action, `Timeout` for idle eviction).
    /// Idempotent: removing an absent address is a no-op.
    ///
    /// Talk state is the arbitrator's concern; the caller clears it before
    /// removal so no event ordering is violated.
    pub fn remove(&mut self, addr: &SocketAddr, now: LocalTime, kind: EventKind) -> Option<Peer> {
        let peer = self.peers.remove(addr)?;
        if kind == EventKind::Timeout {
            self.stats.timed_out += 1;
        }
        debug!(callsign = %peer.callsign, %addr, "peer removed");
        self.event_bus.publish(ReflectorEvent::new(
            kind,
            peer.callsign.as_str(),
            addr,
            now,
        ));
        Some(peer)
    }

    /// Addresses whose last activity is older than `idle_timeout`.
    pub fn idle_peers(&self, now: LocalTime, idle_timeout: LocalDuration) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|peer| now - peer.last_seen > idle_timeout)
            .map(|peer| peer.addr)
            .collect()
    }

    /// Record a received datagram from a connected peer.
    pub fn record_rx(&mut self, addr: &SocketAddr, bytes: usize) {
        self.stats.packets += 1;
        self.stats.bytes_rx += bytes as u64;
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.packets += 1;
            peer.bytes_rx += bytes as u64;
        }
    }

    /// Record a datagram forwarded to a peer.
    pub fn record_tx(&mut self, addr: &SocketAddr, bytes: usize) {
        self.stats.bytes_tx += bytes as u64;
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.bytes_tx += bytes as u64;
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            active_connections: self.peers.len(),
            ..self.stats
        }
    }

    /// Masked per-peer summaries for external consumers.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers.values().map(Peer::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max: usize) -> (PeerTable, EventBus) {
        let mut bus = EventBus::default();
        bus.register::<ReflectorEvent>(Some(64));
        let blocklist = Blocklist::new(["N0CALL"]);
        (PeerTable::new(blocklist, max, bus.clone()), bus)
    }

    fn cs(s: &str) -> Callsign {
        Callsign::new(s).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn add_then_touch_is_one_peer_one_connect() {
        let (mut table, bus) = table(10);
        let rx = bus.subscribe::<ReflectorEvent>();
        let now = LocalTime::from_secs(1);

        let (_, new) = table.add_or_touch(&cs("R1"), addr(40001), now).unwrap();
        assert!(new);
        let (peer, new) = table
            .add_or_touch(&cs("R1"), addr(40001), LocalTime::from_secs(2))
            .unwrap();
        assert!(!new);
        assert_eq!(peer.last_seen, LocalTime::from_secs(2));

        assert_eq!(table.len(), 1);
        let connect_events: Vec<_> = std::iter::from_fn(|| rx.try_recv())
            .filter(|e| e.kind == EventKind::Connect)
            .collect();
        assert_eq!(connect_events.len(), 1);
    }

    #[test]
    fn blocked_callsign_is_refused_with_event() {
        let (mut table, bus) = table(10);
        let rx = bus.subscribe::<ReflectorEvent>();

        let err = table
            .add_or_touch(&cs("n0call"), addr(40002), LocalTime::from_secs(1))
            .unwrap_err();
        assert_eq!(err, AddPeerError::Blocked);
        assert!(table.is_empty());
        assert_eq!(table.stats().blocked, 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Blocked);
    }

    #[test]
    fn capacity_refusal_inserts_nothing() {
        let (mut table, bus) = table(1);
        let rx = bus.subscribe::<ReflectorEvent>();
        let now = LocalTime::from_secs(1);

        table.add_or_touch(&cs("R1"), addr(40001), now).unwrap();
        let err = table.add_or_touch(&cs("R2"), addr(40002), now).unwrap_err();
        assert_eq!(err, AddPeerError::CapacityExceeded);
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().refused, 1);

        // One connect for R1, nothing for R2.
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut table, _bus) = table(10);
        let now = LocalTime::from_secs(1);
        table.add_or_touch(&cs("R1"), addr(40001), now).unwrap();

        assert!(table.remove(&addr(40001), now, EventKind::Disconnect).is_some());
        assert!(table.remove(&addr(40001), now, EventKind::Disconnect).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn idle_peers_respect_timeout() {
        let (mut table, _bus) = table(10);
        table
            .add_or_touch(&cs("R1"), addr(40001), LocalTime::from_secs(0))
            .unwrap();
        table
            .add_or_touch(&cs("R2"), addr(40002), LocalTime::from_secs(50))
            .unwrap();

        let idle = table.idle_peers(LocalTime::from_secs(61), LocalDuration::from_secs(60));
        assert_eq!(idle, vec![addr(40001)]);
    }

    #[test]
    fn active_connections_track_table_size_over_any_sequence() {
        fn prop(ops: Vec<(u8, bool)>) -> bool {
            let (mut table, _bus) = table(64);
            let now = LocalTime::from_secs(1);
            for (slot, connecting) in ops {
                let addr = addr(42000 + slot as u16);
                if connecting {
                    let _ = table.add_or_touch(&cs("RN"), addr, now);
                } else {
                    table.remove(&addr, now, EventKind::Disconnect);
                }
                if table.stats().active_connections != table.len() {
                    return false;
                }
            }
            true
        }
        quickcheck::quickcheck(prop as fn(Vec<(u8, bool)>) -> bool);
    }

    #[test]
    fn active_count_tracks_table_size() {
        let (mut table, _bus) = table(10);
        let now = LocalTime::from_secs(1);
        for port in 0..5 {
            table
                .add_or_touch(&cs("R1"), addr(41000 + port), now)
                .unwrap();
        }
        table.remove(&addr(41000), now, EventKind::Disconnect);
        table.remove(&addr(41001), now, EventKind::Timeout);

        assert_eq!(table.stats().active_connections, table.len());
        assert_eq!(table.stats().active_connections, 3);
        assert_eq!(table.stats().total_connections, 5);
        assert_eq!(table.stats().timed_out, 1);
    }
}
