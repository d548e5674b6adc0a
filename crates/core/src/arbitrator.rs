//! Single-active-stream arbitration.
//!
//! At most one peer holds the floor at any instant. The arbitrator owns
//! the floor slot and the mute map, decides per data frame whether to
//! forward, and stops talks that overrun the limit or go silent.

use std::collections::HashMap;
use std::net::SocketAddr;

use event_bus::EventBus;
use tracing::debug;

use crate::event::{EventKind, ReflectorEvent};
use crate::peer::Peer;
use crate::peers::PeerTable;
use crate::time::{LocalDuration, LocalTime};

/// The current floor holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveStream {
    addr: SocketAddr,
    started_at: LocalTime,
}

/// A transmission that just ended. Fed into the talk ring by the service.
#[derive(Debug, Clone)]
pub struct EndedTalk {
    pub callsign: String,
    pub addr: SocketAddr,
    pub started_at: LocalTime,
    pub duration: LocalDuration,
}

/// Outcome of arbitrating one data frame.
#[derive(Debug, Default)]
pub struct DataVerdict {
    /// Whether the frame is fanned out.
    pub forward: bool,
    /// A talk stopped as a side effect (overrun).
    pub ended: Option<EndedTalk>,
}

#[derive(Debug, Clone, Copy)]
pub struct ArbitratorConfig {
    /// Longest allowed continuous transmission.
    pub talk_max_duration: LocalDuration,
    /// How long an overrunning peer stays muted. Zero means "until the
    /// peer next stops transmitting".
    pub unmute_after: LocalDuration,
    /// Silence after which a talk is considered over.
    pub talk_inactivity_timeout: LocalDuration,
}

#[derive(Debug)]
pub struct Arbitrator {
    active: Option<ActiveStream>,
    /// Muted addresses. The zero time is the "until next stop" sentinel;
    /// any other value is an instant after which the mute lapses.
    mutes: HashMap<SocketAddr, LocalTime>,
    config: ArbitratorConfig,
    event_bus: EventBus,
}

impl Arbitrator {
    pub fn new(config: ArbitratorConfig, event_bus: EventBus) -> Self {
        Self {
            active: None,
            mutes: HashMap::new(),
            config,
            event_bus,
        }
    }

    /// The floor holder, if any.
    pub fn active_addr(&self) -> Option<SocketAddr> {
        self.active.map(|stream| stream.addr)
    }

    pub fn is_muted(&self, addr: &SocketAddr) -> bool {
        self.mutes.contains_key(addr)
    }

    /// Arbitrate one data frame from a connected peer.
    pub fn on_data(&mut self, peer: &mut Peer, now: LocalTime) -> DataVerdict {
        // Mute check comes first: a muted peer's frames update no talk
        // state at all.
        if let Some(&until) = self.mutes.get(&peer.addr) {
            if until.is_zero() || now < until {
                return DataVerdict::default();
            }
            self.mutes.remove(&peer.addr);
            debug!(callsign = %peer.callsign, addr = %peer.addr, "mute lapsed");
        }

        match self.active {
            None => {
                self.active = Some(ActiveStream {
                    addr: peer.addr,
                    started_at: now,
                });
                peer.talk_start = Some(now);
                peer.last_data = now;
                debug!(callsign = %peer.callsign, addr = %peer.addr, "talk started");
                self.event_bus.publish(ReflectorEvent::new(
                    EventKind::TalkStart,
                    peer.callsign.as_str(),
                    &peer.addr,
                    now,
                ));
                DataVerdict {
                    forward: true,
                    ended: None,
                }
            }
            Some(stream) if stream.addr == peer.addr => {
                peer.last_data = now;
                if now - stream.started_at > self.config.talk_max_duration {
                    let ended = self.overrun(peer, stream.started_at, now);
                    DataVerdict {
                        forward: false,
                        ended: Some(ended),
                    }
                } else {
                    DataVerdict {
                        forward: true,
                        ended: None,
                    }
                }
            }
            // Contention: a non-holder's frames are dropped silently.
            Some(_) => DataVerdict::default(),
        }
    }

    /// Stop the floor holder for overrunning the talk limit: mute it,
    /// release the floor, emit `timeout` then `talk-end`.
    fn overrun(&mut self, peer: &mut Peer, started_at: LocalTime, now: LocalTime) -> EndedTalk {
        let until = if self.config.unmute_after.is_zero() {
            LocalTime::default()
        } else {
            now + self.config.unmute_after
        };
        self.mutes.insert(peer.addr, until);
        self.active = None;
        peer.talk_start = None;

        let duration = now - started_at;
        debug!(
            callsign = %peer.callsign,
            addr = %peer.addr,
            %duration,
            "talk overran the limit, peer muted"
        );
        self.event_bus.publish(ReflectorEvent::new(
            EventKind::Timeout,
            peer.callsign.as_str(),
            &peer.addr,
            now,
        ));
        self.event_bus.publish(
            ReflectorEvent::new(EventKind::TalkEnd, peer.callsign.as_str(), &peer.addr, now)
                .with_duration(duration),
        );
        EndedTalk {
            callsign: peer.callsign.to_string(),
            addr: peer.addr,
            started_at,
            duration,
        }
    }

    /// The talk-inactivity sweep: stop talks whose last data frame is
    /// older than the inactivity timeout, and expire lapsed mutes.
    pub fn sweep(&mut self, table: &mut PeerTable, now: LocalTime) -> Vec<EndedTalk> {
        let silent: Vec<SocketAddr> = table
            .iter()
            .filter(|peer| {
                peer.talk_start.is_some()
                    && now - peer.last_data > self.config.talk_inactivity_timeout
            })
            .map(|peer| peer.addr)
            .collect();

        let mut ended = Vec::new();
        for addr in silent {
            if let Some(peer) = table.get_mut(&addr) {
                if let Some(talk) = self.stop_talk(peer, now) {
                    ended.push(talk);
                }
            }
        }

        // Timed mutes lapse when their instant passes. The zero-time
        // sentinel lapses once the peer has stopped transmitting (or is
        // gone entirely).
        let inactivity = self.config.talk_inactivity_timeout;
        self.mutes.retain(|addr, until| {
            if until.is_zero() {
                match table.get(addr) {
                    Some(peer) => now - peer.last_seen <= inactivity,
                    None => false,
                }
            } else {
                now < *until
            }
        });

        ended
    }

    /// Stop a peer's talk (if talking), releasing the floor and emitting
    /// `talk-end` with the computed duration.
    pub fn stop_talk(&mut self, peer: &mut Peer, now: LocalTime) -> Option<EndedTalk> {
        let started_at = peer.talk_start.take()?;
        if self.active.map(|stream| stream.addr) == Some(peer.addr) {
            self.active = None;
        }

        let duration = now - started_at;
        debug!(callsign = %peer.callsign, addr = %peer.addr, %duration, "talk ended");
        self.event_bus.publish(
            ReflectorEvent::new(EventKind::TalkEnd, peer.callsign.as_str(), &peer.addr, now)
                .with_duration(duration),
        );
        Some(EndedTalk {
            callsign: peer.callsign.to_string(),
            addr: peer.addr,
            started_at,
            duration,
        })
    }

    /// Forget everything about a peer that is leaving the table. Returns
    /// the ended talk when the peer held the floor.
    pub fn peer_removed(&mut self, peer: &mut Peer, now: LocalTime) -> Option<EndedTalk> {
        self.mutes.remove(&peer.addr);
        self.stop_talk(peer, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::Blocklist;
    use event_bus::EventBus;
    use ysfr_protocol::Callsign;

    const TALK_MAX: LocalDuration = LocalDuration::from_millis(100);
    const INACTIVITY: LocalDuration = LocalDuration::from_secs(3);

    fn setup(unmute_after: LocalDuration) -> (Arbitrator, PeerTable, EventBus) {
        let mut bus = EventBus::default();
        bus.register::<ReflectorEvent>(Some(256));
        let arbitrator = Arbitrator::new(
            ArbitratorConfig {
                talk_max_duration: TALK_MAX,
                unmute_after,
                talk_inactivity_timeout: INACTIVITY,
            },
            bus.clone(),
        );
        let table = PeerTable::new(Blocklist::default(), 16, bus.clone());
        (arbitrator, table, bus)
    }

    fn connect(table: &mut PeerTable, callsign: &str, port: u16, now: LocalTime) -> SocketAddr {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        table
            .add_or_touch(&Callsign::new(callsign).unwrap(), addr, now)
            .unwrap();
        addr
    }

    fn drain(bus: &event_bus::Receiver<ReflectorEvent>) -> Vec<EventKind> {
        std::iter::from_fn(|| bus.try_recv()).map(|e| e.kind).collect()
    }

    #[test]
    fn first_frame_takes_the_floor_and_contender_is_dropped() {
        let (mut arb, mut table, bus) = setup(LocalDuration::ZERO);
        let rx = bus.subscribe::<ReflectorEvent>();
        let t0 = LocalTime::from_secs(10);

        let p1 = connect(&mut table, "R1", 40001, t0);
        let p2 = connect(&mut table, "R2", 40002, t0);
        rx.try_recv();
        rx.try_recv();

        let verdict = arb.on_data(table.get_mut(&p1).unwrap(), t0);
        assert!(verdict.forward);
        assert_eq!(arb.active_addr(), Some(p1));

        // Contender: dropped with no event.
        let verdict = arb.on_data(
            table.get_mut(&p2).unwrap(),
            t0 + LocalDuration::from_millis(10),
        );
        assert!(!verdict.forward);

        assert_eq!(drain(&rx), vec![EventKind::TalkStart]);

        // After >3s of silence the sweeper releases the floor.
        let t1 = t0 + LocalDuration::from_millis(3100);
        let ended = arb.sweep(&mut table, t1);
        assert_eq!(ended.len(), 1);
        assert_eq!(arb.active_addr(), None);
        assert!(!table.get(&p1).unwrap().is_talking());
        assert_eq!(drain(&rx), vec![EventKind::TalkEnd]);

        // Now the other peer can acquire the floor.
        let t2 = t0 + LocalDuration::from_secs(4);
        assert!(arb.on_data(table.get_mut(&p2).unwrap(), t2).forward);
        assert_eq!(drain(&rx), vec![EventKind::TalkStart]);
    }

    #[test]
    fn overrun_mutes_until_stop() {
        let (mut arb, mut table, bus) = setup(LocalDuration::ZERO);
        let rx = bus.subscribe::<ReflectorEvent>();
        let t0 = LocalTime::from_secs(100);
        let addr = connect(&mut table, "R1", 40001, t0);
        rx.try_recv();

        // Continuous transmission for 150ms in 10ms steps.
        let mut kinds = Vec::new();
        for step in 0..=15u64 {
            let now = t0 + LocalDuration::from_millis(step * 10);
            table
                .add_or_touch(&Callsign::new("R1").unwrap(), addr, now)
                .unwrap();
            arb.on_data(table.get_mut(&addr).unwrap(), now);
            kinds.extend(drain(&rx));
        }

        assert_eq!(
            kinds,
            vec![EventKind::TalkStart, EventKind::Timeout, EventKind::TalkEnd]
        );
        assert!(arb.is_muted(&addr));
        assert_eq!(arb.active_addr(), None);

        // Still transmitting: frames stay dropped, no events.
        let now = t0 + LocalDuration::from_millis(200);
        table
            .add_or_touch(&Callsign::new("R1").unwrap(), addr, now)
            .unwrap();
        assert!(!arb.on_data(table.get_mut(&addr).unwrap(), now).forward);
        assert!(drain(&rx).is_empty());

        // The peer stops; once silence exceeds the inactivity window the
        // sweep clears the zero-time mute.
        let later = now + LocalDuration::from_secs(4);
        arb.sweep(&mut table, later);
        assert!(!arb.is_muted(&addr));

        assert!(arb.on_data(table.get_mut(&addr).unwrap(), later).forward);
        assert_eq!(drain(&rx), vec![EventKind::TalkStart]);
    }

    #[test]
    fn timed_mute_expires_on_next_frame() {
        let (mut arb, mut table, bus) = setup(LocalDuration::from_millis(50));
        let rx = bus.subscribe::<ReflectorEvent>();
        let t0 = LocalTime::from_secs(100);
        let addr = connect(&mut table, "R1", 40001, t0);
        rx.try_recv();

        assert!(arb.on_data(table.get_mut(&addr).unwrap(), t0).forward);
        // Overrun at t0+110ms.
        let overrun_at = t0 + LocalDuration::from_millis(110);
        let verdict = arb.on_data(table.get_mut(&addr).unwrap(), overrun_at);
        assert!(!verdict.forward);
        assert!(verdict.ended.is_some());
        assert!(arb.is_muted(&addr));

        // Before the mute lapses: dropped.
        let early = overrun_at + LocalDuration::from_millis(20);
        assert!(!arb.on_data(table.get_mut(&addr).unwrap(), early).forward);

        // After it lapses a new frame clears the mute and takes the floor.
        let retry = overrun_at + LocalDuration::from_millis(60);
        assert!(arb.on_data(table.get_mut(&addr).unwrap(), retry).forward);
        assert!(!arb.is_muted(&addr));
        assert_eq!(arb.active_addr(), Some(addr));

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TalkStart,
                EventKind::Timeout,
                EventKind::TalkEnd,
                EventKind::TalkStart
            ]
        );
    }

    #[test]
    fn removal_clears_floor_and_mute() {
        let (mut arb, mut table, bus) = setup(LocalDuration::ZERO);
        let rx = bus.subscribe::<ReflectorEvent>();
        let t0 = LocalTime::from_secs(5);
        let addr = connect(&mut table, "R1", 40001, t0);
        rx.try_recv();

        arb.on_data(table.get_mut(&addr).unwrap(), t0);
        assert_eq!(arb.active_addr(), Some(addr));

        let now = t0 + LocalDuration::from_secs(1);
        let ended = arb.peer_removed(table.get_mut(&addr).unwrap(), now);
        table.remove(&addr, now, EventKind::Disconnect);

        assert_eq!(arb.active_addr(), None);
        assert!(!arb.is_muted(&addr));
        assert_eq!(ended.unwrap().duration, LocalDuration::from_secs(1));
        assert_eq!(
            drain(&rx),
            vec![EventKind::TalkStart, EventKind::TalkEnd, EventKind::Disconnect]
        );
    }

    #[test]
    fn at_most_one_talker_over_any_interleaving() {
        fn prop(steps: Vec<(u8, u8)>) -> bool {
            let (mut arb, mut table, _bus) = setup(LocalDuration::ZERO);
            let t0 = LocalTime::from_secs(1);
            let addrs: Vec<SocketAddr> = (0..4)
                .map(|n| connect(&mut table, "RN", 42000 + n, t0))
                .collect();

            let mut now = t0;
            for (slot, advance) in steps {
                now = now + LocalDuration::from_millis(advance as u64 * 10);
                if slot % 5 == 4 {
                    arb.sweep(&mut table, now);
                } else {
                    let addr = addrs[(slot % 4) as usize];
                    arb.on_data(table.get_mut(&addr).unwrap(), now);
                }

                let talking = table.iter().filter(|p| p.is_talking()).count();
                if talking > 1 {
                    return false;
                }
                if let Some(holder) = arb.active_addr() {
                    if arb.is_muted(&holder) {
                        return false;
                    }
                }
            }
            true
        }
        quickcheck::quickcheck(prop as fn(Vec<(u8, u8)>) -> bool);
    }
}
