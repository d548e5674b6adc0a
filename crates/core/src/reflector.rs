//! The reflector service: one UDP socket, one task, all state.
//!
//! Every mutation of the peer table, the floor and the mute map happens
//! inside the receive loop, so incoming frames, sweeps and handle
//! commands can never race each other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use event_bus::{typeid, EventBus};
use eyre::WrapErr;
use flume as chan;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use ysfr_protocol::{self as protocol, Callsign, Frame};

use crate::arbitrator::{Arbitrator, ArbitratorConfig};
use crate::blocklist::Blocklist;
use crate::event::{EventKind, ReflectorEvent};
use crate::handle::{Command, Handle, ReflectorStats};
use crate::peers::PeerTable;
use crate::ring::{TalkRing, DEFAULT_TALK_RING_CAPACITY};
use crate::time::{Clock, LocalDuration, LocalTime};

/// How often idle peers are swept out.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How often stalled talks are swept.
const TALK_SWEEP_INTERVAL: Duration = Duration::from_secs(2);
/// Largest datagram we ever expect; data frames are 155 bytes.
const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Address the UDP socket binds to.
    pub bind: SocketAddr,
    /// The reflector's own callsign, echoed in poll and status replies.
    pub callsign: Callsign,
    /// Peers silent longer than this are evicted.
    pub idle_timeout: LocalDuration,
    pub max_connections: usize,
    pub talk_max_duration: LocalDuration,
    /// How long an overrunning peer stays muted; zero means until it
    /// stops transmitting.
    pub unmute_after: LocalDuration,
    pub talk_inactivity_timeout: LocalDuration,
    pub talk_ring_capacity: usize,
}

impl ReflectorConfig {
    pub fn new(bind: SocketAddr, callsign: Callsign) -> Self {
        Self {
            bind,
            callsign,
            idle_timeout: LocalDuration::from_secs(300),
            max_connections: 200,
            talk_max_duration: LocalDuration::from_secs(180),
            unmute_after: LocalDuration::from_secs(60),
            talk_inactivity_timeout: LocalDuration::from_secs(3),
            talk_ring_capacity: DEFAULT_TALK_RING_CAPACITY,
        }
    }
}

/// The reflector service. Constructed bound, driven by [`Reflector::run`].
///
/// Bridges talk to their remotes over their own sockets; what they hear
/// comes back in through [`Command::InjectFrame`], and what local peers
/// transmit reaches them through the queues installed here.
pub struct Reflector<C: Clock> {
    config: ReflectorConfig,
    socket: Arc<UdpSocket>,
    table: PeerTable,
    arbitrator: Arbitrator,
    ring: TalkRing,
    bridges: HashMap<String, chan::Sender<Vec<u8>>>,
    clock: C,
    commands_tx: chan::Sender<Command>,
    commands_rx: chan::Receiver<Command>,
    malformed_frames: u64,
    send_errors: u64,
}

impl<C: Clock> Reflector<C> {
    /// Bind the socket and assemble the service. Binding failure is fatal
    /// to startup.
    pub async fn bind(
        config: ReflectorConfig,
        blocklist: Blocklist,
        full_event_bus: &EventBus,
        clock: C,
    ) -> eyre::Result<Self> {
        let event_bus = full_event_bus
            .extract(&typeid![ReflectorEvent], &[])
            .expect("event channels must be presented");

        let socket = UdpSocket::bind(config.bind)
            .await
            .wrap_err_with(|| format!("failed to bind reflector socket on {}", config.bind))?;
        info!(addr = %socket.local_addr()?, callsign = %config.callsign, "reflector listening");

        let (commands_tx, commands_rx) = chan::unbounded();
        let table = PeerTable::new(blocklist, config.max_connections, event_bus.clone());
        let arbitrator = Arbitrator::new(
            ArbitratorConfig {
                talk_max_duration: config.talk_max_duration,
                unmute_after: config.unmute_after,
                talk_inactivity_timeout: config.talk_inactivity_timeout,
            },
            event_bus.clone(),
        );
        let ring = TalkRing::new(config.talk_ring_capacity);

        Ok(Self {
            socket: Arc::new(socket),
            table,
            arbitrator,
            ring,
            bridges: HashMap::new(),
            clock,
            commands_tx,
            commands_rx,
            malformed_frames: 0,
            send_errors: 0,
            config,
        })
    }

    /// The bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// A handle for commands from other services.
    pub fn handle(&self) -> Handle {
        Handle::new(self.commands_tx.clone())
    }

    /// Drive the service until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let socket = self.socket.clone();
        let commands = self.commands_rx.clone();
        let mut idle_timer = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        let mut talk_timer = tokio::time::interval(TALK_SWEEP_INTERVAL);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.handle_datagram(addr, &buf[..len]).await,
                    Err(err) => {
                        self.send_errors += 1;
                        debug!(%err, "socket receive failed");
                    }
                },
                _ = talk_timer.tick() => self.sweep_talks(),
                _ = idle_timer.tick() => self.evict_idle(),
                command = commands.recv_async() => {
                    // The service holds a sender itself, so the channel
                    // cannot disconnect while we are running.
                    if let Ok(command) = command {
                        self.handle_command(command).await;
                    }
                }
                _ = cancellation.cancelled() => {
                    trace!("cancellation received, stopping reflector");
                    return;
                }
            }
        }
    }

    async fn handle_datagram(&mut self, addr: SocketAddr, buf: &[u8]) {
        let now = self.clock.local_time();

        let frame = match Frame::parse(buf) {
            Ok(frame) => frame,
            Err(err) => {
                self.malformed_frames += 1;
                debug!(%addr, %err, "dropping malformed datagram");
                return;
            }
        };

        match frame {
            Frame::Poll { callsign } => {
                if self.table.add_or_touch(&callsign, addr, now).is_err() {
                    return;
                }
                self.table.record_rx(&addr, buf.len());
                let reply = protocol::poll(&self.config.callsign);
                self.send_to(&reply, addr).await;
            }
            // Probes are monitoring traffic: answer, insert nothing.
            Frame::StatusProbe { .. } => {
                let reply = protocol::status(&self.config.callsign, self.table.len());
                self.send_to(&reply, addr).await;
            }
            Frame::Unlink { .. } => {
                self.remove_peer(&addr, now, EventKind::Disconnect);
            }
            Frame::Data { source, .. } => {
                if self.table.add_or_touch(&source, addr, now).is_err() {
                    return;
                }
                self.table.record_rx(&addr, buf.len());

                let peer = self.table.get_mut(&addr).expect("peer was just touched");
                let verdict = self.arbitrator.on_data(peer, now);
                if let Some(ended) = &verdict.ended {
                    self.ring.push(ended);
                }
                if verdict.forward {
                    self.fan_to_peers(buf, Some(addr)).await;
                    self.fan_to_bridges(buf);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let now = self.clock.local_time();
        match command {
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.table.summaries());
            }
            Command::TalkHistory { reply } => {
                let _ = reply.send(self.ring.records());
            }
            Command::Unlink { addr, reply } => {
                let _ = reply.send(self.remove_peer(&addr, now, EventKind::Disconnect));
            }
            Command::RegisterBridge { name, tx } => {
                debug!(bridge = %name, "bridge registered");
                self.bridges.insert(name, tx);
            }
            Command::UnregisterBridge { name } => {
                if self.bridges.remove(&name).is_some() {
                    debug!(bridge = %name, "bridge unregistered");
                }
            }
            // Bridge-originated traffic reaches local peers only: it is
            // never echoed back out to bridges and never takes the floor.
            Command::InjectFrame { bridge, frame } => {
                if self.bridges.contains_key(&bridge) {
                    self.fan_to_peers(&frame, None).await;
                }
            }
        }
    }

    /// Forward a datagram to every connected peer except `exclude`.
    /// A failed send never aborts the fan-out.
    async fn fan_to_peers(&mut self, buf: &[u8], exclude: Option<SocketAddr>) {
        let targets: Vec<SocketAddr> = self
            .table
            .iter()
            .map(|peer| peer.addr)
            .filter(|addr| Some(*addr) != exclude)
            .collect();

        for target in targets {
            let sent = self.socket.send_to(buf, target).await;
            match sent {
                Ok(sent) => self.table.record_tx(&target, sent),
                Err(err) => {
                    self.send_errors += 1;
                    debug!(%target, %err, "fan-out send failed");
                }
            }
        }
    }

    /// Queue a datagram towards every installed bridge. Queues shed load
    /// rather than block the receive loop.
    fn fan_to_bridges(&mut self, buf: &[u8]) {
        let mut errors = 0;
        for (name, tx) in &self.bridges {
            if tx.try_send(buf.to_vec()).is_err() {
                errors += 1;
                trace!(bridge = %name, "bridge queue full, frame dropped");
            }
        }
        self.send_errors += errors;
    }

    async fn send_to(&mut self, buf: &[u8], addr: SocketAddr) {
        let sent = self.socket.send_to(buf, addr).await;
        if let Err(err) = sent {
            self.send_errors += 1;
            debug!(%addr, %err, "send failed");
        }
    }

    /// Remove a peer, first releasing any talk state it holds so the
    /// `talk-end` precedes the `disconnect`/`timeout` event.
    fn remove_peer(&mut self, addr: &SocketAddr, now: LocalTime, kind: EventKind) -> bool {
        match self.table.get_mut(addr) {
            Some(peer) => {
                if let Some(ended) = self.arbitrator.peer_removed(peer, now) {
                    self.ring.push(&ended);
                }
                self.table.remove(addr, now, kind).is_some()
            }
            None => false,
        }
    }

    fn sweep_talks(&mut self) {
        let now = self.clock.local_time();
        for ended in self.arbitrator.sweep(&mut self.table, now) {
            self.ring.push(&ended);
        }
    }

    fn evict_idle(&mut self) {
        let now = self.clock.local_time();
        for addr in self.table.idle_peers(now, self.config.idle_timeout) {
            debug!(%addr, "peer idle, evicting");
            self.remove_peer(&addr, now, EventKind::Timeout);
        }
        if self.table.len() >= self.config.max_connections {
            warn!(
                connections = self.table.len(),
                "connection table at capacity"
            );
        }
    }

    fn stats(&self) -> ReflectorStats {
        ReflectorStats {
            reflector: self.config.callsign.to_string(),
            table: self.table.stats(),
            malformed_frames: self.malformed_frames,
            send_errors: self.send_errors,
            connected_bridges: self.bridges.len(),
        }
    }
}
