//! The native bridge runner: one outbound UDP session to a remote
//! reflector, with keep-alive, health probing and backoff reconnection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use event_bus::{typeid, EventBus};
use flume as chan;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use ysfr_core::{
    handle as core_handle, mask_addr, Clock, EventKind, Handle, LocalDuration, ReflectorEvent,
};
use ysfr_protocol::{self as protocol, Callsign, Frame, FrameKind};

use crate::backoff::backoff_delay;
use crate::config::{BridgeConfig, BridgeKind};
use crate::state::{BridgeState, BridgeStatus, Shared};

/// Keep-alive cadence while connected.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// How often the health decision runs.
const HEALTH_TICK: Duration = Duration::from_secs(5);

/// Why a session ended.
pub(crate) enum SessionEnd {
    /// The session token was cancelled; do not reconnect.
    Cancelled,
    /// Resolving or reaching the remote failed before connecting.
    ConnectFailed(String),
    /// The established session died (keep-alive failure, liveness lost).
    Lost(String),
}

/// A bridge speaking the native UDP protocol.
#[derive(Clone)]
pub struct NativeBridge<C: Clock> {
    name: String,
    remote: String,
    callsign: Callsign,
    config: BridgeConfig,
    core: Handle,
    event_bus: EventBus,
    clock: C,
    pub(crate) shared: Arc<Mutex<Shared>>,
}

impl<C: Clock> NativeBridge<C> {
    pub fn new(
        config: BridgeConfig,
        callsign: Callsign,
        core: Handle,
        full_event_bus: &EventBus,
        clock: C,
    ) -> eyre::Result<Self> {
        let remote = config.remote()?;
        let event_bus = full_event_bus
            .extract(&typeid![ReflectorEvent], &[])
            .expect("event channels must be presented");

        Ok(Self {
            name: config.name.clone(),
            remote,
            callsign,
            config,
            core,
            event_bus,
            clock,
            shared: Arc::new(Mutex::new(Shared::default())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn status(&self) -> BridgeStatus {
        self.shared
            .lock()
            .unwrap()
            .status(&self.name, BridgeKind::Native)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().state == BridgeState::Connected
    }

    pub fn set_next_schedule(&self, next: Option<ysfr_core::LocalTime>) {
        let mut shared = self.shared.lock().unwrap();
        shared.next_scheduled = next;
        if shared.state == BridgeState::Disconnected && next.is_some() {
            shared.state = BridgeState::Scheduled;
        }
    }

    /// Cancel the running session, if any. Idempotent.
    pub fn disconnect(&self) {
        if let Some(session) = self.shared.lock().unwrap().session.clone() {
            session.cancel();
        }
    }

    /// Run until cancelled, reconnecting forever (or until `max_retries`).
    pub async fn run_permanent(&self, cancellation: CancellationToken) {
        self.run_session_loop(cancellation, crate::backoff::PERMANENT_BACKOFF_CAP)
            .await
    }

    /// Run one scheduled session: the token carries the window deadline.
    pub async fn run_scheduled(&self, cancellation: CancellationToken) {
        self.run_session_loop(cancellation, crate::backoff::SCHEDULED_BACKOFF_CAP)
            .await
    }

    async fn run_session_loop(&self, cancellation: CancellationToken, backoff_cap: Duration) {
        self.shared.lock().unwrap().session = Some(cancellation.clone());
        let mut rng = fastrand::Rng::new();

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            match self.connect_and_serve(&cancellation).await {
                SessionEnd::Cancelled => break,
                SessionEnd::ConnectFailed(err) => {
                    warn!(bridge = %self.name, %err, "bridge connect failed");
                    self.set_state(BridgeState::Failed, Some(err));
                }
                SessionEnd::Lost(err) => {
                    warn!(bridge = %self.name, %err, "bridge session lost");
                }
            }

            let retry_count = {
                let mut shared = self.shared.lock().unwrap();
                shared.retry_count += 1;
                shared.retry_count
            };

            if self.config.max_retries > 0 && retry_count >= self.config.max_retries {
                warn!(
                    bridge = %self.name,
                    retry_count,
                    "bridge exhausted its retries, giving up"
                );
                break;
            }

            let delay = backoff_delay(
                self.config.retry_delay(),
                retry_count.saturating_sub(1),
                backoff_cap,
                &mut rng,
            );
            debug!(bridge = %self.name, ?delay, retry_count, "bridge retrying after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => break,
            }
        }

        self.shared.lock().unwrap().session = None;
    }

    /// One connection attempt and, if it succeeds, the whole session.
    async fn connect_and_serve(&self, cancellation: &CancellationToken) -> SessionEnd {
        self.set_state(BridgeState::Connecting, None);

        let remote_addr = match tokio::net::lookup_host(&self.remote).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    return SessionEnd::ConnectFailed(format!(
                        "no address found for {}",
                        self.remote
                    ))
                }
            },
            Err(err) => {
                return SessionEnd::ConnectFailed(format!(
                    "failed to resolve {}: {err}",
                    self.remote
                ))
            }
        };

        let socket = match self.open_socket(remote_addr).await {
            Ok(socket) => socket,
            Err(err) => return SessionEnd::ConnectFailed(err.to_string()),
        };

        // Handshake: one poll frame. Liveness is proven by the ping/pong
        // loop, not by waiting for a reply here.
        if let Err(err) = socket.send(&protocol::poll(&self.callsign)).await {
            return SessionEnd::ConnectFailed(format!("handshake send failed: {err}"));
        }

        let (queue_tx, queue_rx) = core_handle::bridge_queue();
        if self.core.register_bridge(&self.name, queue_tx).is_err() {
            return SessionEnd::Cancelled;
        }

        {
            let now = self.clock.local_time();
            let mut shared = self.shared.lock().unwrap();
            shared.remote = Some(remote_addr);
            shared.connected_at = Some(now);
            shared.retry_count = 0;
            shared.last_error = None;
            shared.last_packet_rx = Some(now);
            shared.ping_outstanding = false;
            shared.last_ping = None;
        }
        self.set_state(BridgeState::Connected, None);
        info!(bridge = %self.name, remote = %mask_addr(&remote_addr), "bridge connected");

        let end = self.serve(&socket, queue_rx, cancellation).await;

        // Best-effort unlink; the socket may already be dead.
        let _ = socket.send(&protocol::unlink(&self.callsign)).await;
        let _ = self.core.unregister_bridge(&self.name);

        let error = match &end {
            SessionEnd::Lost(err) => Some(err.clone()),
            _ => None,
        };
        self.set_state(BridgeState::Disconnected, error);
        end
    }

    async fn open_socket(&self, remote: SocketAddr) -> std::io::Result<UdpSocket> {
        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        Ok(socket)
    }

    async fn serve(
        &self,
        socket: &UdpSocket,
        queue_rx: chan::Receiver<Vec<u8>>,
        cancellation: &CancellationToken,
    ) -> SessionEnd {
        let start = tokio::time::Instant::now();
        let mut keepalive = tokio::time::interval_at(start + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        let mut health = tokio::time::interval_at(start + HEALTH_TICK, HEALTH_TICK);
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => self.on_packet(&buf[..len]),
                    Err(err) => {
                        // A single read error is transient; the liveness
                        // watchdog catches a dead remote.
                        trace!(bridge = %self.name, %err, "bridge receive error");
                    }
                },
                frame = queue_rx.recv_async() => {
                    let Ok(frame) = frame else {
                        return SessionEnd::Lost("transmit queue closed".to_owned());
                    };
                    let sent = socket.send(&frame).await;
                    match sent {
                        Ok(sent) => {
                            let mut shared = self.shared.lock().unwrap();
                            shared.packets_tx += 1;
                            shared.bytes_tx += sent as u64;
                        }
                        Err(err) => {
                            return SessionEnd::Lost(format!("forward send failed: {err}"));
                        }
                    }
                }
                _ = keepalive.tick() => {
                    let frame = protocol::status(&self.callsign, 0);
                    if let Err(err) = socket.send(&frame).await {
                        return SessionEnd::Lost(format!("keep-alive send failed: {err}"));
                    }
                    trace!(bridge = %self.name, "keep-alive sent");
                }
                _ = health.tick() => {
                    if let Some(end) = self.health_tick(socket).await {
                        return end;
                    }
                }
                _ = cancellation.cancelled() => {
                    debug!(bridge = %self.name, "bridge session cancelled");
                    return SessionEnd::Cancelled;
                }
            }
        }
    }

    /// Account a packet from the remote. Any packet is proof of life; data
    /// frames are handed to the reflector for local fan-out.
    fn on_packet(&self, buf: &[u8]) {
        let now = self.clock.local_time();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.packets_rx += 1;
            shared.bytes_rx += buf.len() as u64;
            shared.last_packet_rx = Some(now);
            shared.ping_outstanding = false;
        }

        match Frame::parse(buf) {
            Ok(frame) if frame.kind() == FrameKind::Data => {
                let _ = self.core.inject_frame(&self.name, buf.to_vec());
            }
            Ok(_) => {}
            Err(err) => {
                trace!(bridge = %self.name, %err, "unparseable frame from remote");
            }
        }
    }

    /// The periodic health decision. Returns the session end when the
    /// liveness watchdog trips. The lock is released before any send.
    async fn health_tick(&self, socket: &UdpSocket) -> Option<SessionEnd> {
        let interval = LocalDuration::from(self.config.health_interval()?);
        let now = self.clock.local_time();

        enum Action {
            None,
            SendPing,
        }

        let action = {
            let mut shared = self.shared.lock().unwrap();

            if let Some(last_rx) = shared.last_packet_rx {
                if now - last_rx > interval * 2 {
                    return Some(SessionEnd::Lost("no packets received".to_owned()));
                }
            }

            match (shared.ping_outstanding, shared.last_ping) {
                (true, Some(last_ping)) if now - last_ping > interval => {
                    // Unhealthy: let the next cycle send a fresh ping.
                    warn!(bridge = %self.name, "ping unanswered, connection unhealthy");
                    shared.ping_outstanding = false;
                    Action::None
                }
                (false, last_ping)
                    if last_ping.map_or(true, |last| now - last >= interval) =>
                {
                    shared.ping_outstanding = true;
                    shared.last_ping = Some(now);
                    Action::SendPing
                }
                _ => Action::None,
            }
        };

        if let Action::SendPing = action {
            trace!(bridge = %self.name, "sending ping");
            if let Err(err) = socket.send(&protocol::poll(&self.callsign)).await {
                return Some(SessionEnd::Lost(format!("ping send failed: {err}")));
            }
        }
        None
    }

    /// Record a state transition and publish it.
    pub(crate) fn set_state(&self, state: BridgeState, error: Option<String>) {
        let now = self.clock.local_time();
        let address = {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == state {
                return;
            }
            shared.state = state;
            if error.is_some() {
                shared.last_error = error.clone();
            }
            if state == BridgeState::Disconnected {
                shared.disconnected_at = Some(now);
            }
            shared
                .remote
                .map(|addr| mask_addr(&addr))
                .unwrap_or_else(|| "-".to_owned())
        };

        self.event_bus.publish(ReflectorEvent {
            kind: EventKind::BridgeStateChange,
            callsign: self.name.clone(),
            address,
            timestamp: now.as_millis(),
            duration_ms: None,
            detail: Some(state.to_string()),
        });
    }
}
