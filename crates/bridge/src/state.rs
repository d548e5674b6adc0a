use std::net::SocketAddr;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use ysfr_core::LocalTime;

use crate::config::BridgeKind;

/// Bridge lifecycle state. Transitions are monotonic within one session;
/// a new session resets the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Scheduled,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Scheduled => "scheduled",
        };
        f.write_str(name)
    }
}

/// External view of one bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub name: String,
    pub kind: BridgeKind,
    pub state: BridgeState,
    pub connected_at: Option<u64>,
    pub disconnected_at: Option<u64>,
    pub next_scheduled: Option<u64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub last_packet_rx: Option<u64>,
    pub missed_windows: u64,
}

/// Mutable bridge state, behind a short-held lock that is never crossed
/// with I/O.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub state: BridgeState,
    pub remote: Option<SocketAddr>,
    pub connected_at: Option<LocalTime>,
    pub disconnected_at: Option<LocalTime>,
    pub next_scheduled: Option<LocalTime>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub last_packet_rx: Option<LocalTime>,
    pub ping_outstanding: bool,
    pub last_ping: Option<LocalTime>,
    pub missed_windows: u64,
    /// Token of the session currently driving this bridge, for external
    /// disconnects.
    pub session: Option<CancellationToken>,
}

impl Shared {
    pub fn status(&self, name: &str, kind: BridgeKind) -> BridgeStatus {
        BridgeStatus {
            name: name.to_owned(),
            kind,
            state: self.state,
            connected_at: self.connected_at.map(|t| t.as_millis()),
            disconnected_at: self.disconnected_at.map(|t| t.as_millis()),
            next_scheduled: self.next_scheduled.map(|t| t.as_millis()),
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            packets_rx: self.packets_rx,
            packets_tx: self.packets_tx,
            bytes_rx: self.bytes_rx,
            bytes_tx: self.bytes_tx,
            last_packet_rx: self.last_packet_rx.map(|t| t.as_millis()),
            missed_windows: self.missed_windows,
        }
    }
}
