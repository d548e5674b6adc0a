//! Reflector state-change events.

use std::net::SocketAddr;

use serde::Serialize;

use crate::time::{LocalDuration, LocalTime};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A peer completed its first accepted handshake.
    Connect,
    /// A peer unlinked or was removed.
    Disconnect,
    /// A peer acquired the floor.
    TalkStart,
    /// A peer's transmission ended.
    TalkEnd,
    /// A peer was evicted for inactivity, or overran the talk limit.
    Timeout,
    /// A handshake was refused by the blocklist.
    Blocked,
    /// A bridge changed state.
    BridgeStateChange,
}

/// An immutable state-change record published on the event bus.
///
/// Addresses are masked here, at the edge: consumers (telemetry, log
/// sinks, dashboard forwarders) never see full peer addresses.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectorEvent {
    pub kind: EventKind,
    pub callsign: String,
    pub address: String,
    /// Milliseconds since Epoch.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReflectorEvent {
    pub fn new(kind: EventKind, callsign: &str, addr: &SocketAddr, now: LocalTime) -> Self {
        Self {
            kind,
            callsign: callsign.to_owned(),
            address: mask_addr(addr),
            timestamp: now.as_millis(),
            duration_ms: None,
            detail: None,
        }
    }

    pub fn with_duration(mut self, duration: LocalDuration) -> Self {
        self.duration_ms = Some(duration.as_millis());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Mask an address for external surfaces: the last two IPv4 octets are
/// replaced. IPv6 hosts are masked wholesale.
pub fn mask_addr(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => {
            let octets = v4.ip().octets();
            format!("{}.{}.**:{}", octets[0], octets[1], v4.port())
        }
        SocketAddr::V6(v6) => format!("[**]:{}", v6.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_last_two_octets() {
        let addr: SocketAddr = "192.168.12.34:42000".parse().unwrap();
        assert_eq!(mask_addr(&addr), "192.168.**:42000");
    }

    #[test]
    fn serializes_kebab_case_kind() {
        let addr: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        let event = ReflectorEvent::new(
            EventKind::TalkStart,
            "R1",
            &addr,
            LocalTime::from_secs(1),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "talk-start");
        assert_eq!(json["address"], "10.0.**:1234");
        assert!(json.get("duration_ms").is_none());
    }
}
