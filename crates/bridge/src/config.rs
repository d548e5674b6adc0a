use std::time::Duration;

use eyre::{ensure, OptionExt};
use serde::{Deserialize, Serialize};

/// Default scheduled-session length.
const DEFAULT_DURATION_SECS: u64 = 3600;
/// Default base delay between reconnection attempts.
const DEFAULT_RETRY_DELAY_SECS: u64 = 30;

/// Transport flavour of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeKind {
    /// Speaks the reflector's native UDP protocol.
    #[default]
    Native,
    /// Delegates to an external network adapter.
    External,
}

impl std::fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Declarative description of one outbound bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub name: String,
    #[serde(default)]
    pub kind: BridgeKind,
    /// Remote host, required for native bridges.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Callsign used in handshakes; defaults to the reflector's own.
    #[serde(default)]
    pub callsign: Option<String>,
    /// A permanent bridge connects at startup and stays up. Wins over
    /// `schedule` when both are set.
    #[serde(default)]
    pub permanent: bool,
    /// Cron expression, 5- or 6-field.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Scheduled-session length.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Reconnection attempts before giving up; zero means no limit.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Ping/pong probing interval; zero disables health probing.
    #[serde(default)]
    pub health_check_secs: u64,
}

fn default_duration_secs() -> u64 {
    DEFAULT_DURATION_SECS
}

fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

impl BridgeConfig {
    /// The `host:port` string for native bridges.
    pub fn remote(&self) -> eyre::Result<String> {
        let host = self
            .host
            .as_deref()
            .ok_or_eyre("native bridge requires a host")?;
        let port = self.port.ok_or_eyre("native bridge requires a port")?;
        ensure!(!host.is_empty(), "native bridge host must not be empty");
        Ok(format!("{host}:{port}"))
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// `None` when health probing is disabled.
    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_check_secs > 0).then(|| Duration::from_secs(self.health_check_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_requires_host_and_port() {
        let config = BridgeConfig {
            name: "a".into(),
            kind: BridgeKind::Native,
            host: Some("reflector.example.org".into()),
            port: Some(42000),
            callsign: None,
            permanent: true,
            schedule: None,
            duration_secs: 60,
            max_retries: 0,
            retry_delay_secs: 30,
            health_check_secs: 0,
        };
        assert_eq!(config.remote().unwrap(), "reflector.example.org:42000");

        let missing = BridgeConfig {
            port: None,
            ..config
        };
        assert!(missing.remote().is_err());
    }
}
