use std::net::ToSocketAddrs;

use eyre::{Context, OptionExt};
use serde::Deserialize;

use ysfr_core::{LocalDuration, ReflectorConfig};
use ysfr_protocol::Callsign;

/// Default number of simultaneously connected peers.
pub const DEFAULT_MAX_CONNECTIONS: usize = 200;
/// Default idle eviction timeout, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
/// Default longest continuous transmission, in seconds.
pub const DEFAULT_TALK_MAX_SECS: u64 = 180;
/// Default automatic unmute delay after an overrun, in seconds.
pub const DEFAULT_UNMUTE_AFTER_SECS: u64 = 60;
/// Default silence after which a talk is considered over, in seconds.
pub const DEFAULT_TALK_INACTIVITY_SECS: u64 = 3;

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    /// Address to bind the reflector socket to.
    pub address: String,
    /// The reflector's callsign, echoed in poll and status replies.
    pub name: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_talk_max_secs")]
    pub talk_max_secs: u64,
    /// Zero keeps an overrunning peer muted until it stops transmitting.
    #[serde(default = "default_unmute_after_secs")]
    pub unmute_after_secs: u64,
    #[serde(default = "default_talk_inactivity_secs")]
    pub talk_inactivity_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_talk_max_secs() -> u64 {
    DEFAULT_TALK_MAX_SECS
}

fn default_unmute_after_secs() -> u64 {
    DEFAULT_UNMUTE_AFTER_SECS
}

fn default_talk_inactivity_secs() -> u64 {
    DEFAULT_TALK_INACTIVITY_SECS
}

impl ServerConfig {
    pub fn to_reflector_config(&self) -> eyre::Result<ReflectorConfig> {
        let bind = self
            .address
            .to_socket_addrs()
            .wrap_err("Failed to resolve bind address")?
            .next()
            .ok_or_eyre("No address found in bind address")?;

        let callsign =
            Callsign::new(&self.name).wrap_err("Invalid reflector name")?;

        let mut config = ReflectorConfig::new(bind, callsign);
        config.idle_timeout = LocalDuration::from_secs(self.idle_timeout_secs);
        config.max_connections = self.max_connections;
        config.talk_max_duration = LocalDuration::from_secs(self.talk_max_secs);
        config.unmute_after = LocalDuration::from_secs(self.unmute_after_secs);
        config.talk_inactivity_timeout = LocalDuration::from_secs(self.talk_inactivity_secs);
        Ok(config)
    }
}
