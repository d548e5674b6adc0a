use config::Config;
use serde::Deserialize;

use std::path::PathBuf;

use ysfr_bridge::BridgeConfig;

mod server;
pub use server::ServerConfig;

mod blocklist;
pub use blocklist::BlocklistConfig;

mod logger;
pub use logger::LoggerConfig;

#[derive(Deserialize)]
pub struct NodeConfig {
    pub server: ServerConfig,

    #[serde(default)]
    pub blocklist: BlocklistConfig,

    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,

    #[serde(default)]
    pub shutdown_timeout: Option<u64>,

    #[serde(default)]
    pub logger: LoggerConfig,
}

impl NodeConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
