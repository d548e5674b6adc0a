use serde::Deserialize;

use ysfr_core::Blocklist;

#[derive(Deserialize, Clone, Default)]
pub struct BlocklistConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub callsigns: Vec<String>,
}

impl BlocklistConfig {
    pub fn to_blocklist(&self) -> Blocklist {
        if self.enabled {
            Blocklist::new(&self.callsigns)
        } else {
            Blocklist::default()
        }
    }
}
