use std::path::PathBuf;

use clap::Args;

#[derive(Args)]
pub struct Run {
    /// Path to the TOML configuration file.
    #[clap(short, long, default_value = "ysfrd.toml")]
    pub config: PathBuf,
}
