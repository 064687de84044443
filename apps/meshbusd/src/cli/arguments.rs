use std::path::PathBuf;

use clap::Args;

#[derive(Args)]
pub struct Run {
    /// Path to the configuration file.
    #[clap(long, short, default_value = "/etc/meshbus/meshbusd.toml")]
    pub config: PathBuf,
}
