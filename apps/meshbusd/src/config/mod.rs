use config::Config;
use serde::Deserialize;

use std::path::PathBuf;

mod checkers;
mod logger;
pub use logger::LoggerConfig;

/// The daemon configuration file.
#[derive(Deserialize)]
pub struct DaemonConfig {
    /// Name identifying this host; unique across the cluster.
    pub server_name: String,

    /// Our own address, the one peers should dial. Must be an address
    /// present on a local interface.
    pub my_address: String,

    /// Loopback listener for local services.
    #[serde(default = "default_local_listen")]
    pub local_listen: String,

    /// Public listener for peer daemons. A loopback address disables peer
    /// listening entirely.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// UDP endpoint for signal messages (STOP, LOG, ...).
    #[serde(default = "default_signal")]
    pub signal: String,

    /// Initial comma-separated neighbor list.
    #[serde(default)]
    pub neighbors: String,

    /// Directory for the neighbor cache file.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Directory containing `<name>.service` files naming the services
    /// installed on this host.
    #[serde(default = "default_services_path")]
    pub services: PathBuf,

    /// Upper bound on live connections, listeners included.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Listen backlog for the TCP listeners.
    #[serde(default = "default_max_pending_connections")]
    pub max_pending_connections: u32,

    /// TLS material for the public listener. Both must be set together.
    #[serde(default)]
    pub ssl_certificate: Option<PathBuf>,
    #[serde(default)]
    pub ssl_private_key: Option<PathBuf>,

    /// User and group to drop privileges to after binding. Privilege
    /// dropping is handled by the service manager; these are accepted for
    /// compatibility.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub groupname: Option<String>,

    /// Trace lock-related traffic too.
    #[serde(default)]
    pub debug_lock_messages: bool,

    #[serde(default)]
    pub logger: LoggerConfig,
}

fn default_local_listen() -> String {
    "127.0.0.1:4040".to_owned()
}

fn default_listen() -> String {
    "0.0.0.0:4040".to_owned()
}

fn default_signal() -> String {
    "127.0.0.1:4041".to_owned()
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/cache/meshbus")
}

fn default_services_path() -> PathBuf {
    PathBuf::from("/usr/share/meshbus/services")
}

fn default_max_connections() -> usize {
    100
}

fn default_max_pending_connections() -> u32 {
    128
}

impl DaemonConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate the file and assemble the runnable configuration.
    pub fn to_bus_config(&self) -> eyre::Result<meshbus_bus::client::BusConfig> {
        checkers::check(self)
    }
}
