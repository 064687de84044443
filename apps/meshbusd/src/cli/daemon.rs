use tokio_util::sync::CancellationToken;
use tracing::debug;

use meshbus_bus::client::{BusClient, Handle};
use meshbus_bus::net::{ReactorTcp, Waker};

use crate::config::DaemonConfig;

/// The daemon: one reactor driving the bus service.
pub struct Daemon {
    client: BusClient<ReactorTcp>,
    cancellation: CancellationToken,
}

impl Daemon {
    pub fn new(config: &DaemonConfig) -> eyre::Result<Self> {
        let bus_config = config.to_bus_config()?;

        debug!(
            "starting as \"{}\" on {}, {} local service(s) known",
            bus_config.server_name,
            bus_config.my_address,
            bus_config.local_services.len()
        );

        let client = BusClient::new(bus_config)?;

        Ok(Self {
            client,
            cancellation: CancellationToken::new(),
        })
    }

    /// A handle to send commands to the running daemon.
    pub fn handle(&self) -> Handle<Waker> {
        self.client.handle()
    }

    /// A token that aborts the reactor outright; the orderly path is
    /// [`Handle::stop`].
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Run until the daemon quiesces. Returns whether a RELOADCONFIG asked
    /// for the process to be restarted.
    pub async fn run(self) -> eyre::Result<bool> {
        Ok(self.client.run(self.cancellation).await?)
    }
}
