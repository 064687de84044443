//! The runnable daemon client: a reactor driving the bus service.
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time;

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

use crate::client::error::Error;
use crate::client::handle;
use crate::client::service::Service;
use crate::common::addr::CanonicalAddr;
use crate::fsm::event::Event;
use crate::fsm::handler;
use crate::fsm::handler::{Command, SessionInfo};
use crate::fsm::loadavg::RemoteSample;
use crate::net::{ListenConfig, NetReactor, NetWaker};

/// Daemon configuration, assembled by the binary from its config file.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// This host's name, unique across the cluster.
    pub server_name: String,
    /// Our canonical address, as peers should dial it.
    pub my_address: CanonicalAddr,
    /// Loopback TCP listener for local services.
    pub local_listen: SocketAddr,
    /// Public TCP listener; `None` disables peer listening.
    pub public_listen: Option<SocketAddr>,
    /// Loopback UDP signal socket.
    pub signal: SocketAddr,
    /// Listen backlog for both TCP listeners.
    pub backlog: u32,
    /// Initial neighbor list, comma-separated.
    pub neighbors: String,
    /// Directory for the neighbor cache file.
    pub cache_dir: PathBuf,
    /// Names of the services installed on this host.
    pub local_services: BTreeSet<String>,
    /// Upper bound on live connections, listeners included.
    pub max_connections: usize,
    /// Trace lock-related traffic too.
    pub debug_lock_messages: bool,
}

impl BusConfig {
    fn handler_config(&self) -> handler::Config {
        handler::Config {
            server_name: self.server_name.clone(),
            my_address: self.my_address,
            public_ip: self
                .public_listen
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            explicit_neighbors: self.neighbors.clone(),
            local_services: self.local_services.clone(),
            cache_dir: self.cache_dir.clone(),
            max_connections: self.max_connections,
            debug_lock_messages: self.debug_lock_messages,
        }
    }

    fn listen_config(&self) -> ListenConfig {
        ListenConfig {
            local: self.local_listen,
            public: self.public_listen,
            udp: self.signal,
            backlog: self.backlog,
        }
    }
}

/// Runs a pre-loaded daemon client.
pub struct BusClient<R: NetReactor> {
    handle: Handle<R::Waker>,
    service: Service,
    listen: ListenConfig,
    commands: chan::Receiver<Command>,
    events: chan::Sender<Event>,
    reactor: R,
}

impl<R: NetReactor> BusClient<R> {
    /// Create a new client.
    pub fn new(config: BusConfig) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (events_tx, events_rx) = chan::unbounded::<Event>();
        let (listening_tx, listening_rx) = chan::bounded(2);

        let reactor = <R as NetReactor>::new(listening_tx)?;
        let service = Service::new(config.handler_config());

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
            listening: listening_rx,
            events: events_rx,
        };

        Ok(BusClient {
            handle,
            service,
            listen: config.listen_config(),
            commands: commands_rx,
            events: events_tx,
            reactor,
        })
    }

    /// Run the daemon until it quiesces or is cancelled. Returns whether a
    /// RELOADCONFIG asked for the process to be restarted.
    pub async fn run(mut self, cancellation: CancellationToken) -> Result<bool, Error> {
        self.reactor
            .run(
                &self.listen,
                self.service,
                self.commands,
                self.events,
                cancellation,
            )
            .await?;

        // The service was consumed by the reactor; the restart decision
        // travels back on the event channel.
        let mut restart = false;
        while let Ok(event) = self.handle.events.try_recv() {
            if let Event::ShuttingDown { restart: r } = event {
                restart = r;
            }
        }
        Ok(restart)
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<R::Waker> {
        self.handle.clone()
    }
}

/// A handle to a running [`BusClient`].
#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub timeout: time::Duration,
    /// Receives each bound listener address at startup.
    pub listening: chan::Receiver<SocketAddr>,
    /// Receives protocol events.
    pub events: chan::Receiver<Event>,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn stop(&self) -> Result<(), handle::Error> {
        self.command(Command::Stop).await
    }

    async fn shutdown(&self) -> Result<(), handle::Error> {
        self.command(Command::Shutdown).await
    }

    async fn sessions(&self) -> Result<Vec<SessionInfo>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetSessions(transmit)).await?;

        match receive.recv_async().await {
            Ok(sessions) => Ok(sessions),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn load_averages(&self) -> Result<Vec<(String, RemoteSample)>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetLoadAverages(transmit)).await?;

        match receive.recv_async().await {
            Ok(samples) => Ok(samples),
            Err(_) => Err(handle::Error::Timeout),
        }
    }
}
