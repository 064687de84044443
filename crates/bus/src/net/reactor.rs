//! Poll-based reactor. This is a single-threaded reactor using a `poll` loop.
use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    io,
    io::prelude::*,
    net,
    net::SocketAddr,
    os::unix::io::AsRawFd,
    sync::Arc,
    time,
    time::SystemTime,
};

use async_trait::async_trait;
use flume as chan;
use flume::Receiver;
use popol::Event;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::net::socket::Socket;
use crate::net::time::TimeoutManager;
use crate::net::{
    error, error::Error, Disconnect, Io, Link, Listener, ListenConfig, LocalDuration, LocalTime,
    NetReactor, NetWaker, PeerId, Service, Source,
};

/// Maximum time to wait when reading from a socket.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(6);
/// Maximum time to wait when writing to a socket.
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(3);
/// Maximum amount of time to wait for i/o when no timer is registered.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 192;
/// UDP datagram buffer size. One signal message per datagram.
const DATAGRAM_BUFFER_SIZE: usize = 2048;

pub type ReactorTcp = Reactor<net::TcpStream>;

#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new<Id: PeerId>(sources: &mut popol::Sources<Source<Id>>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }
}

impl NetWaker for Waker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// The sockets the reactor listens on.
struct Listeners {
    local: net::TcpListener,
    public: Option<net::TcpListener>,
    udp: net::UdpSocket,
}

/// A single-threaded non-blocking reactor.
pub struct Reactor<R: Write + Read, Id: PeerId = net::SocketAddr> {
    peers: HashMap<Id, Socket<R>>,
    connecting: HashSet<Id>,
    sources: popol::Sources<Source<Id>>,
    waker: Waker,
    timeouts: TimeoutManager<()>,
    listening: chan::Sender<net::SocketAddr>,
    /// Set once the service asked to quit; the loop exits when the last
    /// peer socket has drained.
    quitting: bool,
}

/// The `R` parameter represents the underlying stream type, eg. `net::TcpStream`.
impl<R: Write + Read + AsRawFd, Id: PeerId> Reactor<R, Id> {
    /// Register a peer with the reactor.
    fn register_peer(&mut self, addr: Id, stream: R, link: Link) {
        let socket_addr = addr.to_socket_addr();
        self.sources
            .register(Source::Peer(addr.clone()), &stream, popol::interest::ALL);
        self.peers
            .insert(addr, Socket::from(stream, socket_addr, link));
    }

    /// Drop a peer socket without notifying the service.
    fn remove_peer(&mut self, addr: &Id) {
        self.connecting.remove(addr);
        self.peers.remove(addr);
        self.sources.unregister(&Source::Peer(addr.clone()));
    }

    /// Unregister a peer from the reactor and notify the service.
    async fn unregister_peer<S>(
        &mut self,
        addr: Id,
        reason: Disconnect<S::DisconnectReason>,
        service: &mut S,
    ) where
        S: Service<Id>,
    {
        self.remove_peer(&addr);

        service.disconnected(&addr, reason).await;
    }
}

#[async_trait]
impl<Id: PeerId + Send + Sync> NetReactor<Id> for Reactor<net::TcpStream, Id> {
    type Waker = Waker;

    /// Construct a new reactor, given a channel to send events on.
    fn new(listening: chan::Sender<net::SocketAddr>) -> Result<Self, io::Error> {
        let peers = HashMap::new();

        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let timeouts = TimeoutManager::new(LocalDuration::from_millis(100));
        let connecting = HashSet::new();

        Ok(Self {
            peers,
            connecting,
            sources,
            waker,
            timeouts,
            listening,
            quitting: false,
        })
    }

    /// Run the given service with the reactor.
    async fn run<S>(
        &mut self,
        listen: &ListenConfig,
        mut service: S,
        commands: chan::Receiver<S::Command>,
        events: chan::Sender<S::Event>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync,
    {
        let listeners = self.bind(listen).await?;

        let local_time = SystemTime::now().into();
        service.initialize(local_time).await;

        self.process(&mut service, &events, local_time).await;

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut io_events = Vec::with_capacity(32);
        // Timeouts populated by `TimeoutManager::wake`.
        let mut timeouts: Vec<()> = Vec::with_capacity(32);

        loop {
            select! {
                _ = cancellation.cancelled() => {
                    trace!(target: "net", "Reactor cancelled");
                    break Ok(());
                }
                result = self.step(&mut io_events, &mut service, &commands, &events, &mut timeouts, &listeners) => {
                    match result {
                        Ok(false) => continue,
                        Ok(true) => {
                            debug!(target: "net", "Reactor has no sockets left, exiting");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        }
    }

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop.
    fn waker(&self) -> Self::Waker {
        self.waker.clone()
    }
}

impl<Id: PeerId + Send + Sync> Reactor<net::TcpStream, Id> {
    /// Bind the two TCP listeners and the UDP signal socket.
    async fn bind(&mut self, listen: &ListenConfig) -> Result<Listeners, Error> {
        let local = tcp_listen(listen.local, listen.backlog)?;
        self.sources
            .register(Source::Listener(Listener::Local), &local, popol::interest::READ);
        self.listening.send_async(local.local_addr()?).await.ok();

        debug!(target: "net", "Listening for local services on {}", listen.local);

        let public = match listen.public {
            Some(addr) => {
                let listener = tcp_listen(addr, listen.backlog)?;
                self.sources.register(
                    Source::Listener(Listener::Public),
                    &listener,
                    popol::interest::READ,
                );
                self.listening.send_async(listener.local_addr()?).await.ok();

                debug!(target: "net", "Listening for peer daemons on {}", addr);

                Some(listener)
            }
            None => {
                warn!(target: "net", "Public listener disabled, peer daemons will not be able to connect");
                None
            }
        };

        let udp = net::UdpSocket::bind(listen.udp).map_err(|source| Error::Bind {
            addr: listen.udp,
            source,
        })?;
        udp.set_nonblocking(true)?;
        self.sources
            .register(Source::Udp, &udp, popol::interest::READ);

        debug!(target: "net", "Listening for signals on {} (udp)", listen.udp);

        Ok(Listeners { local, public, udp })
    }

    /// One reactor iteration: poll, fire timers, dispatch readiness, process
    /// service outputs. Returns `true` once the reactor is done.
    async fn step<S>(
        &mut self,
        io_events: &mut Vec<Event<Source<Id>>>,
        service: &mut S,
        commands: &Receiver<S::Command>,
        events: &chan::Sender<S::Event>,
        timeouts: &mut Vec<()>,
        listeners: &Listeners,
    ) -> Result<bool, Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync,
    {
        tokio::task::yield_now().await;

        let local_time = LocalTime::from(SystemTime::now());
        let wait = self
            .timeouts
            .next(local_time)
            .unwrap_or(WAIT_TIMEOUT)
            .min(WAIT_TIMEOUT);

        trace!(
            target: "net",
            "Polling {} source(s) and {} timeout(s), waking up in {}..",
            self.sources.len(),
            self.timeouts.len(),
            wait,
        );

        let result = self.sources.wait_timeout(io_events, wait.into()); // Blocking.
        let local_time = LocalTime::from(SystemTime::now());

        service.tick(local_time);

        match result {
            Ok(n) => {
                trace!(target: "net", "Woke up with {n} source(s) ready");

                self.dispatch(io_events, service, commands, listeners)
                    .await?;
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                // Nb. The way this is currently used basically ignores which
                // keys have timed out. As long as *something* timed out, the
                // service is woken.
                self.timeouts.wake(local_time, timeouts);

                if !timeouts.is_empty() {
                    timeouts.clear();
                    service.timer_expired().await;
                }
            }
            Err(err) => return Err(err.into()),
        }
        self.process(service, events, local_time).await;

        Ok(self.quitting && self.peers.is_empty())
    }

    async fn dispatch<S>(
        &mut self,
        io_events: &mut Vec<Event<Source<Id>>>,
        service: &mut S,
        commands: &Receiver<S::Command>,
        listeners: &Listeners,
    ) -> Result<(), Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync,
    {
        for event in io_events.drain(..) {
            match &event.key {
                Source::Peer(addr) => {
                    let addr = addr.clone();

                    if event.is_error() || event.is_hangup() {
                        // Let the subsequent read fail.
                        trace!(target: "net", "{}: Socket error triggered: {:?}", addr.to_socket_addr(), event);
                    }
                    if event.is_invalid() {
                        // File descriptor was closed and is invalid.
                        // Nb. This shouldn't happen. It means the source wasn't
                        // properly unregistered, or there is a duplicate source.
                        error!(target: "net", "{}: Socket is invalid, removing", addr.to_socket_addr());

                        self.sources.unregister(&event.key);
                        continue;
                    }

                    if event.is_writable() {
                        self.handle_writable(addr.clone(), &event.key, service)
                            .await;
                    }
                    if event.is_readable() {
                        self.handle_readable(addr, service).await;
                    }
                }
                Source::Listener(kind) => {
                    let kind = *kind;
                    let listener = match kind {
                        Listener::Local => Some(&listeners.local),
                        Listener::Public => listeners.public.as_ref(),
                    };
                    while let Some(listener) = listener {
                        let (conn, socket_addr) = match listener.accept() {
                            Ok((conn, socket_addr)) => (conn, socket_addr),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                error!(target: "net", "Accept error: {}", e.to_string());
                                break;
                            }
                        };

                        self.accept_peer(service, socket_addr, conn, kind)?;
                    }
                }
                Source::Udp => {
                    let mut buffer = [0; DATAGRAM_BUFFER_SIZE];

                    loop {
                        match listeners.udp.recv_from(&mut buffer) {
                            Ok((n, from)) => {
                                service
                                    .datagram_received(from, Cow::Borrowed(&buffer[..n]))
                                    .await;
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                error!(target: "net", "UDP receive error: {}", e.to_string());
                                break;
                            }
                        }
                    }
                }
                Source::Waker => {
                    trace!(target: "net", "Woken up by waker ({} command(s))", commands.len());

                    popol::Waker::reset(event.source).ok();

                    while let Ok(cmd) = commands.try_recv() {
                        service.command_received(cmd).await;
                    }
                }
            }
        }

        Ok(())
    }

    fn accept_peer<S>(
        &mut self,
        service: &mut S,
        socket_addr: SocketAddr,
        conn: net::TcpStream,
        listener: Listener,
    ) -> Result<(), error::Error>
    where
        S: Service<Id> + Send + Sync,
    {
        let addr = Id::from(socket_addr);
        trace!(target: "net", "{}: Accepting peer connection", socket_addr);

        conn.set_nonblocking(true)?;

        let local_addr = conn.local_addr()?;
        let link = Link::Inbound;

        self.register_peer(addr.clone(), conn, link);

        service.connected(addr, &local_addr, link, listener);
        Ok(())
    }

    /// Process service state machine outputs.
    async fn process<S>(
        &mut self,
        service: &mut S,
        events: &chan::Sender<S::Event>,
        local_time: LocalTime,
    ) where
        S: Service<Id>,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>>,
    {
        // Note that there may be messages destined for a peer that has since
        // been disconnected.
        while let Some(out) = service.next() {
            match out {
                Io::Write(addr, bytes) => {
                    if let Some((socket, source)) = self.peers.get_mut(&addr).and_then(|socket| {
                        self.sources
                            .get_mut(&Source::Peer(addr.clone()))
                            .map(|source| (socket, source))
                    }) {
                        if socket.is_done() {
                            continue;
                        }
                        socket.push(&bytes);
                        source.set(popol::interest::WRITE);
                    }
                }
                Io::Connect(addr) => self.dial_peer(addr, service).await,
                Io::Disconnect(addr, reason) => {
                    // The service is notified right away; the socket sticks
                    // around until its outbound queue has drained.
                    let drained = match self.peers.get(&addr) {
                        Some(socket) => socket.is_drained(),
                        None => continue,
                    };
                    let connected = !self.connecting.contains(&addr);

                    if drained || !connected {
                        self.peers
                            .get(&addr)
                            .and_then(|socket| socket.disconnect().ok());
                        self.remove_peer(&addr);
                    } else if let Some(socket) = self.peers.get_mut(&addr) {
                        socket.mark_done();
                        if let Some(source) = self.sources.get_mut(&Source::Peer(addr.clone())) {
                            source.set(popol::interest::WRITE);
                        }
                    }
                    service.disconnected(&addr, reason.into()).await;
                }
                Io::SetTimer(timeout) => {
                    self.timeouts.register((), local_time + timeout);
                }
                Io::Event(event) => {
                    trace!(target: "net", "Event: {:?}", event);

                    events.send(event).ok();
                }
                Io::Quit => {
                    debug!(target: "net", "Service requested shutdown, closing listeners");

                    for source in [
                        Source::Listener(Listener::Local),
                        Source::Listener(Listener::Public),
                        Source::Udp,
                    ] {
                        if self.sources.get_mut(&source).is_some() {
                            self.sources.unregister(&source);
                        }
                    }
                    self.quitting = true;
                }
            }
        }
    }

    async fn dial_peer<S: Service<Id>>(&mut self, addr: Id, service: &mut S) {
        let socket_addr = addr.to_socket_addr();

        match dial(&socket_addr) {
            Ok(stream) => {
                trace!(target: "net", "{}: Dialing", socket_addr);

                self.register_peer(addr.clone(), stream, Link::Outbound);
                self.connecting.insert(addr.clone());

                service.attempted(&addr);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Ignore. We are already establishing a connection through
                // this socket.
            }
            Err(err) => {
                error!(target: "net", "{}: Dial error: {}", socket_addr, err.to_string());

                service
                    .disconnected(&addr, Disconnect::DialError(Arc::new(err)))
                    .await;
            }
        }
    }

    async fn handle_readable<S>(&mut self, addr: Id, service: &mut S)
    where
        S: Service<Id>,
    {
        // Nb. If the socket was readable and writable at the same time, and it
        // was disconnected during an attempt to write, it will no longer be
        // registered and hence available for reads.
        let Some(socket) = self.peers.get_mut(&addr) else {
            return;
        };
        // A socket marked done is only draining; its input is no longer
        // anyone's business.
        if socket.is_done() {
            return;
        }

        let mut buffer = [0; READ_BUFFER_SIZE];

        let socket_addr = addr.to_socket_addr();
        trace!(target: "net", "{}: Socket is readable", socket_addr);

        // Nb. Since `poll`, which this reactor is based on, is
        // *level-triggered*, we will be notified again if there is still data
        // to be read on the socket. Hence, there is no use in putting this
        // socket read in a loop, as the second invocation would likely block.
        match socket.read(&mut buffer) {
            Ok(count) => {
                if count > 0 {
                    service
                        .message_received(&addr, Cow::Borrowed(&buffer[..count]))
                        .await;
                } else {
                    // If we get zero bytes read as a return value, it means
                    // the peer has performed an orderly shutdown.
                    socket.disconnect().ok();

                    self.unregister_peer(
                        addr,
                        Disconnect::ConnectionError(Arc::new(io::Error::from(
                            io::ErrorKind::ConnectionReset,
                        ))),
                        service,
                    )
                    .await;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // This shouldn't normally happen, since this function is only
                // called when there's data on the socket.
                trace!(target: "net", "{}: Spurious read readiness", socket_addr);
            }
            Err(err) => {
                trace!(target: "net", "{}: Read error: {}", socket_addr, err.to_string());

                socket.disconnect().ok();

                self.unregister_peer(
                    addr,
                    Disconnect::ConnectionError(Arc::new(err)),
                    service,
                )
                .await;
            }
        }
    }

    async fn handle_writable<S: Service<Id>>(
        &mut self,
        addr: Id,
        source: &Source<Id>,
        service: &mut S,
    ) {
        let socket_addr = addr.to_socket_addr();
        trace!(target: "net", "{}: Socket is writable", socket_addr);

        let (Some(source), Some(socket)) =
            (self.sources.get_mut(source), self.peers.get_mut(&addr))
        else {
            return;
        };

        // "A file descriptor for a socket that is connecting asynchronously
        // shall indicate that it is ready for writing, once a connection has
        // been established."
        //
        // Since we perform a non-blocking connect, we're only really connected
        // once the socket is writable.
        if self.connecting.remove(&addr) {
            let local_addr = match socket.local_address() {
                Ok(addr) => addr,
                Err(err) => {
                    socket.disconnect().ok();
                    self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                        .await;
                    return;
                }
            };

            service.connected(addr.clone(), &local_addr, socket.link, Listener::Public);
        }

        match socket.drain() {
            Ok(()) => {
                // All queued data was written; no more write interest. A
                // socket marked done is closed now that it has drained.
                if socket.is_done() {
                    socket.disconnect().ok();
                    self.remove_peer(&addr);
                } else {
                    source.unset(popol::interest::WRITE);
                }
            }
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::WriteZero].contains(&err.kind()) =>
            {
                // The write couldn't complete. Keep the `WRITE` interest to
                // be notified when the socket is ready to write again.
                source.set(popol::interest::WRITE);
            }
            Err(err) => {
                error!(target: "net", "{}: Write error: {}", socket_addr, err.to_string());

                socket.disconnect().ok();
                if socket.is_done() {
                    // The service already saw this connection go away.
                    self.remove_peer(&addr);
                } else {
                    self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                        .await;
                }
            }
        }
    }
}

/// Open a non-blocking TCP socket of the right family for an address.
/// Shared by the dial and listen paths.
fn tcp_socket(addr: &SocketAddr) -> io::Result<socket2::Socket> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;
    sock.set_nonblocking(true)?;

    Ok(sock)
}

/// Connect to a peer given a remote address.
///
/// The connect itself is non-blocking: the reactor learns the outcome
/// through write readiness (established) or a failing read. The kernel
/// read/write timeouts bound a peer that stops draining mid-message.
fn dial(addr: &SocketAddr) -> io::Result<net::TcpStream> {
    let sock = tcp_socket(addr)?;
    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    sock.set_write_timeout(Some(WRITE_TIMEOUT))?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        // Establishment pending; completion arrives as write readiness.
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        // An earlier attempt on this address is still connecting.
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
        }
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Listen for TCP connections on the given address, with the given backlog.
fn tcp_listen(addr: SocketAddr, backlog: u32) -> Result<net::TcpListener, Error> {
    let sock = tcp_socket(&addr)
        .and_then(|sock| {
            sock.set_reuse_address(true)?;
            sock.bind(&addr.into())?;
            sock.listen(backlog as i32)?;
            Ok(sock)
        })
        .map_err(|source| Error::Bind { addr, source })?;

    Ok(sock.into())
}
