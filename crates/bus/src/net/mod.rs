//! Networking core types.
//!
//! The reactor drives a [`Service`]: a protocol state machine fed with
//! readiness events and producing [`Io`] instructions.
#![allow(clippy::type_complexity)]

use std::{
    borrow::Cow,
    fmt,
    hash::Hash,
    io, net,
    net::SocketAddr,
    sync::Arc,
};

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

pub use reactor::{ReactorTcp, Waker};
pub use time::{LocalDuration, LocalTime};

pub mod error;
pub mod reactor;
mod socket;
pub mod time;

/// Which TCP listener accepted a connection.
///
/// The loopback listener produces local-service sessions only; the public
/// listener produces peer-daemon sessions only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Listener {
    /// Loopback listener for services running on this host.
    Local,
    /// Public listener for peer daemons on other hosts.
    Public,
}

/// A pollable source registered with the reactor.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Source<Id: PeerId> {
    /// A connected (or connecting) TCP stream.
    Peer(Id),
    /// One of the two TCP listeners.
    Listener(Listener),
    /// The loopback UDP signal socket.
    Udp,
    /// Event-loop waker.
    Waker,
}

/// Link direction of a TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Accepted on one of our listeners.
    Inbound,
    /// Dialed by us.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Check whether the link is inbound.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Output of a state transition of the state machine.
#[derive(Debug)]
pub enum Io<M, E, D, Id: PeerId = net::SocketAddr> {
    /// There are some bytes ready to be sent to a peer.
    Write(Id, M),
    /// Connect to a peer.
    Connect(Id),
    /// Close a connection once its outbound buffer has drained.
    Disconnect(Id, D),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
    /// Stop accepting connections and exit once every socket has drained.
    Quit,
}

/// Disconnection event which includes the reason.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// Error while dialing the remote. This error occurs before a connection
    /// is even established.
    DialError(Arc<std::io::Error>),
    /// Error with an established connection.
    ConnectionError(Arc<std::io::Error>),
    /// The state machine closed the connection.
    StateMachine(T),
}

impl<T> Disconnect<T> {
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }

    pub fn is_connection_err(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialError(err) => write!(f, "{}", err),
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// Remote peer id, which must be convertible into a [`net::SocketAddr`].
pub trait PeerId: Eq + Ord + Clone + Hash + fmt::Debug + From<net::SocketAddr> {
    fn to_socket_addr(&self) -> net::SocketAddr;
}

impl<T> PeerId for T
where
    T: Eq + Ord + Clone + Hash + fmt::Debug,
    T: Into<net::SocketAddr>,
    T: From<net::SocketAddr>,
{
    fn to_socket_addr(&self) -> net::SocketAddr {
        self.clone().into()
    }
}

/// Addresses the reactor binds its sockets on.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Loopback TCP listener for local services.
    pub local: SocketAddr,
    /// Public TCP listener for peer daemons. `None` disables peer listening.
    pub public: Option<SocketAddr>,
    /// Loopback UDP signal socket.
    pub udp: SocketAddr,
    /// Listen backlog for both TCP listeners.
    pub backlog: u32,
}

/// A network service.
///
/// Network protocols must implement this trait to be drivable by the reactor.
#[async_trait]
pub trait Service<Id: PeerId = net::SocketAddr>: StateMachine<Id, Message = [u8]> {
    /// Commands handled by the service. They originate from an external
    /// "user" thread and are passed through the reactor via the channel
    /// given to [`NetReactor::run`].
    type Command: Send + Sync;

    /// An external command has been received.
    async fn command_received(&mut self, cmd: Self::Command);
}

/// A service state machine implementing the protocol logic.
///
/// The state machine emits [`Io`] instructions to the reactor via its
/// [`Iterator`] implementation.
#[async_trait]
pub trait StateMachine<Id: PeerId = net::SocketAddr>:
    Iterator<Item = Io<<Self::Message as ToOwned>::Owned, Self::Event, Self::DisconnectReason, Id>>
{
    /// Message type sent between peers.
    type Message: fmt::Debug + ToOwned + ?Sized;
    /// Events emitted by the state machine, forwarded to the user thread.
    type Event: fmt::Debug + Send;
    /// Reason a connection was closed by the state machine itself.
    type DisconnectReason: fmt::Debug + fmt::Display + Into<Disconnect<Self::DisconnectReason>>;

    /// Initialize the state machine. Called once, before any event.
    async fn initialize(&mut self, _time: LocalTime) {}
    /// A full read buffer was received from a TCP connection.
    async fn message_received(&mut self, addr: &Id, message: Cow<'_, Self::Message>);
    /// A datagram arrived on the UDP signal socket.
    async fn datagram_received(&mut self, from: net::SocketAddr, message: Cow<'_, Self::Message>);
    /// An outbound connection attempt is underway. Always precedes
    /// [`StateMachine::connected`] for outbound links.
    fn attempted(&mut self, addr: &Id);
    /// A TCP connection was established. For inbound links `listener` names
    /// the listener that produced it; outbound links carry
    /// [`Listener::Public`].
    fn connected(
        &mut self,
        addr: Id,
        local_addr: &net::SocketAddr,
        link: Link,
        listener: Listener,
    ) -> bool;
    /// A connection was lost or closed, either because of a network event or
    /// by an earlier [`Io::Disconnect`] from this state machine.
    async fn disconnected(&mut self, addr: &Id, reason: Disconnect<Self::DisconnectReason>);
    /// Called on every reactor iteration to update the machine's clock.
    fn tick(&mut self, local_time: LocalTime);
    /// A timer set with [`Io::SetTimer`] has expired.
    async fn timer_expired(&mut self);
}

/// Used by reactors to wake the event loop, for example when a
/// [`Service::Command`] is ready to be processed.
pub trait NetWaker: Send + Sync + Clone {
    /// Wake up! Call this after sending a command to make sure the command
    /// is processed in a timely fashion.
    fn wake(&self) -> io::Result<()>;
}

/// Any reactor that can drive the bus service.
#[async_trait]
pub trait NetReactor<Id: PeerId = net::SocketAddr> {
    /// The type of waker this reactor uses.
    type Waker: NetWaker;

    /// Create a new reactor, given a channel on which bound listener
    /// addresses are published.
    fn new(listening: chan::Sender<net::SocketAddr>) -> Result<Self, io::Error>
    where
        Self: Sized;

    /// Run the given service with the reactor. Events emitted by the service
    /// are forwarded on the `events` channel.
    async fn run<S>(
        &mut self,
        listen: &ListenConfig,
        service: S,
        commands: chan::Receiver<S::Command>,
        events: chan::Sender<S::Event>,
        cancellation: CancellationToken,
    ) -> Result<(), error::Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync;

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop.
    fn waker(&self) -> Self::Waker;
}
