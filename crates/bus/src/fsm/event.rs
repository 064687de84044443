//! State machine events.
use std::net::SocketAddr;

use crate::net::LocalTime;

/// An event emitted by the bus state machine, forwarded to the user thread.
#[derive(Debug, Clone)]
pub enum Event {
    /// The daemon is initializing its state machine and about to start
    /// network activity.
    Initializing,
    /// The daemon is initialized and ready to route messages.
    Ready {
        /// Local time at readiness.
        time: LocalTime,
    },
    /// A peer daemon completed the CONNECT/ACCEPT handshake.
    PeerConnected {
        /// The peer's server name.
        server_name: String,
        /// Transport address of the connection.
        addr: SocketAddr,
    },
    /// A peer daemon's edge went away.
    PeerDisconnected {
        /// Transport address of the connection.
        addr: SocketAddr,
    },
    /// A local service registered.
    ServiceRegistered {
        /// The service name.
        name: String,
    },
    /// A local service unregistered or its connection closed.
    ServiceUnregistered {
        /// The service name.
        name: String,
    },
    /// Teardown has begun.
    ShuttingDown {
        /// Whether the process should exit with a restart request.
        restart: bool,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(fmt, "Initializing"),
            Self::Ready { time } => write!(fmt, "Ready at {}", time),
            Self::PeerConnected { server_name, addr } => {
                write!(fmt, "Peer `{}` connected on {}", server_name, addr)
            }
            Self::PeerDisconnected { addr } => write!(fmt, "Peer on {} disconnected", addr),
            Self::ServiceRegistered { name } => write!(fmt, "Service `{}` registered", name),
            Self::ServiceUnregistered { name } => write!(fmt, "Service `{}` unregistered", name),
            Self::ShuttingDown { restart } => {
                write!(fmt, "Shutting down (restart = {})", restart)
            }
        }
    }
}
