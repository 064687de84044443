//! Networking errors.

use std::fmt::Debug;
use std::io;

use thiserror::Error;

/// An error occuring in the reactor or its sockets.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Binding a listener failed.
    #[error("unable to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: io::Error,
    },

    /// A channel send or receive error.
    #[error("channel error: {0}")]
    Channel(Box<dyn std::error::Error + Send + Sync + 'static>),
}
