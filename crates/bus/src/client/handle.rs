//! Client handles are created from clients by users of the library, to
//! communicate with the underlying daemon instance.
use async_trait::async_trait;
use flume as chan;
use thiserror::Error;

use crate::fsm::handler::{Command, SessionInfo};
use crate::fsm::loadavg::RemoteSample;

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with a daemon process.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a command to the daemon.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Quiesce this node: remote peers get DISCONNECT, local services get
    /// DISCONNECTING, then the reactor winds down.
    async fn stop(&self) -> Result<(), Error>;

    /// Cascade a SHUTDOWN through the whole cluster, then wind down.
    async fn shutdown(&self) -> Result<(), Error>;

    /// Snapshot the live sessions.
    async fn sessions(&self) -> Result<Vec<SessionInfo>, Error>;

    /// The latest LOADAVG sample per remote host.
    async fn load_averages(&self) -> Result<Vec<(String, RemoteSample)>, Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn stop(&self) -> Result<(), Error>;
        async fn shutdown(&self) -> Result<(), Error>;
        async fn sessions(&self) -> Result<Vec<SessionInfo>, Error>;
        async fn load_averages(&self) -> Result<Vec<(String, RemoteSample)>, Error>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut _mock = MockHandle::new();
    }
}
