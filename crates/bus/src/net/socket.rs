//! Write-buffered non-blocking socket.
use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::net;

use crate::net::Link;

/// A non-blocking stream with an outbound byte queue.
///
/// Partial writes accumulate in the queue and are drained when the
/// underlying socket reports writable readiness.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    /// Transport address of the remote endpoint.
    pub address: net::SocketAddr,
    /// Link direction.
    pub link: Link,
    /// Close the connection once the queue is empty.
    done: bool,
    queue: VecDeque<Vec<u8>>,
}

impl<R: Read + Write> Socket<R> {
    pub fn from(raw: R, address: net::SocketAddr, link: Link) -> Self {
        Self {
            raw,
            address,
            link,
            done: false,
            queue: VecDeque::new(),
        }
    }

    /// Queue bytes for sending.
    pub fn push(&mut self, bytes: &[u8]) {
        self.queue.push_back(bytes.to_vec());
    }

    /// Whether the outbound queue is empty.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// Mark this socket to be closed once its queue drains.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    /// Whether the socket was marked for closing.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Try to write the whole queue to the underlying stream.
    ///
    /// Returns `WouldBlock` when the kernel buffer filled up before the
    /// queue was drained; the caller keeps write interest set and retries
    /// on the next readiness event.
    pub fn drain(&mut self) -> io::Result<()> {
        while let Some(buf) = self.queue.front_mut() {
            match self.raw.write(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) if n < buf.len() => {
                    buf.drain(..n);
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                Ok(_) => {
                    self.queue.pop_front();
                }
                Err(err) => return Err(err),
            }
        }
        self.raw.flush()
    }
}

impl<R: Read> Read for Socket<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }
}

impl Socket<net::TcpStream> {
    /// Local address of the underlying stream.
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }

    /// Shut the connection down, both directions.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}
