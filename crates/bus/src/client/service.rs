//! Client service. Wraps the protocol state machine and handles decoding
//! and encoding of wire messages.
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::net;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::stream;
use crate::common::time::RefClock;
use crate::fsm;
use crate::fsm::event::Event;
use crate::fsm::handler::DisconnectReason;
use crate::message::Message;
use crate::net::{Disconnect, Io, Link, Listener, LocalTime, StateMachine};

/// Decoding layer between the reactor's byte stream and the state machine.
pub struct Service {
    inboxes: HashMap<net::SocketAddr, stream::Decoder>,
    machine: fsm::handler::StateMachine<RefClock>,
}

impl Service {
    /// Create a new client service.
    pub fn new(config: fsm::handler::Config) -> Self {
        let clock = RefClock::new(LocalTime::now());

        Self {
            inboxes: HashMap::new(),
            machine: fsm::handler::StateMachine::new(config, clock, fastrand::Rng::new()),
        }
    }

    /// Whether a RELOADCONFIG asked for the process to be restarted.
    pub fn restart_requested(&self) -> bool {
        self.machine.restart_requested()
    }
}

#[async_trait]
impl crate::net::Service for Service {
    type Command = fsm::handler::Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd).await
    }
}

#[async_trait]
impl StateMachine for Service {
    type Message = [u8];
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time).await;
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!(target: "bus", "Received bytes from unknown connection {}", addr);
            return;
        };
        inbox.input(bytes.borrow());

        loop {
            // Re-borrow every round: the machine may have dropped the
            // connection while processing a message.
            let Some(inbox) = self.inboxes.get_mut(addr) else {
                return;
            };
            match inbox.decode_next() {
                Ok(Some(msg)) => self.machine.message_received(addr, Cow::Owned(msg)).await,
                Ok(None) => break,
                Err(err) if err.is_fatal() => {
                    warn!(target: "bus", "{}: stream stopped decoding: {}", addr, err);

                    self.machine.disconnect(*addr, DisconnectReason::DecodeError);
                    return;
                }
                Err(err) => {
                    // One bad line does not cost the connection; the sender
                    // is told and the stream resynchronizes at the next LF.
                    self.machine.invalid_message(*addr, &err.token, &err);
                }
            }
        }
    }

    async fn datagram_received(&mut self, from: net::SocketAddr, bytes: Cow<'_, [u8]>) {
        // One or more LF-separated messages per datagram; no replies are
        // possible, so malformed input is only logged.
        let text = String::from_utf8_lossy(bytes.borrow());
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match Message::from_line(line) {
                Ok(msg) => self.machine.datagram_received(from, Cow::Owned(msg)).await,
                Err(err) => {
                    warn!(target: "bus", "{}: invalid signal message ({})", from, err);
                }
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(
        &mut self,
        addr: net::SocketAddr,
        local_addr: &net::SocketAddr,
        link: Link,
        listener: Listener,
    ) -> bool {
        if !self.machine.connected(addr, local_addr, link, listener) {
            return false;
        }
        self.inboxes.insert(addr, stream::Decoder::new(1024));
        true
    }

    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    ) {
        self.inboxes.remove(addr);
        self.machine.disconnected(addr, reason).await
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired().await;
    }
}

impl Iterator for Service {
    type Item = Io<Vec<u8>, Event, DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.machine.next() {
            Some(Io::Write(addr, msg)) => Some(Io::Write(addr, msg.to_line().into_bytes())),
            Some(Io::Event(e)) => Some(Io::Event(e)),
            Some(Io::Connect(a)) => Some(Io::Connect(a)),
            Some(Io::Disconnect(a, r)) => Some(Io::Disconnect(a, r)),
            Some(Io::SetTimer(d)) => Some(Io::SetTimer(d)),
            Some(Io::Quit) => Some(Io::Quit),

            None => None,
        }
    }
}
