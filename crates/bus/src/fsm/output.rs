//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each sub-component, eg. the mesh manager or the load-average sampler, is
//! given a copy of this outbox with specific capabilities, eg. peer
//! disconnection, message sending etc. to communicate with the network.
use std::collections::VecDeque;
use std::net;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::fsm::event::Event;
use crate::fsm::handler::{DisconnectReason, PeerId};
use crate::message::Message;
use crate::net::LocalDuration;

/// Output of a state transition of the protocol state machine.
pub type Io = crate::net::Io<Message, Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Close a connection once its outbound buffer has drained.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// The bus wire protocol, as a capability handed to sub-components.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    /// Send a message to a connection.
    fn message(&mut self, addr: PeerId, msg: Message) -> &mut Self;

    /// Publish a load-average sample to a subscribed connection.
    fn loadavg(&mut self, addr: PeerId, avg: f32, my_address: &str, timestamp: u64) -> &mut Self;
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound
            .lock()
            .expect("outbox lock is never poisoned")
            .pop_front()
    }
}

impl Outbox {
    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound
            .lock()
            .expect("outbox lock is never poisoned")
            .push_back(output);
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }

    /// Queue a message for a connection.
    pub fn message(&mut self, addr: PeerId, msg: Message) -> &mut Self {
        debug!(target: "bus", "Sending {} to {}", msg.command, addr);

        self.push(Io::Write(addr, msg));
        self
    }

    /// Ask the reactor to stop accepting connections and exit once every
    /// socket has drained.
    pub fn quit(&self) {
        self.push(Io::Quit);
    }

    // Handshake //////////////////////////////////////////////////////////////

    /// Ask a connection for the verbs it understands.
    pub fn help(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, Message::new("HELP"))
    }

    /// Acknowledge a service registration.
    pub fn ready(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, Message::new("READY"))
    }

    /// Confirm receipt of a GOSSIP.
    pub fn received(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, Message::new("RECEIVED"))
    }

    /// Announce ourselves to a peer that cannot dial us.
    pub fn gossip(&mut self, addr: PeerId, my_address: &str) -> &mut Self {
        self.message(
            addr,
            Message::new("GOSSIP").with_param("my_address", my_address),
        )
    }

    // Replies ////////////////////////////////////////////////////////////////

    /// Tell a connection we are shutting down.
    pub fn quitting(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, Message::new("QUITTING"))
    }

    /// Tell a connection we did not understand its command.
    pub fn unknown(&mut self, addr: PeerId, command: &str) -> &mut Self {
        self.message(addr, Message::new("UNKNOWN").with_param("command", command))
    }

    /// Report a failed transmission back to the sender.
    pub fn transmission_failed(&mut self, addr: PeerId) -> &mut Self {
        self.message(
            addr,
            Message::new("TRANSMISSIONREPORT").with_param("status", "failed"),
        )
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        debug!(target: "bus", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "bus", "{}", &event);
        Outbox::event(self, event.into());
    }

    fn message(&mut self, addr: PeerId, msg: Message) -> &mut Self {
        Outbox::message(self, addr, msg)
    }

    fn loadavg(&mut self, addr: PeerId, avg: f32, my_address: &str, timestamp: u64) -> &mut Self {
        self.message(
            addr,
            Message::new("LOADAVG")
                .with_param("avg", format!("{:.2}", avg))
                .with_param("my_address", my_address)
                .with_param("timestamp", timestamp.to_string()),
        )
    }
}
