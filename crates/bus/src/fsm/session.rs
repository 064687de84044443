//! Per-connection protocol state.
use std::collections::BTreeSet;
use std::net::SocketAddr;

use crate::common::addr::CanonicalAddr;
use crate::net::{Link, Listener, LocalTime};

/// What a connection represents.
///
/// Every session starts `Down` and transitions up on CONNECT, ACCEPT or
/// REGISTER; it transitions back to `Down` on DISCONNECT or UNREGISTER just
/// before the socket goes away, so status reporting observes the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Not negotiated, or already torn down.
    Down,
    /// A service running on this host.
    Local,
    /// A peer daemon on another host.
    Remote,
}

/// Protocol state of one live connection.
///
/// Sessions hold no socket; the reactor owns the socket under the same
/// transport address used as key here.
#[derive(Debug, Clone)]
pub struct Session {
    /// Transport address of the remote endpoint (reactor key).
    pub addr: SocketAddr,
    /// Connection kind, `Down` until negotiated.
    pub kind: SessionKind,
    /// Link direction.
    pub link: Link,
    /// Listener that produced the connection; `Public` for outbound dials.
    pub accepted_on: Listener,
    /// Whether the connection was accepted on the non-loopback listener or
    /// dialed out to a peer daemon.
    pub remote: bool,
    /// Name of the server on the other side. For local services this is our
    /// own server name.
    pub server_name: String,
    /// Service name, once REGISTER supplied one; a descriptive placeholder
    /// before that.
    name: String,
    /// False until REGISTER supplies a real service name.
    named: bool,
    /// The peer's advertised own address (CONNECT/ACCEPT `my_address`).
    pub peer_address: Option<CanonicalAddr>,
    /// Whether this connection asked for LOADAVG samples.
    pub wants_loadavg: bool,
    services: BTreeSet<String>,
    heard_of: BTreeSet<String>,
    commands: BTreeSet<String>,
    /// Microseconds since epoch; -1 when not started.
    started_at: i64,
    /// Microseconds since epoch; -1 while up. Set at most once.
    ended_at: i64,
}

impl Session {
    pub fn new(addr: SocketAddr, link: Link, accepted_on: Listener) -> Self {
        Self {
            addr,
            kind: SessionKind::Down,
            link,
            accepted_on,
            remote: accepted_on == Listener::Public,
            server_name: String::new(),
            name: format!("connection from {}", addr),
            named: false,
            peer_address: None,
            wants_loadavg: false,
            services: BTreeSet::new(),
            heard_of: BTreeSet::new(),
            commands: BTreeSet::new(),
            started_at: -1,
            ended_at: -1,
        }
    }

    /// Mark the connection as up. Called on CONNECT, ACCEPT or REGISTER.
    pub fn start(&mut self, now: LocalTime) {
        self.started_at = now.as_micros() as i64;
        self.ended_at = -1;
    }

    /// Mark the connection as down. Only the first call after a `start`
    /// records the time.
    pub fn end(&mut self, now: LocalTime) {
        if self.started_at != -1 && self.ended_at == -1 {
            self.ended_at = now.as_micros() as i64;
        }
    }

    /// Microseconds since epoch when the session came up, or -1.
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Microseconds since epoch when the session went down, or -1.
    pub fn ended_at(&self) -> i64 {
        self.ended_at
    }

    /// The session's display name: the service name once registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether REGISTER supplied a real service name.
    pub fn is_named(&self) -> bool {
        self.named
    }

    /// Give the session its service name.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
        self.named = true;
    }

    /// Drop the service name, e.g. on UNREGISTER.
    pub fn clear_name(&mut self) {
        self.name = format!("connection from {}", self.addr);
        self.named = false;
    }

    pub fn set_services(&mut self, csv: &str) {
        self.services.extend(split_csv(csv));
    }

    pub fn set_heard_of(&mut self, csv: &str) {
        self.heard_of.extend(split_csv(csv));
    }

    pub fn set_commands(&mut self, csv: &str) {
        self.commands.extend(split_csv(csv));
    }

    /// Services this connection offers.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(String::as_str)
    }

    /// Services this connection heard of elsewhere.
    pub fn heard_of(&self) -> impl Iterator<Item = &str> {
        self.heard_of.iter().map(String::as_str)
    }

    /// Whether this connection advertised understanding of a command.
    pub fn understands(&self, command: &str) -> bool {
        self.commands.contains(command)
    }

    /// Whether a COMMANDS list was received at all.
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Make the system think a command is no longer understood. Used when a
    /// connection goes down and must not receive its own STATUS.
    pub fn remove_command(&mut self, command: &str) {
        self.commands.remove(command);
    }
}

fn split_csv(csv: &str) -> impl Iterator<Item = String> + '_ {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LocalDuration;

    fn session() -> Session {
        Session::new(([127, 0, 0, 1], 50000).into(), Link::Inbound, Listener::Local)
    }

    #[test]
    fn end_is_recorded_once_and_only_after_start() {
        let mut s = session();
        let t0 = LocalTime::from_secs(100);

        // Ending a session that never started records nothing.
        s.end(t0);
        assert_eq!(s.ended_at(), -1);

        s.start(t0);
        assert_eq!(s.started_at(), 100_000_000);
        assert_eq!(s.ended_at(), -1);

        s.end(t0 + LocalDuration::from_secs(5));
        let first = s.ended_at();
        s.end(t0 + LocalDuration::from_secs(60));

        assert_eq!(s.ended_at(), first);
        assert!(s.ended_at() >= s.started_at());
    }

    #[test]
    fn restart_clears_the_end_stamp() {
        let mut s = session();
        s.start(LocalTime::from_secs(1));
        s.end(LocalTime::from_secs(2));
        s.start(LocalTime::from_secs(3));

        assert_eq!(s.ended_at(), -1);
    }

    #[test]
    fn csv_fields_are_trimmed_and_deduplicated() {
        let mut s = session();
        s.set_services("images, pagelist,,images");
        assert_eq!(s.services().collect::<Vec<_>>(), vec!["images", "pagelist"]);

        s.set_commands("STATUS,STOP");
        assert!(s.understands("STATUS"));
        assert!(!s.understands("HELP"));

        s.remove_command("STATUS");
        assert!(!s.understands("STATUS"));
    }

    #[test]
    fn public_listener_marks_the_session_remote() {
        let local = session();
        assert!(!local.remote);

        let remote = Session::new(
            ([10, 0, 0, 2], 4040).into(),
            Link::Inbound,
            Listener::Public,
        );
        assert!(remote.remote);
    }

    #[test]
    fn naming_follows_register_unregister() {
        let mut s = session();
        assert!(!s.is_named());

        s.set_name("images");
        assert!(s.is_named());
        assert_eq!(s.name(), "images");

        s.clear_name();
        assert!(!s.is_named());
    }
}
