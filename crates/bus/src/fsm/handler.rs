//! The bus protocol state machine: message routing, peer handshake,
//! status propagation and shutdown orchestration.
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{self, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use flume as chan;
use tracing::{debug, error, info, trace, warn};

use crate::common::addr::{CanonicalAddr, NetworkClass, DEFAULT_PORT};
use crate::common::time::{Clock, TickClock};
use crate::fsm::broadcast::{BroadcastEngine, Candidate, CandidateKind};
use crate::fsm::cache::MessageCache;
use crate::fsm::event::Event;
use crate::fsm::loadavg::{LoadavgManager, RemoteSample};
use crate::fsm::meshmgr::{MeshManager, OutboundRole};
use crate::fsm::output::{self, Disconnect as _, Outbox};
use crate::fsm::session::{Session, SessionKind};
use crate::message::Message;
use crate::net::{Disconnect, Link, Listener, LocalTime};

pub type PeerId = net::SocketAddr;

/// Protocol version spoken between daemons.
pub const PROTOCOL_VERSION: i64 = 1;
/// The daemon's own routing name: messages addressed to this service (or to
/// no service at all) are for the daemon itself.
pub const DAEMON_SERVICE: &str = "meshbus";
/// The verbs this daemon understands, as advertised in COMMANDS replies.
pub const COMMANDS_LIST: &str = "ACCEPT,COMMANDS,CONNECT,DISCONNECT,FORGET,GOSSIP,HELP,\
LISTENLOADAVG,LISTSERVICES,LOADAVG,LOG,PUBLIC_IP,QUITTING,RECEIVED,REFUSE,REGISTER,\
REGISTERFORLOADAVG,RELOADCONFIG,SERVICESTATUS,SHUTDOWN,STOP,UNKNOWN,UNREGISTER,\
UNREGISTERFORLOADAVG";

/// Verbs accepted over the UDP signal socket. Everything else needs a TCP
/// connection, if only to carry the reply.
const UDP_COMMANDS: [&str; 5] = ["STOP", "SHUTDOWN", "LOG", "LOADAVG", "LISTSERVICES"];

/// Connections that exist besides the per-session sockets: the two
/// listeners, the UDP socket, the interrupt source and the load-average
/// timer. They count against the connection cap.
const FIXED_CONNECTIONS: usize = 5;

/// Reason a connection was closed by this state machine.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Connection or handshake attempt took too long.
    PeerTimeout(&'static str),
    /// Peer speaks an incompatible protocol version.
    VersionMismatch(i64),
    /// Another peer session already claims that server name.
    NameConflict,
    /// The connection cap was reached.
    ConnectionLimit,
    /// The peer refused our CONNECT.
    Refused,
    /// The peer sent DISCONNECT.
    PeerDisconnected,
    /// A local service unregistered.
    Unregistered,
    /// The gossip exchange completed.
    GossipComplete,
    /// This node is shutting down.
    Quitting,
    /// The neighbor was explicitly forgotten.
    Forgotten,
    /// The byte stream stopped decoding as messages.
    DecodeError,
}

impl From<DisconnectReason> for Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerTimeout(what) => write!(f, "{} timed out", what),
            Self::VersionMismatch(version) => {
                write!(f, "incompatible protocol version {}", version)
            }
            Self::NameConflict => write!(f, "server name already in use"),
            Self::ConnectionLimit => write!(f, "connection limit reached"),
            Self::Refused => write!(f, "peer refused the connection"),
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::Unregistered => write!(f, "service unregistered"),
            Self::GossipComplete => write!(f, "gossip delivered"),
            Self::Quitting => write!(f, "shutting down"),
            Self::Forgotten => write!(f, "neighbor forgotten"),
            Self::DecodeError => write!(f, "message decode error"),
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// This host's name, unique across the cluster.
    pub server_name: String,
    /// Our own canonical address, as peers should dial it.
    pub my_address: CanonicalAddr,
    /// Address of the public listener, reported on PUBLIC_IP.
    pub public_ip: String,
    /// Comma-separated neighbor list from the configuration file. Forwarded
    /// in CONNECT/ACCEPT so new peers learn the seeds.
    pub explicit_neighbors: String,
    /// Names of the services installed on this host, captured at startup.
    pub local_services: BTreeSet<String>,
    /// Directory holding the neighbor cache file.
    pub cache_dir: PathBuf,
    /// Upper bound on live connections, listeners included.
    pub max_connections: usize,
    /// Trace lock-related traffic too.
    pub debug_lock_messages: bool,
}

/// A command or request that can be sent to the state machine.
pub enum Command {
    /// Quiesce this node: STOP semantics.
    Stop,
    /// Cascade a SHUTDOWN through the cluster.
    Shutdown,
    /// List the live sessions.
    GetSessions(chan::Sender<Vec<SessionInfo>>),
    /// The latest LOADAVG sample per remote host.
    GetLoadAverages(chan::Sender<Vec<(String, RemoteSample)>>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "Stop"),
            Self::Shutdown => write!(f, "Shutdown"),
            Self::GetSessions(_) => write!(f, "GetSessions"),
            Self::GetLoadAverages(_) => write!(f, "GetLoadAverages"),
        }
    }
}

/// A snapshot of one session, for inspection through the handle.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub addr: SocketAddr,
    pub kind: SessionKind,
    pub name: String,
    pub server_name: String,
}

/// An instance of the bus protocol.
pub struct StateMachine<C> {
    config: Config,
    /// Live sessions, keyed by the transport address the reactor uses.
    sessions: HashMap<PeerId, Session>,
    /// Peer mesh and gossip tasks.
    pub meshmgr: MeshManager<Outbox, C>,
    /// Broadcast engine.
    broadcast: BroadcastEngine<Outbox>,
    /// Deferred messages for known-but-unregistered local services.
    cache: MessageCache,
    /// Load-average sampling.
    loadavg: LoadavgManager<Outbox, C>,
    /// Services offered elsewhere, recomputed on peer transitions.
    heard_of: BTreeSet<String>,
    shutting_down: bool,
    restart_requested: bool,
    pub clock: C,
    #[allow(dead_code)]
    rng: fastrand::Rng,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    pub outbox: Outbox,
}

impl<C> Iterator for StateMachine<C> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

impl<C: TickClock + Sync + Send> StateMachine<C> {
    /// Construct a new protocol instance.
    pub fn new(config: Config, clock: C, rng: fastrand::Rng) -> Self {
        let outbox = Outbox::default();
        let meshmgr = MeshManager::new(
            config.my_address,
            &config.cache_dir,
            outbox.clone(),
            clock.clone(),
        );
        let broadcast = BroadcastEngine::new(&config.server_name, config.my_address, outbox.clone());
        let loadavg = LoadavgManager::new(config.my_address, outbox.clone(), clock.clone());

        Self {
            config,
            sessions: HashMap::new(),
            meshmgr,
            broadcast,
            cache: MessageCache::default(),
            loadavg,
            heard_of: BTreeSet::new(),
            shutting_down: false,
            restart_requested: false,
            clock,
            rng,
            outbox,
        }
    }

    /// Whether a RELOADCONFIG asked for the process to be restarted.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    /// Process a user command.
    pub async fn command(&mut self, cmd: Command) {
        debug!(target: "bus", "Received command: {:?}", cmd);

        match cmd {
            Command::Stop => self.shutdown(false, false),
            Command::Shutdown => self.shutdown(true, false),
            Command::GetSessions(reply) => {
                let sessions = self
                    .sessions
                    .values()
                    .map(|s| SessionInfo {
                        addr: s.addr,
                        kind: s.kind,
                        name: s.name().to_owned(),
                        server_name: s.server_name.clone(),
                    })
                    .collect();
                reply.send_async(sessions).await.ok();
            }
            Command::GetLoadAverages(reply) => {
                let samples = self
                    .loadavg
                    .samples()
                    .map(|(host, sample)| (host.to_owned(), *sample))
                    .collect();
                reply.send_async(samples).await.ok();
            }
        }
    }

    /// The byte stream on a connection stopped decoding; answer UNKNOWN
    /// with a best-effort command token and note the offender.
    pub fn invalid_message(&mut self, addr: PeerId, token: &str, error: impl fmt::Display) {
        warn!(target: "bus", "{}: Invalid message ({})", addr, error);

        self.outbox.unknown(addr, token);
    }

    /// Close a connection.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.outbox.disconnect(addr, reason);
    }

    // Routing ////////////////////////////////////////////////////////////////

    /// One inbound message, from a TCP session (`source` set) or the UDP
    /// signal socket.
    pub fn process_message(&mut self, source: Option<PeerId>, mut msg: Message, udp: bool) {
        let now = self.clock.local_time();

        // Broadcasts carry a unique id; a second arrival of the same id, or
        // an expired message, is dropped at the door.
        if msg.has_param("broadcast_msgid") && self.broadcast.should_drop(&msg, now) {
            return;
        }

        // Messages from local services are stamped with their origin so the
        // destination can reply to the specific instance.
        if let Some(session) = source.and_then(|addr| self.sessions.get(&addr)) {
            if session.kind == SessionKind::Local {
                if msg.sent_from_server().is_none() {
                    msg.set_param("sent_from_server", self.config.server_name.clone());
                }
                if msg.sent_from_service().is_none() && session.is_named() {
                    msg.set_param("sent_from_service", session.name().to_owned());
                }
            }
        }

        let server_name = if msg.server == "." {
            self.config.server_name.clone()
        } else {
            msg.server.clone()
        };

        if self.config.debug_lock_messages || !is_lock_traffic(&msg) {
            trace!(
                target: "bus",
                "received command=[{}], server_name=[{}], service=[{}], message=[{}]",
                msg.command,
                server_name,
                msg.service,
                msg
            );
        }

        let for_this_server = server_name.is_empty()
            || server_name == self.config.server_name
            || server_name == "*";

        if for_this_server && (msg.service.is_empty() || msg.service == DAEMON_SERVICE) {
            self.dispatch_local(source, &msg, udp);
        } else {
            self.route(source, msg, &server_name, now);
        }
    }

    /// A message addressed to the daemon itself.
    fn dispatch_local(&mut self, source: Option<PeerId>, msg: &Message, udp: bool) {
        let command = msg.command.as_str();

        if self.shutting_down {
            // An UNREGISTER is still processed: it may be the reply to our
            // own DISCONNECTING. UDP arrivals are simply ignored.
            if command != "UNREGISTER" {
                if let (false, Some(addr)) = (udp, source) {
                    self.outbox.quitting(addr);
                    self.outbox.disconnect(addr, DisconnectReason::Quitting);
                }
                return;
            }
        }

        if udp && !UDP_COMMANDS.contains(&command) {
            error!(target: "bus", "{} is only accepted over a TCP connection", command);
            return;
        }

        match (command, source) {
            ("ACCEPT", Some(addr)) => self.handle_accept(addr, msg),
            ("COMMANDS", Some(addr)) => self.handle_commands(addr, msg),
            ("CONNECT", Some(addr)) => self.handle_connect(addr, msg),
            ("DISCONNECT", Some(addr)) => self.handle_disconnect(addr),
            ("FORGET", _) => self.handle_forget(msg),
            ("GOSSIP", Some(addr)) => self.handle_gossip(addr, msg),
            ("HELP", Some(addr)) => {
                self.outbox.message(
                    addr,
                    Message::new("COMMANDS").with_param("list", COMMANDS_LIST),
                );
            }
            ("LISTENLOADAVG", _) => self.handle_listen_loadavg(msg),
            ("LISTSERVICES", _) => {
                let list = self
                    .sessions
                    .values()
                    .map(|s| s.name().to_owned())
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(target: "bus", "current list of connections: {}", list);
            }
            ("LOADAVG", _) => self.handle_loadavg(msg),
            ("LOG", _) => {
                // The logging backend is wired up by the binary; nothing to
                // reopen here.
                info!(target: "bus", "Logging reconfiguration requested");
            }
            ("PUBLIC_IP", Some(addr)) => {
                self.outbox.message(
                    addr,
                    Message::new("SERVER_PUBLIC_IP")
                        .with_param("public_ip", self.config.public_ip.clone()),
                );
            }
            ("QUITTING", _) => {
                info!(target: "bus", "Received a QUITTING as a reply to a message");
            }
            ("RECEIVED", Some(addr)) => {
                // Confirmation of our GOSSIP; the task is done.
                self.meshmgr.gossip_confirmed(&addr.into());
                self.outbox
                    .disconnect(addr, DisconnectReason::GossipComplete);
            }
            ("REFUSE", Some(addr)) => self.handle_refuse(addr, msg),
            ("REGISTER", Some(addr)) => self.handle_register(addr, msg),
            ("REGISTERFORLOADAVG", Some(addr)) => {
                if let Some(session) = self.sessions.get_mut(&addr) {
                    session.wants_loadavg = true;
                    self.loadavg.set_enabled(true);
                }
            }
            ("RELOADCONFIG", _) => self.shutdown(false, true),
            ("SERVICESTATUS", Some(addr)) => self.handle_service_status(addr, msg),
            ("SHUTDOWN", _) => self.shutdown(true, false),
            ("STOP", _) => self.shutdown(false, false),
            ("UNKNOWN", _) => {
                error!(
                    target: "bus",
                    "peer told us it does not know command \"{}\"; we probably did not get the expected result",
                    msg.param("command").unwrap_or_default()
                );
            }
            ("UNREGISTER", Some(addr)) => self.handle_unregister(addr, msg),
            ("UNREGISTERFORLOADAVG", Some(addr)) => {
                if let Some(session) = self.sessions.get_mut(&addr) {
                    session.wants_loadavg = false;
                }
                if !self.sessions.values().any(|s| s.wants_loadavg) {
                    self.loadavg.set_enabled(false);
                }
            }
            (_, source) => {
                if let Some(addr) = source {
                    if !udp {
                        self.outbox.unknown(addr, command);
                    }
                }
                error!(
                    target: "bus",
                    "unknown command \"{}\" or not sent on the right kind of connection",
                    command
                );
            }
        }
    }

    /// A message addressed to a service, somewhere.
    fn route(&mut self, source: Option<PeerId>, msg: Message, server_name: &str, now: LocalTime) {
        let service = msg.service.clone();

        // Broadcasting?
        if service == "*" || service == "?" || service == "." {
            if !server_name.is_empty() && server_name != "*" && service != "." {
                // Addressing one server and broadcasting to all of them at
                // the same time is contradictory.
                error!(
                    target: "bus",
                    "cannot specify both a server name ({}) and \"*\" or \"?\" as the service",
                    server_name
                );
                return;
            }
            let candidates = self.broadcast_candidates(&msg.command);
            self.broadcast.broadcast(&msg, candidates, now);
            return;
        }

        let all_servers = server_name.is_empty() || server_name == "*";

        // A registered local service wins; everything else collects the
        // remote daemons that might know the target.
        let mut local_target = None;
        let mut remotes = Vec::new();

        for (addr, session) in &self.sessions {
            let matches_server = all_servers || server_name == session.server_name;
            if !matches_server {
                continue;
            }
            match session.kind {
                SessionKind::Local if session.is_named() && session.name() == service => {
                    // Only one matching local session is used.
                    if local_target.is_none() {
                        local_target = Some(*addr);
                    }
                }
                SessionKind::Remote => remotes.push(Candidate {
                    addr: *addr,
                    host: addr.ip().to_string(),
                    kind: CandidateKind::Peer {
                        class: NetworkClass::of(addr.ip()),
                    },
                }),
                _ => {}
            }
        }

        if let Some(addr) = local_target {
            if let Some(session) = self.sessions.get(&addr) {
                self.verify_command(session, &msg);
            }
            self.outbox.message(addr, msg);
            return;
        }

        // A service expected on this host but not running right now gets
        // its messages cached until it REGISTERs.
        if (all_servers || server_name == self.config.server_name)
            && self.config.local_services.contains(&service)
        {
            if self.cache.push(msg.clone(), now) {
                debug!(target: "bus", "caching message {} for service \"{}\"", msg.command, service);
            } else {
                self.transmission_report(source, &msg);
            }
            return;
        }

        // Addressed here specifically, but nothing of that name exists.
        if server_name == self.config.server_name {
            debug!(
                target: "bus",
                "received event \"{}\" for local service \"{}\", which is not currently registered. Dropping message",
                msg.command,
                service
            );
            self.transmission_report(source, &msg);
            return;
        }

        if !remotes.is_empty() {
            self.broadcast.forward(&msg, remotes, now);
        } else {
            debug!(
                target: "bus",
                "no connection knows of service \"{}\" on server \"{}\", dropping {}",
                service,
                server_name,
                msg.command
            );
        }
    }

    fn transmission_report(&mut self, source: Option<PeerId>, msg: &Message) {
        if msg.param("transmission_report") == Some("failure") {
            if let Some(addr) = source {
                self.outbox.transmission_failed(addr);
            }
        }
    }

    // Handshake //////////////////////////////////////////////////////////////

    fn handle_connect(&mut self, addr: PeerId, msg: &Message) {
        // Peer daemons come in on the public listener, never the loopback
        // one.
        if self
            .sessions
            .get(&addr)
            .is_some_and(|s| s.accepted_on == Listener::Local)
        {
            error!(target: "bus", "CONNECT received on the local listener, dropping");
            return;
        }

        let (Some(version), Some(his_address), Some(server_name)) = (
            msg.param("version"),
            msg.param("my_address"),
            msg.param("server_name"),
        ) else {
            error!(
                target: "bus",
                "CONNECT was sent without a \"version\", \"my_address\" or \"server_name\" parameter, all are mandatory"
            );
            return;
        };

        if msg.int_param("version") != Some(PROTOCOL_VERSION) {
            error!(
                target: "bus",
                "CONNECT was sent with an incompatible version. Expected {}, received {}",
                PROTOCOL_VERSION,
                version
            );
            self.outbox.disconnect(
                addr,
                DisconnectReason::VersionMismatch(msg.int_param("version").unwrap_or(-1)),
            );
            return;
        }

        // Another computer already using that name?
        let conflict = self
            .sessions
            .iter()
            .any(|(other, s)| *other != addr && s.server_name == server_name);
        if conflict {
            error!(
                target: "bus",
                "CONNECT from \"{}\" but we already have another computer using that same name",
                server_name
            );
            self.outbox.message(
                addr,
                Message::new("REFUSE").with_param("conflict", "name"),
            );
            self.outbox.disconnect(addr, DisconnectReason::NameConflict);
            return;
        }

        if self.sessions.len() + FIXED_CONNECTIONS >= self.config.max_connections {
            self.outbox.message(addr, Message::new("REFUSE"));
            self.outbox
                .disconnect(addr, DisconnectReason::ConnectionLimit);
            return;
        }

        let his_address = match CanonicalAddr::parse(his_address, DEFAULT_PORT) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(target: "bus", "CONNECT carried unusable my_address: {}", err);
                return;
            }
        };

        let server_name = server_name.to_owned();
        let services = msg.param("services").map(str::to_owned);
        let heard_of = msg.param("heard_of").map(str::to_owned);
        let neighbors = msg.param("neighbors").map(str::to_owned);

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let now = self.clock.local_time();

        session.kind = SessionKind::Remote;
        session.server_name = server_name.clone();
        session.peer_address = Some(his_address);
        session.start(now);
        if let Some(services) = &services {
            session.set_services(services);
        }
        if let Some(heard_of) = &heard_of {
            session.set_heard_of(heard_of);
        }
        if let Some(neighbors) = &neighbors {
            self.meshmgr.add_neighbors(neighbors);
        }

        self.refresh_heard_of();

        let mut reply = Message::new("ACCEPT")
            .with_param("server_name", self.config.server_name.clone())
            .with_param("my_address", self.config.my_address.to_string());
        if !self.config.explicit_neighbors.is_empty() {
            reply.set_param("neighbors", self.config.explicit_neighbors.clone());
        }
        let services = self.local_services_csv();
        if !services.is_empty() {
            reply.set_param("services", services);
        }
        let heard_of = self.heard_of_csv();
        if !heard_of.is_empty() {
            reply.set_param("heard_of", heard_of);
        }
        self.outbox.message(addr, reply);
        self.outbox.help(addr);

        // He is a neighbor too; useful on a restart to connect quickly.
        self.meshmgr.add_neighbors(&his_address.to_string());

        // The peer found us on its own; receiving its CONNECT is as good as
        // a RECEIVED, so any gossip task towards it dies here.
        if let Some(socket) = self.meshmgr.gossip_confirmed(&his_address) {
            self.outbox
                .disconnect(socket, DisconnectReason::GossipComplete);
        }

        self.register_for_loadavg(his_address);
        self.announce_remote_connection(&server_name);
        self.outbox.push(output::Io::Event(Event::PeerConnected {
            server_name,
            addr,
        }));
        self.send_status_about(addr, None);
    }

    fn handle_accept(&mut self, addr: PeerId, msg: &Message) {
        let (Some(server_name), Some(his_address)) =
            (msg.param("server_name"), msg.param("my_address"))
        else {
            error!(
                target: "bus",
                "ACCEPT was received without a \"server_name\" or \"my_address\" parameter, both are mandatory"
            );
            return;
        };

        let his_address = match CanonicalAddr::parse(his_address, DEFAULT_PORT) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(target: "bus", "ACCEPT carried unusable my_address: {}", err);
                return;
            }
        };

        // An ACCEPT echoing our own address back is a connection to
        // ourselves; do not keep a self-edge.
        if his_address == self.config.my_address {
            warn!(target: "bus", "dropping connection to self ({})", his_address);
            self.outbox
                .disconnect(addr, DisconnectReason::PeerDisconnected);
            return;
        }

        let server_name = server_name.to_owned();
        let services = msg.param("services").map(str::to_owned);
        let heard_of = msg.param("heard_of").map(str::to_owned);
        let neighbors = msg.param("neighbors").map(str::to_owned);

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let now = self.clock.local_time();

        session.kind = SessionKind::Remote;
        session.server_name = server_name.clone();
        session.peer_address = Some(his_address);
        session.start(now);
        if let Some(services) = &services {
            session.set_services(services);
        }
        if let Some(heard_of) = &heard_of {
            session.set_heard_of(heard_of);
        }
        if let Some(neighbors) = &neighbors {
            self.meshmgr.add_neighbors(neighbors);
        }

        self.refresh_heard_of();
        self.outbox.help(addr);
        self.register_for_loadavg(his_address);
        self.announce_remote_connection(&server_name);
        self.outbox.push(output::Io::Event(Event::PeerConnected {
            server_name,
            addr,
        }));
        self.send_status_about(addr, None);
    }

    fn handle_commands(&mut self, addr: PeerId, msg: &Message) {
        let Some(list) = msg.param("list") else {
            error!(target: "bus", "COMMANDS was sent without a \"list\" parameter");
            return;
        };

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        session.set_commands(list);

        // In debug builds, verify the few commands we already sent this
        // connection, or are very likely to send it, are advertised.
        if cfg!(debug_assertions) {
            let mut expected = vec!["HELP", "QUITTING", "STOP", "UNKNOWN"];
            expected.push(if session.remote { "ACCEPT" } else { "READY" });

            for command in expected {
                if !session.understands(command) {
                    error!(
                        target: "bus",
                        "connection \"{}\" does not understand {}",
                        session.name(),
                        command
                    );
                }
            }
        }
    }

    fn handle_disconnect(&mut self, addr: PeerId) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let now = self.clock.local_time();
        session.end(now);

        if session.kind != SessionKind::Remote {
            error!(
                target: "bus",
                "DISCONNECT was sent from a connection which is not of the right type ({:?})",
                session.kind
            );
            self.send_status_about(addr, None);
            return;
        }

        session.kind = SessionKind::Down;
        let server_name = session.server_name.clone();
        let canonical = session.peer_address.unwrap_or_else(|| addr.into());

        // If we own this edge, we are in charge of reconnecting; the peer
        // likely shut down, so pause rather than hammer it.
        self.meshmgr.peer_shutting_down(&canonical);
        self.outbox
            .disconnect(addr, DisconnectReason::PeerDisconnected);

        self.refresh_heard_of();

        if !server_name.is_empty() {
            let disconnected = Message::new("DISCONNECTED")
                .with_service(".")
                .with_param("server_name", server_name);
            let candidates = self.broadcast_candidates("DISCONNECTED");
            self.broadcast
                .broadcast(&disconnected, candidates, self.clock.local_time());
        }

        self.send_status_about(addr, None);
    }

    fn handle_refuse(&mut self, addr: PeerId, msg: &Message) {
        // We were refused on an edge we initiated; the canonical address is
        // the one we dialed.
        let canonical = CanonicalAddr::from(addr);

        if msg.has_param("shutdown") {
            self.meshmgr.peer_shutting_down(&canonical);
        } else {
            self.meshmgr.too_busy(&canonical);
        }

        // We remain responsible for trying again later; right now the
        // connection is useless.
        self.outbox.disconnect(addr, DisconnectReason::Refused);
    }

    fn handle_gossip(&mut self, addr: PeerId, msg: &Message) {
        let Some(his_address) = msg.param("my_address") else {
            // Full gossip propagation (`heard_of=`) never materialized in
            // the protocol; GOSSIP is the "I exist, connect back" handshake.
            error!(target: "bus", "GOSSIP is missing its \"my_address\" parameter");
            return;
        };

        self.meshmgr.add_neighbors(his_address);
        self.outbox.received(addr);
    }

    fn handle_register(&mut self, addr: PeerId, msg: &Message) {
        let (Some(service), Some(version)) = (msg.param("service"), msg.param("version")) else {
            error!(
                target: "bus",
                "REGISTER was called without a \"service\" and/or a \"version\" parameter, both are mandatory"
            );
            return;
        };
        if msg.int_param("version") != Some(PROTOCOL_VERSION) {
            error!(
                target: "bus",
                "REGISTER was called with an incompatible version. Expected {}, received {}",
                PROTOCOL_VERSION,
                version
            );
            return;
        }
        if service.is_empty() {
            error!(target: "bus", "REGISTER needs a non-empty service name");
            return;
        }

        let service = service.to_owned();
        let now = self.clock.local_time();

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        // Services register over the loopback listener only.
        if session.remote {
            error!(target: "bus", "REGISTER received on the public listener, dropping");
            return;
        }
        session.set_name(&service);
        session.kind = SessionKind::Local;
        session.start(now);

        // The connection uses READY as its trigger to start working.
        self.outbox.ready(addr);
        self.outbox.help(addr);

        self.outbox.push(output::Io::Event(Event::ServiceRegistered {
            name: service.clone(),
        }));
        self.send_status_about(addr, None);

        // Forward messages that were waiting for this service, in their
        // original receive order.
        for cached in self.cache.drain_for(&service, now) {
            self.outbox.message(addr, cached);
        }
    }

    fn handle_unregister(&mut self, addr: PeerId, msg: &Message) {
        if !msg.has_param("service") {
            error!(
                target: "bus",
                "UNREGISTER was called without a \"service\" parameter, which is mandatory"
            );
            return;
        }

        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let now = self.clock.local_time();
        let name = session.name().to_owned();

        session.kind = SessionKind::Down;
        session.end(now);
        // The session must not receive its own STATUS.
        session.remove_command("STATUS");

        self.send_status_about(addr, None);

        if let Some(session) = self.sessions.get_mut(&addr) {
            session.clear_name();
        }
        self.outbox
            .push(output::Io::Event(Event::ServiceUnregistered { name }));

        // No reason to wait for the HUP.
        self.outbox.disconnect(addr, DisconnectReason::Unregistered);
    }

    fn handle_forget(&mut self, msg: &Message) {
        let Some(ip) = msg.param("ip") else {
            error!(target: "bus", "FORGET was sent without its \"ip\" parameter");
            return;
        };
        let Ok(addr) = CanonicalAddr::parse(ip, DEFAULT_PORT) else {
            error!(target: "bus", "FORGET carried an unusable ip \"{}\"", ip);
            return;
        };

        for socket in self.meshmgr.forget(&addr) {
            self.outbox.disconnect(socket, DisconnectReason::Forgotten);
        }

        // Sent directly to this instance only? Then it is our job to let
        // the remaining computers forget that address too.
        if !msg.has_param("broadcast_hops") {
            let forget = Message::new("FORGET")
                .with_server("*")
                .with_service(DAEMON_SERVICE)
                .with_param("ip", addr.to_string());
            let candidates = self.broadcast_candidates("FORGET");
            self.broadcast
                .broadcast(&forget, candidates, self.clock.local_time());
        }
    }

    fn handle_service_status(&mut self, addr: PeerId, msg: &Message) {
        let service = msg.param("service").unwrap_or_default();
        if service.is_empty() {
            error!(
                target: "bus",
                "The SERVICESTATUS service parameter cannot be an empty string"
            );
            return;
        }

        let status = match self
            .sessions
            .values()
            .find(|s| s.is_named() && s.name() == service)
        {
            Some(session) => status_message(session.name(), Some(session)),
            // Service is totally unknown: report a synthetic down status.
            None => status_message(service, None),
        };

        if let Some(session) = self.sessions.get(&addr) {
            self.verify_command(session, &status);
        }
        self.outbox.message(addr, status);
    }

    fn handle_loadavg(&mut self, msg: &Message) {
        let (Some(avg), Some(my_address), Some(timestamp)) = (
            msg.param("avg"),
            msg.param("my_address"),
            msg.param("timestamp"),
        ) else {
            error!(target: "bus", "LOADAVG is missing one of avg, my_address, timestamp");
            return;
        };
        self.loadavg.record_remote(avg, my_address, timestamp);
    }

    fn handle_listen_loadavg(&mut self, msg: &Message) {
        let Some(ips) = msg.param("ips") else {
            error!(target: "bus", "LISTENLOADAVG is missing its \"ips\" parameter");
            return;
        };

        // Remote daemons come and go; the set is kept so every one of them
        // gets our REGISTERFORLOADAVG when it (re)appears.
        for ip in self.loadavg.listen(ips) {
            let target = self.sessions.values().find_map(|s| {
                s.peer_address.filter(|peer| {
                    peer.host_string() == ip || peer.to_string() == ip
                })?;
                Some(s.addr)
            });
            if let Some(target) = target {
                self.outbox.message(target, Message::new("REGISTERFORLOADAVG"));
            }
        }
    }

    /// A peer session for `address` appeared; if some local service asked
    /// to listen to that host, subscribe to its LOADAVG.
    fn register_for_loadavg(&mut self, address: CanonicalAddr) {
        if self.loadavg.is_listening_for(&address.host_string())
            || self.loadavg.is_listening_for(&address.to_string())
        {
            let target = self
                .sessions
                .values()
                .find(|s| s.peer_address == Some(address))
                .map(|s| s.addr);
            if let Some(target) = target {
                self.outbox.message(target, Message::new("REGISTERFORLOADAVG"));
            }
        }
    }

    // Status & heard-of //////////////////////////////////////////////////////

    /// Publish the status of the given connection to every session that
    /// asked for STATUS messages, or to `reply_to` alone.
    fn send_status_about(&mut self, about: PeerId, reply_to: Option<PeerId>) {
        let Some(session) = self.sessions.get(&about) else {
            return;
        };
        let status = status_message(session.name(), Some(session));

        if let Some(reply_to) = reply_to {
            self.outbox.message(reply_to, status);
            return;
        }

        let interested: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.understands("STATUS"))
            .map(|s| s.addr)
            .collect();
        for addr in interested {
            self.outbox.message(addr, status.clone());
        }
    }

    /// Recompute the services offered elsewhere: everything peer daemons
    /// advertise or heard of, minus what is ours.
    fn refresh_heard_of(&mut self) {
        self.heard_of.clear();

        for session in self
            .sessions
            .values()
            .filter(|s| s.kind == SessionKind::Remote)
        {
            self.heard_of
                .extend(session.services().map(str::to_owned));
            self.heard_of
                .extend(session.heard_of().map(str::to_owned));
        }
        for local in &self.config.local_services {
            self.heard_of.remove(local);
        }
    }

    fn heard_of_csv(&self) -> String {
        self.heard_of
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn local_services_csv(&self) -> String {
        self.config
            .local_services
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Let local services know a peer daemon appeared; of interest to
    /// cluster-management services.
    fn announce_remote_connection(&mut self, server_name: &str) {
        let announce = Message::new("NEWREMOTECONNECTION")
            .with_service(".")
            .with_param("server_name", server_name.to_owned());
        let candidates = self.broadcast_candidates("NEWREMOTECONNECTION");
        self.broadcast
            .broadcast(&announce, candidates, self.clock.local_time());
    }

    fn broadcast_candidates(&self, command: &str) -> Vec<Candidate> {
        self.sessions
            .values()
            .filter_map(|session| match session.kind {
                SessionKind::Local => Some(Candidate {
                    addr: session.addr,
                    host: session.addr.ip().to_string(),
                    kind: CandidateKind::LocalService {
                        understands: session.understands(command),
                    },
                }),
                SessionKind::Remote => Some(Candidate {
                    addr: session.addr,
                    host: session.addr.ip().to_string(),
                    kind: CandidateKind::Peer {
                        class: NetworkClass::of(session.addr.ip()),
                    },
                }),
                SessionKind::Down => None,
            })
            .collect()
    }

    /// Check, in debug builds, that a connection advertised the command
    /// about to be sent to it.
    fn verify_command(&self, session: &Session, msg: &Message) {
        if cfg!(debug_assertions) && session.has_commands() && !session.understands(&msg.command) {
            error!(
                target: "bus",
                "connection \"{}\" does not understand {}",
                session.name(),
                msg.command
            );
        }
    }

    // Connection lifecycle ///////////////////////////////////////////////////

    /// A TCP connection was established.
    pub fn connection_made(
        &mut self,
        addr: PeerId,
        link: Link,
        listener: Listener,
    ) -> bool {
        if link.is_outbound() {
            match self.meshmgr.socket_connected(&addr) {
                Some(OutboundRole::Mesh) => {
                    let mut session = Session::new(addr, link, Listener::Public);
                    session.peer_address = Some(addr.into());
                    self.sessions.insert(addr, session);

                    self.send_connect(addr);
                }
                Some(OutboundRole::Gossip) => {
                    self.sessions
                        .insert(addr, Session::new(addr, link, Listener::Public));

                    // Each time we reconnect, tell them again; the task only
                    // dies on their RECEIVED.
                    let my_address = self.config.my_address.to_string();
                    self.outbox.gossip(addr, &my_address);
                }
                None => {
                    warn!(target: "bus", "{}: outbound connection without an owner, closing", addr);
                    self.outbox
                        .disconnect(addr, DisconnectReason::PeerTimeout("ownerless connect"));
                    return false;
                }
            }
            return true;
        }

        if self.shutting_down {
            self.outbox.quitting(addr);
            self.outbox.disconnect(addr, DisconnectReason::Quitting);
            return false;
        }

        let mut session = Session::new(addr, link, listener);
        if listener == Listener::Local {
            // Local services are ours; the server name is this host's.
            session.server_name = self.config.server_name.clone();
        }
        self.sessions.insert(addr, session);

        true
    }

    /// Our CONNECT, sent as soon as an owned mesh edge comes up.
    fn send_connect(&mut self, addr: PeerId) {
        let mut connect = Message::new("CONNECT")
            .with_param("version", PROTOCOL_VERSION.to_string())
            .with_param("my_address", self.config.my_address.to_string())
            .with_param("server_name", self.config.server_name.clone());
        if !self.config.explicit_neighbors.is_empty() {
            connect.set_param("neighbors", self.config.explicit_neighbors.clone());
        }
        let services = self.local_services_csv();
        if !services.is_empty() {
            connect.set_param("services", services);
        }
        let heard_of = self.heard_of_csv();
        if !heard_of.is_empty() {
            connect.set_param("heard_of", heard_of);
        }

        self.outbox.message(addr, connect);
    }

    /// A connection went away, for whatever reason. The reactor calls this
    /// exactly once per socket, so the final status transition is always
    /// published from here — never from a drop.
    pub fn connection_lost(&mut self, addr: PeerId) {
        if let Some(mut session) = self.sessions.remove(&addr) {
            let now = self.clock.local_time();

            match session.kind {
                SessionKind::Down => {
                    // Never negotiated, or DISCONNECT/UNREGISTER already ran
                    // the teardown.
                }
                SessionKind::Local => {
                    session.end(now);
                    session.kind = SessionKind::Down;
                    session.remove_command("STATUS");

                    let status = status_message(session.name(), Some(&session));
                    let interested: Vec<PeerId> = self
                        .sessions
                        .values()
                        .filter(|s| s.understands("STATUS"))
                        .map(|s| s.addr)
                        .collect();
                    for peer in interested {
                        self.outbox.message(peer, status.clone());
                    }
                    if session.is_named() {
                        self.outbox
                            .push(output::Io::Event(Event::ServiceUnregistered {
                                name: session.name().to_owned(),
                            }));
                    }
                }
                SessionKind::Remote => {
                    session.end(now);
                    self.refresh_heard_of();
                    self.outbox
                        .push(output::Io::Event(Event::PeerDisconnected { addr }));
                }
            }
        }

        // Reschedules the mesh edge or gossip task owning this socket.
        self.meshmgr.socket_disconnected(&addr);
        self.flush_unreachable();
    }

    /// Broadcast UNREACHABLE for every address whose dial failed.
    fn flush_unreachable(&mut self) {
        let now = self.clock.local_time();
        for addr in self.meshmgr.take_unreachable() {
            let unreachable = Message::new("UNREACHABLE")
                .with_service(".")
                .with_param("who", addr.to_string());
            let candidates = self.broadcast_candidates("UNREACHABLE");
            self.broadcast.broadcast(&unreachable, candidates, now);
        }
    }

    // Shutdown ///////////////////////////////////////////////////////////////

    /// STOP, SHUTDOWN and RELOADCONFIG teardown.
    ///
    /// `quitting` selects the verb peers receive: SHUTDOWN cascades through
    /// the cluster, DISCONNECT quiesces this node only.
    fn shutdown(&mut self, quitting: bool, restart: bool) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.restart_requested = restart;

        debug!(
            target: "bus",
            "shutting down ({})",
            if quitting { "SHUTDOWN" } else if restart { "RELOADCONFIG" } else { "STOP" }
        );

        self.outbox
            .push(output::Io::Event(Event::ShuttingDown { restart }));

        // All gossiping can stop at once.
        for socket in self.meshmgr.stop() {
            self.outbox.disconnect(socket, DisconnectReason::Quitting);
        }

        let sessions: Vec<(PeerId, SessionKind, bool)> = self
            .sessions
            .values()
            .map(|s| (s.addr, s.kind, s.understands("DISCONNECTING")))
            .collect();

        for (addr, kind, wants_disconnecting) in sessions {
            match kind {
                SessionKind::Down => {
                    // Not initialized; just get rid of it.
                    self.outbox.disconnect(addr, DisconnectReason::Quitting);
                }
                SessionKind::Remote => {
                    // A peer daemon: under SHUTDOWN the whole cluster goes
                    // down with us.
                    let verb = if quitting { "SHUTDOWN" } else { "DISCONNECT" };
                    self.outbox.message(addr, Message::new(verb));
                    self.outbox.disconnect(addr, DisconnectReason::Quitting);
                }
                SessionKind::Local => {
                    // A service may want to know it is losing its bus; the
                    // disconnect drains whatever is still buffered either
                    // way.
                    if wants_disconnecting {
                        self.outbox.message(addr, Message::new("DISCONNECTING"));
                    }
                    self.outbox.disconnect(addr, DisconnectReason::Quitting);
                }
            }
        }

        self.outbox.quit();
    }
}

/// Build a STATUS message for a connection, or a synthetic down status when
/// no such connection exists.
fn status_message(name: &str, session: Option<&Session>) -> Message {
    let mut status = Message::new("STATUS")
        .with_param("cache", "no")
        .with_param("service", name.to_owned());

    match session {
        Some(session) => {
            status.set_param(
                "status",
                if session.kind == SessionKind::Down {
                    "down"
                } else {
                    "up"
                },
            );
            if session.started_at() != -1 {
                status.set_param("up_since", (session.started_at() / 1_000_000).to_string());
            }
            if session.ended_at() != -1 {
                status.set_param("down_since", (session.ended_at() / 1_000_000).to_string());
            }
        }
        None => {
            status.set_param("status", "down");
        }
    }
    status
}

/// Lock traffic is chatty; unless configured otherwise it stays out of the
/// trace log.
fn is_lock_traffic(msg: &Message) -> bool {
    msg.command == "UNLOCKED"
        || msg
            .sent_from_service()
            .is_some_and(|s| s == "lock" || s.starts_with("lock_"))
}

#[async_trait]
impl<C: TickClock + Sync + Send> crate::net::StateMachine for StateMachine<C> {
    type Message = Message;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.push(output::Io::Event(Event::Initializing));

        // The first add also loads the cached neighbor file.
        let neighbors = self.config.explicit_neighbors.clone();
        self.meshmgr.add_neighbors(&neighbors);
        self.meshmgr.received_wake();

        self.outbox.push(output::Io::Event(Event::Ready { time }));
    }

    async fn message_received(&mut self, addr: &PeerId, msg: Cow<'_, Message>) {
        if !self.sessions.contains_key(addr) {
            debug!(target: "bus", "Received {} from unknown connection {}", msg.command, addr);
            return;
        }
        self.process_message(Some(*addr), msg.into_owned(), false);
    }

    async fn datagram_received(&mut self, from: SocketAddr, msg: Cow<'_, Message>) {
        trace!(target: "bus", "Signal {} from {}", msg.command, from);

        self.process_message(None, msg.into_owned(), true);
    }

    fn attempted(&mut self, _addr: &PeerId) {}

    fn connected(
        &mut self,
        addr: PeerId,
        _local_addr: &SocketAddr,
        link: Link,
        listener: Listener,
    ) -> bool {
        self.connection_made(addr, link, listener)
    }

    async fn disconnected(&mut self, addr: &PeerId, reason: Disconnect<DisconnectReason>) {
        debug!(target: "bus", "{}: connection lost: {}", addr, reason);

        self.connection_lost(*addr);
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    async fn timer_expired(&mut self) {
        trace!(target: "bus", "Received wake");

        self.meshmgr.received_wake();

        let subscribers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.wants_loadavg)
            .map(|s| s.addr)
            .collect();
        self.loadavg.received_wake(&subscribers);

        self.flush_unreachable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::RefClock;
    use crate::net::{Io as NetIo, LocalDuration};

    struct Harness {
        machine: StateMachine<RefClock>,
        clock: RefClock,
        _dir: tempfile::TempDir,
    }

    fn harness(local_services: &[&str]) -> Harness {
        harness_with_cap(local_services, 100)
    }

    fn harness_with_cap(local_services: &[&str], max_connections: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = RefClock::new(LocalTime::from_secs(1_000));
        let config = Config {
            server_name: "alpha".into(),
            my_address: CanonicalAddr::parse("10.0.0.2:4040", DEFAULT_PORT).unwrap(),
            public_ip: "10.0.0.2:4040".into(),
            explicit_neighbors: String::new(),
            local_services: local_services.iter().map(|s| s.to_string()).collect(),
            cache_dir: dir.path().to_path_buf(),
            max_connections,
            debug_lock_messages: false,
        };

        Harness {
            machine: StateMachine::new(config, clock.clone(), fastrand::Rng::with_seed(7)),
            clock,
            _dir: dir,
        }
    }

    impl Harness {
        fn writes(&mut self) -> Vec<(PeerId, Message)> {
            let mut out = Vec::new();
            for io in self.machine.by_ref() {
                if let NetIo::Write(addr, msg) = io {
                    out.push((addr, msg));
                }
            }
            out
        }

        fn outputs(&mut self) -> Vec<output::Io> {
            self.machine.by_ref().collect()
        }

        fn advance(&mut self, secs: u64) {
            let now = self.clock.local_time();
            self.machine
                .clock
                .set(now + LocalDuration::from_secs(secs));
        }

        fn connect_local(&mut self, port: u16) -> PeerId {
            let addr: PeerId = ([127, 0, 0, 1], port).into();
            self.machine
                .connection_made(addr, Link::Inbound, Listener::Local);
            addr
        }

        fn connect_public(&mut self, addr: &str) -> PeerId {
            let addr: PeerId = addr.parse().unwrap();
            self.machine
                .connection_made(addr, Link::Inbound, Listener::Public);
            addr
        }

        fn register(&mut self, addr: PeerId, name: &str) {
            self.machine.process_message(
                Some(addr),
                Message::new("REGISTER")
                    .with_param("service", name)
                    .with_param("version", "1"),
                false,
            );
        }

        fn peer(&mut self, transport: &str, server_name: &str, my_address: &str) -> PeerId {
            let addr = self.connect_public(transport);
            self.machine.process_message(
                Some(addr),
                Message::new("CONNECT")
                    .with_param("version", "1")
                    .with_param("my_address", my_address)
                    .with_param("server_name", server_name),
                false,
            );
            addr
        }
    }

    fn commands_of(writes: &[(PeerId, Message)], to: PeerId) -> Vec<String> {
        writes
            .iter()
            .filter(|(addr, _)| *addr == to)
            .map(|(_, msg)| msg.command.clone())
            .collect()
    }

    #[test]
    fn register_acknowledges_and_asks_for_commands() {
        let mut h = harness(&["images"]);
        let service = h.connect_local(5001);
        h.writes();

        h.register(service, "images");

        let commands = commands_of(&h.writes(), service);
        assert_eq!(commands, vec!["READY", "HELP"]);
    }

    #[test]
    fn cached_messages_drain_in_order_on_register() {
        let mut h = harness(&["images"]);
        let sender = h.connect_local(5001);
        h.writes();

        for seq in ["1", "2"] {
            h.machine.process_message(
                Some(sender),
                Message::new("PING")
                    .with_service("images")
                    .with_param("cache", "ttl=30")
                    .with_param("seq", seq),
                false,
            );
        }
        assert!(h.writes().is_empty());

        let service = h.connect_local(5002);
        h.register(service, "images");

        let pings: Vec<(PeerId, Message)> = h
            .writes()
            .into_iter()
            .filter(|(_, m)| m.command == "PING")
            .collect();
        assert_eq!(pings.len(), 2);
        assert!(pings.iter().all(|(addr, _)| *addr == service));
        assert_eq!(pings[0].1.param("seq"), Some("1"));
        assert_eq!(pings[1].1.param("seq"), Some("2"));
    }

    #[test]
    fn cached_messages_expire_past_their_ttl() {
        let mut h = harness(&["images"]);
        let sender = h.connect_local(5001);
        h.writes();

        h.machine.process_message(
            Some(sender),
            Message::new("PING")
                .with_service("images")
                .with_param("cache", "ttl=30"),
            false,
        );

        h.advance(31);
        let service = h.connect_local(5002);
        h.register(service, "images");

        assert!(h.writes().iter().all(|(_, m)| m.command != "PING"));
    }

    #[test]
    fn cache_refusal_reports_failed_transmission() {
        let mut h = harness(&["images"]);
        let sender = h.connect_local(5001);
        h.writes();

        h.machine.process_message(
            Some(sender),
            Message::new("PING")
                .with_service("images")
                .with_param("cache", "no")
                .with_param("transmission_report", "failure"),
            false,
        );

        let writes = h.writes();
        assert_eq!(commands_of(&writes, sender), vec!["TRANSMISSIONREPORT"]);
        assert_eq!(writes[0].1.param("status"), Some("failed"));
    }

    #[test]
    fn connect_handshake_replies_accept_with_our_side() {
        let mut h = harness(&["images"]);
        let peer = h.connect_public("10.0.0.9:52001");
        h.writes();

        h.machine.process_message(
            Some(peer),
            Message::new("CONNECT")
                .with_param("version", "1")
                .with_param("my_address", "10.0.0.9:4040")
                .with_param("server_name", "beta")
                .with_param("services", "db")
                .with_param("heard_of", "mail"),
            false,
        );

        let writes = h.writes();
        assert_eq!(commands_of(&writes, peer), vec!["ACCEPT", "HELP"]);

        let accept = &writes[0].1;
        assert_eq!(accept.param("server_name"), Some("alpha"));
        assert_eq!(accept.param("my_address"), Some("10.0.0.2:4040"));
        assert_eq!(accept.param("services"), Some("images"));
        // What beta offers and heard of is now heard-of here.
        let second = h.peer("10.0.0.10:52002", "gamma", "10.0.0.10:4040");
        let accept2 = h
            .writes()
            .into_iter()
            .find(|(addr, m)| *addr == second && m.command == "ACCEPT")
            .unwrap()
            .1;
        assert_eq!(accept2.param("heard_of"), Some("db,mail"));
    }

    #[test]
    fn connect_version_mismatch_closes_without_accept() {
        let mut h = harness(&[]);
        let peer = h.connect_public("10.0.0.9:52001");
        h.writes();

        h.machine.process_message(
            Some(peer),
            Message::new("CONNECT")
                .with_param("version", "99")
                .with_param("my_address", "10.0.0.9:4040")
                .with_param("server_name", "beta"),
            false,
        );

        let outputs = h.outputs();
        assert!(outputs
            .iter()
            .all(|io| !matches!(io, NetIo::Write(_, m) if m.command == "ACCEPT")));
        assert!(outputs
            .iter()
            .any(|io| matches!(io, NetIo::Disconnect(addr, _) if *addr == peer)));
    }

    #[test]
    fn connect_name_conflict_is_refused() {
        let mut h = harness(&[]);
        h.peer("10.0.0.9:52001", "beta", "10.0.0.9:4040");
        h.writes();

        let second = h.connect_public("10.0.0.10:52002");
        h.machine.process_message(
            Some(second),
            Message::new("CONNECT")
                .with_param("version", "1")
                .with_param("my_address", "10.0.0.10:4040")
                .with_param("server_name", "beta"),
            false,
        );

        let writes = h.writes();
        assert_eq!(commands_of(&writes, second), vec!["REFUSE"]);
        assert_eq!(writes[0].1.param("conflict"), Some("name"));
    }

    #[test]
    fn connection_cap_refuses_without_a_reason() {
        let mut h = harness_with_cap(&[], 7);

        // One session plus the five fixed connections stays under the cap.
        let first = h.peer("10.0.0.9:52001", "beta", "10.0.0.9:4040");
        assert!(commands_of(&h.writes(), first).contains(&"ACCEPT".to_owned()));

        let second = h.connect_public("10.0.0.10:52002");
        h.machine.process_message(
            Some(second),
            Message::new("CONNECT")
                .with_param("version", "1")
                .with_param("my_address", "10.0.0.10:4040")
                .with_param("server_name", "gamma"),
            false,
        );

        let writes = h.writes();
        assert_eq!(commands_of(&writes, second), vec!["REFUSE"]);
        assert!(!writes[0].1.has_param("conflict"));
    }

    #[test]
    fn gossip_is_confirmed_and_starts_an_edge_towards_the_smaller_peer() {
        let mut h = harness(&[]);
        let peer = h.connect_public("10.0.0.1:52001");
        h.writes();

        h.machine.process_message(
            Some(peer),
            Message::new("GOSSIP").with_param("my_address", "10.0.0.1:4040"),
            false,
        );

        assert_eq!(commands_of(&h.writes(), peer), vec!["RECEIVED"]);
        assert!(h
            .machine
            .meshmgr
            .neighbors()
            .any(|n| n == "10.0.0.1:4040"));
        assert!(h
            .machine
            .meshmgr
            .is_mesh_peer(&CanonicalAddr::parse("10.0.0.1:4040", DEFAULT_PORT).unwrap()));
    }

    #[test]
    fn outbound_mesh_edge_sends_connect_on_establishment() {
        let mut h = harness(&["images"]);
        h.machine.meshmgr.add_neighbors("10.0.0.1:4040");
        h.machine.meshmgr.received_wake();

        let outputs = h.outputs();
        let dialed = outputs
            .iter()
            .find_map(|io| match io {
                NetIo::Connect(addr) => Some(*addr),
                _ => None,
            })
            .unwrap();

        h.machine
            .connection_made(dialed, Link::Outbound, Listener::Public);

        let writes = h.writes();
        assert_eq!(commands_of(&writes, dialed), vec!["CONNECT"]);
        let connect = &writes[0].1;
        assert_eq!(connect.param("version"), Some("1"));
        assert_eq!(connect.param("my_address"), Some("10.0.0.2:4040"));
        assert_eq!(connect.param("server_name"), Some("alpha"));
        assert_eq!(connect.param("services"), Some("images"));
    }

    #[test]
    fn refuse_with_shutdown_reason_pauses_the_edge_briefly() {
        let mut h = harness(&[]);
        h.machine.meshmgr.add_neighbors("10.0.0.1:4040");
        h.machine.meshmgr.received_wake();
        let dialed: PeerId = "10.0.0.1:4040".parse().unwrap();
        h.machine
            .connection_made(dialed, Link::Outbound, Listener::Public);
        h.outputs();

        h.machine.process_message(
            Some(dialed),
            Message::new("REFUSE").with_param("shutdown", "true"),
            false,
        );
        assert!(h
            .outputs()
            .iter()
            .any(|io| matches!(io, NetIo::Disconnect(addr, _) if *addr == dialed)));
        h.machine.connection_lost(dialed);

        // Under five minutes: no redial. After: redial.
        h.advance(4 * 60);
        h.machine.meshmgr.received_wake();
        assert!(!h
            .outputs()
            .iter()
            .any(|io| matches!(io, NetIo::Connect(_))));

        h.advance(61);
        h.machine.meshmgr.received_wake();
        assert!(h
            .outputs()
            .iter()
            .any(|io| matches!(io, NetIo::Connect(addr) if *addr == dialed)));
    }

    #[test]
    fn an_accept_echoing_our_own_address_creates_no_self_edge() {
        let mut h = harness(&[]);
        h.machine.meshmgr.add_neighbors("10.0.0.1:4040");
        h.machine.meshmgr.received_wake();
        let dialed: PeerId = "10.0.0.1:4040".parse().unwrap();
        h.machine
            .connection_made(dialed, Link::Outbound, Listener::Public);
        h.outputs();

        h.machine.process_message(
            Some(dialed),
            Message::new("ACCEPT")
                .with_param("server_name", "alpha-mirror")
                .with_param("my_address", "10.0.0.2:4040"),
            false,
        );

        let outputs = h.outputs();
        assert!(outputs
            .iter()
            .any(|io| matches!(io, NetIo::Disconnect(addr, _) if *addr == dialed)));
        // The edge never negotiated: no peer announcement went out.
        assert!(!outputs.iter().any(|io| matches!(
            io,
            NetIo::Event(Event::PeerConnected { .. })
        )));
    }

    #[test]
    fn local_forward_reaches_exactly_one_session_and_stamps_origin() {
        let mut h = harness(&["images"]);
        let service = h.connect_local(5001);
        h.register(service, "images");
        let sender = h.connect_local(5002);
        h.writes();

        h.machine.process_message(
            Some(sender),
            Message::new("PING").with_service("images"),
            false,
        );

        let writes = h.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, service);
        assert_eq!(writes[0].1.command, "PING");
        assert_eq!(writes[0].1.sent_from_server(), Some("alpha"));
    }

    #[test]
    fn directed_remote_forward_is_stamped_for_deduplication() {
        let mut h = harness(&[]);
        let beta = h.peer("10.0.0.9:52001", "beta", "10.0.0.9:4040");
        let sender = h.connect_local(5001);
        h.writes();

        h.machine.process_message(
            Some(sender),
            Message::new("RUN").with_server("beta").with_service("db"),
            false,
        );

        let writes = h.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, beta);
        assert_eq!(writes[0].1.param("broadcast_msgid"), Some("alpha-1"));
    }

    #[test]
    fn broadcast_with_a_specific_server_is_contradictory() {
        let mut h = harness(&[]);
        h.peer("10.0.0.9:52001", "beta", "10.0.0.9:4040");
        let sender = h.connect_local(5001);
        h.writes();

        h.machine.process_message(
            Some(sender),
            Message::new("RUN").with_server("beta").with_service("*"),
            false,
        );

        assert!(h.writes().is_empty());
    }

    #[test]
    fn service_status_answers_up_down_and_synthetic() {
        let mut h = harness(&["images"]);
        let service = h.connect_local(5001);
        h.register(service, "images");
        let asker = h.connect_local(5002);
        h.writes();

        h.machine.process_message(
            Some(asker),
            Message::new("SERVICESTATUS").with_param("service", "images"),
            false,
        );
        h.machine.process_message(
            Some(asker),
            Message::new("SERVICESTATUS").with_param("service", "ghost"),
            false,
        );

        let writes = h.writes();
        assert_eq!(commands_of(&writes, asker), vec!["STATUS", "STATUS"]);
        assert_eq!(writes[0].1.param("status"), Some("up"));
        assert_eq!(writes[0].1.param("up_since"), Some("1000"));
        assert_eq!(writes[1].1.param("status"), Some("down"));
        assert!(!writes[1].1.has_param("up_since"));
    }

    #[test]
    fn status_is_published_on_every_down_transition() {
        let mut h = harness(&["images"]);
        let watcher = h.connect_local(5001);
        h.machine.process_message(
            Some(watcher),
            Message::new("COMMANDS").with_param("list", "READY,HELP,QUITTING,STOP,UNKNOWN,STATUS"),
            false,
        );
        let service = h.connect_local(5002);
        h.register(service, "images");
        h.writes();

        // An abrupt connection loss still produces the final STATUS.
        h.machine.connection_lost(service);

        let writes = h.writes();
        let status = writes
            .iter()
            .filter(|(addr, m)| *addr == watcher && m.command == "STATUS")
            .collect::<Vec<_>>();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].1.param("service"), Some("images"));
        assert_eq!(status[0].1.param("status"), Some("down"));
        assert_eq!(status[0].1.param("down_since"), Some("1000"));
    }

    #[test]
    fn loadavg_subscriptions_are_idempotent() {
        let mut h = harness(&[]);
        let service = h.connect_local(5001);
        h.writes();

        h.machine
            .process_message(Some(service), Message::new("REGISTERFORLOADAVG"), false);
        h.machine
            .process_message(Some(service), Message::new("REGISTERFORLOADAVG"), false);

        let timers = h
            .outputs()
            .iter()
            .filter(|io| matches!(io, NetIo::SetTimer(_)))
            .count();
        assert_eq!(timers, 1);

        h.machine
            .process_message(Some(service), Message::new("UNREGISTERFORLOADAVG"), false);
        h.machine
            .process_message(Some(service), Message::new("UNREGISTERFORLOADAVG"), false);
        assert!(!h.machine.loadavg.is_enabled());
    }

    #[test]
    fn udp_transport_gate_drops_tcp_only_commands() {
        let mut h = harness(&["images"]);

        h.machine.process_message(
            None,
            Message::new("REGISTER")
                .with_param("service", "images")
                .with_param("version", "1"),
            true,
        );

        assert!(h.outputs().is_empty());
    }

    #[test]
    fn stop_cascade_uses_the_right_verbs() {
        let mut h = harness(&[]);
        let beta = h.peer("10.0.0.9:52001", "beta", "10.0.0.9:4040");
        let plain = h.connect_local(5001);
        h.register(plain, "worker");
        let aware = h.connect_local(5002);
        h.register(aware, "janitor");
        h.machine.process_message(
            Some(aware),
            Message::new("COMMANDS")
                .with_param("list", "READY,HELP,QUITTING,STOP,UNKNOWN,DISCONNECTING"),
            false,
        );
        h.writes();

        h.machine.process_message(None, Message::new("STOP"), true);

        let outputs = h.outputs();
        let writes: Vec<(PeerId, &Message)> = outputs
            .iter()
            .filter_map(|io| match io {
                NetIo::Write(addr, msg) => Some((*addr, msg)),
                _ => None,
            })
            .collect();

        // The peer daemon is told DISCONNECT, not SHUTDOWN: a STOP does not
        // take the cluster down.
        assert!(writes
            .iter()
            .any(|(addr, m)| *addr == beta && m.command == "DISCONNECT"));
        assert!(writes.iter().all(|(_, m)| m.command != "SHUTDOWN"));
        assert!(writes
            .iter()
            .any(|(addr, m)| *addr == aware && m.command == "DISCONNECTING"));
        assert!(writes
            .iter()
            .all(|(addr, m)| !(*addr == plain && m.command == "DISCONNECTING")));

        // Every session is closed and the reactor is asked to quit.
        for addr in [beta, plain, aware] {
            assert!(outputs
                .iter()
                .any(|io| matches!(io, NetIo::Disconnect(a, _) if *a == addr)));
        }
        assert!(outputs.iter().any(|io| matches!(io, NetIo::Quit)));
        assert!(outputs.iter().any(|io| matches!(
            io,
            NetIo::Event(Event::ShuttingDown { restart: false })
        )));
    }

    #[test]
    fn shutdown_cascade_propagates_shutdown_to_peers() {
        let mut h = harness(&[]);
        let beta = h.peer("10.0.0.9:52001", "beta", "10.0.0.9:4040");
        h.writes();

        h.machine.process_message(None, Message::new("SHUTDOWN"), true);

        let writes = h.writes();
        assert!(writes
            .iter()
            .any(|(addr, m)| *addr == beta && m.command == "SHUTDOWN"));
    }

    #[test]
    fn registrations_after_stop_are_answered_quitting() {
        let mut h = harness(&["images"]);
        let service = h.connect_local(5001);
        h.writes();

        h.machine.process_message(None, Message::new("STOP"), true);
        h.writes();

        h.machine.process_message(
            Some(service),
            Message::new("REGISTER")
                .with_param("service", "images")
                .with_param("version", "1"),
            false,
        );

        assert_eq!(commands_of(&h.writes(), service), vec!["QUITTING"]);
    }

    #[test]
    fn unregister_is_still_processed_during_shutdown() {
        let mut h = harness(&["images"]);
        let service = h.connect_local(5001);
        h.register(service, "images");
        h.writes();

        h.machine.process_message(None, Message::new("STOP"), true);
        h.writes();

        h.machine.process_message(
            Some(service),
            Message::new("UNREGISTER").with_param("service", "images"),
            false,
        );

        assert!(commands_of(&h.writes(), service)
            .iter()
            .all(|c| c != "QUITTING"));
    }

    #[test]
    fn reloadconfig_requests_a_restart() {
        let mut h = harness(&[]);

        h.machine
            .process_message(None, Message::new("RELOADCONFIG"), true);

        assert!(h.machine.restart_requested());
        assert!(h.outputs().iter().any(|io| matches!(
            io,
            NetIo::Event(Event::ShuttingDown { restart: true })
        )));
    }

    #[test]
    fn unknown_commands_get_an_unknown_reply_over_tcp_only() {
        let mut h = harness(&[]);
        let service = h.connect_local(5001);
        h.writes();

        h.machine
            .process_message(Some(service), Message::new("FROBNICATE"), false);
        let writes = h.writes();
        assert_eq!(commands_of(&writes, service), vec!["UNKNOWN"]);
        assert_eq!(writes[0].1.param("command"), Some("FROBNICATE"));

        h.machine
            .process_message(None, Message::new("FROBNICATE"), true);
        assert!(h.writes().is_empty());
    }

    #[test]
    fn listeners_only_produce_their_own_session_kind() {
        let mut h = harness(&["images"]);

        // CONNECT on the loopback listener is rejected.
        let local = h.connect_local(5001);
        h.writes();
        h.machine.process_message(
            Some(local),
            Message::new("CONNECT")
                .with_param("version", "1")
                .with_param("my_address", "10.0.0.9:4040")
                .with_param("server_name", "beta"),
            false,
        );
        assert!(h.writes().is_empty());

        // REGISTER on the public listener is rejected.
        let public = h.connect_public("10.0.0.9:52001");
        h.writes();
        h.register(public, "images");
        assert!(h.writes().is_empty());
    }

    #[test]
    fn a_peers_connect_cancels_our_gossip_task_towards_it() {
        let mut h = harness(&[]);
        // 10.0.0.3 is larger than us, so we gossip at it...
        h.machine.meshmgr.add_neighbors("10.0.0.3:4040");

        // ...but it finds us first.
        h.peer("10.0.0.3:52001", "gamma", "10.0.0.3:4040");
        h.outputs();

        // No gossip dial, ever.
        h.advance(7200);
        h.machine.meshmgr.received_wake();
        assert!(!h
            .outputs()
            .iter()
            .any(|io| matches!(io, NetIo::Connect(_))));
    }

    #[test]
    fn disconnect_from_a_peer_tears_down_and_announces() {
        let mut h = harness(&[]);
        let watcher = h.connect_local(5001);
        h.machine.process_message(
            Some(watcher),
            Message::new("COMMANDS")
                .with_param("list", "READY,HELP,QUITTING,STOP,UNKNOWN,DISCONNECTED"),
            false,
        );
        let beta = h.peer("10.0.0.9:52001", "beta", "10.0.0.9:4040");
        h.writes();

        h.machine
            .process_message(Some(beta), Message::new("DISCONNECT"), false);

        let outputs = h.outputs();
        assert!(outputs
            .iter()
            .any(|io| matches!(io, NetIo::Disconnect(addr, _) if *addr == beta)));
        assert!(outputs.iter().any(|io| matches!(
            io,
            NetIo::Write(addr, m) if *addr == watcher && m.command == "DISCONNECTED"
        )));

        // The peer's services are no longer heard of.
        let gamma = h.peer("10.0.0.10:52002", "gamma", "10.0.0.10:4040");
        let accept = h
            .writes()
            .into_iter()
            .find(|(addr, m)| *addr == gamma && m.command == "ACCEPT")
            .unwrap()
            .1;
        assert!(!accept.has_param("heard_of"));
    }
}
