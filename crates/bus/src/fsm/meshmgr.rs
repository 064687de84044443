//! Peer mesh management.
//!
//! For every known neighbor address exactly one of the two daemons dials
//! the other: the one whose canonical address is the larger. The smaller
//! side instead runs a gossip task, a connect-and-announce loop that tells
//! the larger peer "I exist, connect back" and dies on its `RECEIVED`
//! reply.
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::common::addr::{CanonicalAddr, DEFAULT_PORT};
use crate::common::time::Clock;
use crate::fsm::handler::DisconnectReason;
use crate::fsm::output::{Connect, Disconnect, SetTimer};
use crate::net::{LocalDuration, LocalTime};

/// Default interval between reconnection attempts to a mesh peer.
pub const RETRY_INTERVAL: LocalDuration = LocalDuration::from_secs(60);
/// Pause after a peer refused us without a reason: it is too busy.
pub const BUSY_INTERVAL: LocalDuration = LocalDuration::from_hours(24);
/// Pause after a peer announced it is shutting down or sent DISCONNECT.
pub const SHUTDOWN_INTERVAL: LocalDuration = LocalDuration::from_mins(5);
/// Delay before the first gossip attempt towards a new neighbor.
pub const GOSSIP_FIRST_INTERVAL: LocalDuration = LocalDuration::from_secs(5);
/// Ceiling for the doubling gossip backoff.
pub const GOSSIP_MAX_INTERVAL: LocalDuration = LocalDuration::from_hours(1);
/// Deadline for an outbound TCP connection attempt.
pub const CONNECT_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);
/// Gap between initial dials, so a restart does not dial the whole
/// neighbor file in one tick.
const DIAL_STAGGER: LocalDuration = LocalDuration::from_secs(1);

/// What an established outbound connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundRole {
    /// A mesh edge; the handshake starts with our CONNECT.
    Mesh,
    /// A gossip task; we send GOSSIP and wait for RECEIVED.
    Gossip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeshState {
    /// Waiting for the next dial.
    Idle { retry_at: LocalTime },
    /// Dial in flight.
    Connecting { since: LocalTime },
    /// Edge is up.
    Connected,
}

#[derive(Debug, Clone, Copy)]
struct GossipTask {
    wait: LocalDuration,
    state: GossipState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GossipState {
    Idle { next_attempt: LocalTime },
    Connecting { since: LocalTime },
}

/// Manages mesh edges, gossip tasks and the persisted neighbor set.
pub struct MeshManager<U, C> {
    my_address: CanonicalAddr,
    /// Peers with a smaller canonical address: we dial them.
    mesh: HashMap<CanonicalAddr, MeshState>,
    /// Peers with a larger canonical address: they dial us, we gossip.
    gossip: HashMap<CanonicalAddr, GossipTask>,
    /// Every neighbor address we ever heard of, canonical form.
    neighbors: BTreeSet<String>,
    cache_file: PathBuf,
    loaded: bool,
    /// Time of the most recently scheduled initial dial, for staggering.
    last_dial_at: LocalTime,
    /// Set at shutdown; no new dials or retries from then on.
    stopped: bool,
    /// Addresses whose dial failed since the last drain.
    unreachable: Vec<CanonicalAddr>,
    upstream: U,
    clock: C,
}

impl<U: Connect + Disconnect + SetTimer, C: Clock> MeshManager<U, C> {
    pub fn new(my_address: CanonicalAddr, cache_dir: &Path, upstream: U, clock: C) -> Self {
        Self {
            my_address,
            mesh: HashMap::new(),
            gossip: HashMap::new(),
            neighbors: BTreeSet::new(),
            cache_file: cache_dir.join("neighbors.txt"),
            loaded: false,
            last_dial_at: LocalTime::default(),
            stopped: false,
            unreachable: Vec::new(),
            upstream,
            clock,
        }
    }

    /// Our own canonical address.
    pub fn my_address(&self) -> CanonicalAddr {
        self.my_address
    }

    /// Add a comma-separated list of neighbor addresses.
    ///
    /// The first call also loads the neighbor cache file. Every mutation
    /// of the set rewrites the file.
    pub fn add_neighbors(&mut self, csv: &str) {
        debug!(target: "bus", "Add neighbors: {}", csv);

        self.ensure_loaded();

        let mut changed = false;
        for entry in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match CanonicalAddr::parse(entry, DEFAULT_PORT) {
                Ok(addr) => changed |= self.add_neighbor(addr),
                Err(err) => warn!(target: "bus", "Ignoring neighbor `{}`: {}", entry, err),
            }
        }

        if changed {
            self.save();
        }
    }

    fn add_neighbor(&mut self, addr: CanonicalAddr) -> bool {
        if addr == self.my_address {
            // Neighbors legitimately send our own address right back at us.
            return false;
        }

        if !self.neighbors.insert(addr.to_string()) {
            // Already known. If the mesh edge is waiting out a pause, a
            // fresh mention of the address is reason to try again now.
            if let Some(state @ MeshState::Idle { .. }) = self.mesh.get_mut(&addr) {
                *state = MeshState::Idle {
                    retry_at: self.clock.local_time(),
                };
                self.upstream.set_timer(LocalDuration::from_secs(0));
            }
            return false;
        }

        let now = self.clock.local_time();

        if addr < self.my_address {
            // Ours is the larger address: we own the edge.
            if now > self.last_dial_at {
                self.last_dial_at = now;
            }
            let retry_at = self.last_dial_at;
            self.last_dial_at = self.last_dial_at + DIAL_STAGGER;

            self.mesh.insert(addr, MeshState::Idle { retry_at });
            self.upstream.set_timer(retry_at - now);

            debug!(target: "bus", "New mesh edge towards {}", addr);
        } else {
            self.gossip.insert(
                addr,
                GossipTask {
                    wait: GOSSIP_FIRST_INTERVAL,
                    state: GossipState::Idle {
                        next_attempt: now + GOSSIP_FIRST_INTERVAL,
                    },
                },
            );
            self.upstream.set_timer(GOSSIP_FIRST_INTERVAL);

            debug!(target: "bus", "New gossip task towards {}", addr);
        }

        true
    }

    /// Load the neighbor cache file, once.
    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;

        let contents = match fs::read_to_string(&self.cache_file) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(
                    target: "bus",
                    "Neighbor cache {} could not be read: {}",
                    self.cache_file.display(),
                    err
                );
                return;
            }
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match CanonicalAddr::parse(line, DEFAULT_PORT) {
                Ok(addr) => {
                    self.add_neighbor(addr);
                }
                Err(err) => {
                    warn!(target: "bus", "Ignoring cached neighbor `{}`: {}", line, err)
                }
            }
        }
    }

    /// Rewrite the cache file with the full neighbor set. The write goes to
    /// a sibling temp file first, then renames over the old one.
    fn save(&self) {
        let tmp = self.cache_file.with_extension("txt.new");

        let result = fs::File::create(&tmp)
            .and_then(|mut file| {
                for neighbor in &self.neighbors {
                    writeln!(file, "{}", neighbor)?;
                }
                file.flush()
            })
            .and_then(|()| fs::rename(&tmp, &self.cache_file));

        if let Err(err) = result {
            error!(
                target: "bus",
                "Could not write neighbor cache {}: {}",
                self.cache_file.display(),
                err
            );
        }
    }

    /// The persisted neighbor set, canonical strings in order.
    pub fn neighbors(&self) -> impl Iterator<Item = &str> {
        self.neighbors.iter().map(String::as_str)
    }

    /// Whether we own the mesh edge towards this address.
    pub fn is_mesh_peer(&self, addr: &CanonicalAddr) -> bool {
        self.mesh.contains_key(addr)
    }

    /// Called when a timer fires: dial due edges and gossip tasks, time out
    /// stuck connection attempts, and re-arm the timer.
    pub fn received_wake(&mut self) {
        if self.stopped {
            return;
        }
        let now = self.clock.local_time();

        for (addr, state) in &mut self.mesh {
            match *state {
                MeshState::Idle { retry_at } if retry_at <= now => {
                    *state = MeshState::Connecting { since: now };
                    self.upstream.connect(addr.to_socket_addr(), CONNECT_TIMEOUT);
                }
                MeshState::Connecting { since } if now - since >= CONNECT_TIMEOUT => {
                    self.upstream.disconnect(
                        addr.to_socket_addr(),
                        DisconnectReason::PeerTimeout("connect"),
                    );
                }
                _ => {}
            }
        }

        for (addr, task) in &mut self.gossip {
            match task.state {
                GossipState::Idle { next_attempt } if next_attempt <= now => {
                    task.state = GossipState::Connecting { since: now };
                    self.upstream.connect(addr.to_socket_addr(), CONNECT_TIMEOUT);
                }
                GossipState::Connecting { since } if now - since >= CONNECT_TIMEOUT => {
                    self.upstream.disconnect(
                        addr.to_socket_addr(),
                        DisconnectReason::PeerTimeout("gossip"),
                    );
                }
                _ => {}
            }
        }

        if let Some(next) = self.next_deadline() {
            self.upstream.set_timer(next.duration_since(now));
        }
    }

    fn next_deadline(&self) -> Option<LocalTime> {
        let mesh = self.mesh.values().map(|state| match *state {
            MeshState::Idle { retry_at } => Some(retry_at),
            MeshState::Connecting { since } => Some(since + CONNECT_TIMEOUT),
            MeshState::Connected => None,
        });
        let gossip = self.gossip.values().map(|task| match task.state {
            GossipState::Idle { next_attempt } => Some(next_attempt),
            GossipState::Connecting { since } => Some(since + CONNECT_TIMEOUT),
        });

        mesh.chain(gossip).flatten().min()
    }

    /// An outbound socket became writable: which task does it belong to?
    pub fn socket_connected(&mut self, addr: &SocketAddr) -> Option<OutboundRole> {
        let canonical = CanonicalAddr::from(*addr);

        if let Some(state @ MeshState::Connecting { .. }) = self.mesh.get_mut(&canonical) {
            *state = MeshState::Connected;
            return Some(OutboundRole::Mesh);
        }
        if let Some(GossipTask {
            state: GossipState::Connecting { .. },
            ..
        }) = self.gossip.get(&canonical)
        {
            return Some(OutboundRole::Gossip);
        }
        None
    }

    /// An outbound socket went away. Reschedules the owning task.
    ///
    /// Mesh edges retry on the default interval, whatever the failure;
    /// gossip tasks double their wait up to the one-hour ceiling. A failed
    /// dial additionally records the address as unreachable.
    pub fn socket_disconnected(&mut self, addr: &SocketAddr) {
        let canonical = CanonicalAddr::from(*addr);
        let now = self.clock.local_time();

        if let Some(state) = self.mesh.get_mut(&canonical) {
            match *state {
                MeshState::Connecting { .. } | MeshState::Connected => {
                    if matches!(*state, MeshState::Connecting { .. }) {
                        self.unreachable.push(canonical);
                    }
                    if self.stopped {
                        return;
                    }
                    *state = MeshState::Idle {
                        retry_at: now + RETRY_INTERVAL,
                    };
                    self.upstream.set_timer(RETRY_INTERVAL);
                }
                // A pause was already put in place, e.g. by a REFUSE.
                MeshState::Idle { .. } => {}
            }
            return;
        }

        if let Some(task) = self.gossip.get_mut(&canonical) {
            if let GossipState::Connecting { .. } = task.state {
                self.unreachable.push(canonical);

                if self.stopped {
                    return;
                }
                task.wait = (task.wait * 2).min(GOSSIP_MAX_INTERVAL);
                task.state = GossipState::Idle {
                    next_attempt: now + task.wait,
                };
                self.upstream.set_timer(task.wait);
            }
        }
    }

    /// A peer refused us without a reason: it is too busy. Pause the edge
    /// for a day before trying again.
    pub fn too_busy(&mut self, addr: &CanonicalAddr) {
        if let Some(state) = self.mesh.get_mut(addr) {
            *state = MeshState::Idle {
                retry_at: self.clock.local_time() + BUSY_INTERVAL,
            };
            self.upstream.set_timer(BUSY_INTERVAL);

            info!(
                target: "bus",
                "Peer {} is too busy, pausing for {} before reconnecting",
                addr,
                BUSY_INTERVAL
            );
        }
    }

    /// A peer is shutting down, rebooting, or disconnected this edge.
    /// Pause for a few minutes instead of hammering it.
    pub fn peer_shutting_down(&mut self, addr: &CanonicalAddr) {
        if let Some(state) = self.mesh.get_mut(addr) {
            *state = MeshState::Idle {
                retry_at: self.clock.local_time() + SHUTDOWN_INTERVAL,
            };
            self.upstream.set_timer(SHUTDOWN_INTERVAL);
        }
    }

    /// The peer confirmed our GOSSIP (RECEIVED), or connected to us on its
    /// own. Either way the gossip task has served its purpose. Returns the
    /// socket of an attempt still in flight, for closing.
    pub fn gossip_confirmed(&mut self, addr: &CanonicalAddr) -> Option<SocketAddr> {
        self.gossip.remove(addr).and_then(|task| match task.state {
            GossipState::Connecting { .. } => Some(addr.to_socket_addr()),
            GossipState::Idle { .. } => None,
        })
    }

    /// FORGET: drop an address from the neighbor set and kill its tasks.
    /// Returns sockets that should be closed.
    pub fn forget(&mut self, addr: &CanonicalAddr) -> Vec<SocketAddr> {
        info!(
            target: "bus",
            "Forgetting neighbor {}{}",
            addr,
            if self.neighbors.contains(&addr.to_string()) {
                " (exists)"
            } else {
                ""
            }
        );

        let mut close = Vec::new();

        if self.neighbors.remove(&addr.to_string()) {
            self.save();
        }
        if let Some(socket) = self.gossip_confirmed(addr) {
            close.push(socket);
        }
        if let Some(state) = self.mesh.remove(addr) {
            if matches!(state, MeshState::Connecting { .. } | MeshState::Connected) {
                close.push(addr.to_socket_addr());
            }
        }

        close
    }

    /// Shutdown: stop all gossiping at once and freeze every retry.
    /// Returns gossip sockets still in flight, for closing.
    pub fn stop(&mut self) -> Vec<SocketAddr> {
        self.stopped = true;

        self.gossip
            .drain()
            .filter_map(|(addr, task)| match task.state {
                GossipState::Connecting { .. } => Some(addr.to_socket_addr()),
                GossipState::Idle { .. } => None,
            })
            .collect()
    }

    /// Addresses whose dial failed since the last call.
    pub fn take_unreachable(&mut self) -> Vec<CanonicalAddr> {
        std::mem::take(&mut self.unreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::{RefClock, TickClock};
    use crate::fsm::output::Outbox;
    use crate::net::Io as NetIo;

    fn manager(
        my: &str,
        dir: &Path,
    ) -> (MeshManager<Outbox, RefClock>, Outbox, RefClock) {
        let outbox = Outbox::default();
        let clock = RefClock::new(LocalTime::from_secs(1_000));
        let my_address = CanonicalAddr::parse(my, DEFAULT_PORT).unwrap();
        (
            MeshManager::new(my_address, dir, outbox.clone(), clock.clone()),
            outbox,
            clock,
        )
    }

    fn dials(outbox: &mut Outbox) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        for io in outbox.by_ref() {
            if let NetIo::Connect(addr) = io {
                out.push(addr);
            }
        }
        out
    }

    fn advance(clock: &mut RefClock, secs: u64) {
        let now = clock.local_time();
        clock.set(now + LocalDuration::from_secs(secs));
    }

    #[test]
    fn larger_address_owns_the_edge() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.2:4040", dir.path());

        mgr.add_neighbors("10.0.0.1:4040,10.0.0.3:4040");

        let smaller = CanonicalAddr::parse("10.0.0.1:4040", DEFAULT_PORT).unwrap();
        let larger = CanonicalAddr::parse("10.0.0.3:4040", DEFAULT_PORT).unwrap();

        assert!(mgr.is_mesh_peer(&smaller));
        assert!(!mgr.is_mesh_peer(&larger));

        // The mesh edge dials right away; the gossip task waits its five
        // seconds first.
        mgr.received_wake();
        assert_eq!(dials(&mut outbox), vec!["10.0.0.1:4040".parse().unwrap()]);

        advance(&mut clock, 5);
        mgr.received_wake();
        assert_eq!(dials(&mut outbox), vec!["10.0.0.3:4040".parse().unwrap()]);
    }

    #[test]
    fn own_address_is_not_a_neighbor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, _) = manager("10.0.0.2:4040", dir.path());

        mgr.add_neighbors("10.0.0.2:4040");
        mgr.received_wake();

        assert!(dials(&mut outbox).is_empty());
        assert_eq!(mgr.neighbors().count(), 0);
    }

    #[test]
    fn initial_dials_are_staggered() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.9:4040", dir.path());

        mgr.add_neighbors("10.0.0.1,10.0.0.2,10.0.0.3");

        mgr.received_wake();
        assert_eq!(dials(&mut outbox).len(), 1);

        advance(&mut clock, 1);
        mgr.received_wake();
        assert_eq!(dials(&mut outbox).len(), 1);

        advance(&mut clock, 1);
        mgr.received_wake();
        assert_eq!(dials(&mut outbox).len(), 1);
    }

    #[test]
    fn refuse_busy_pauses_for_a_day() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.2:4040", dir.path());
        let peer = CanonicalAddr::parse("10.0.0.1:4040", DEFAULT_PORT).unwrap();

        mgr.add_neighbors("10.0.0.1");
        mgr.received_wake();
        assert_eq!(dials(&mut outbox).len(), 1);
        mgr.socket_connected(&peer.to_socket_addr());

        mgr.too_busy(&peer);
        mgr.socket_disconnected(&peer.to_socket_addr());

        // Nothing for nearly a day...
        advance(&mut clock, 23 * 3600);
        mgr.received_wake();
        assert!(dials(&mut outbox).is_empty());

        // ...then the dial comes back.
        advance(&mut clock, 3600 + 1);
        mgr.received_wake();
        assert_eq!(dials(&mut outbox).len(), 1);
    }

    #[test]
    fn shutdown_reason_pauses_five_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.2:4040", dir.path());
        let peer = CanonicalAddr::parse("10.0.0.1:4040", DEFAULT_PORT).unwrap();

        mgr.add_neighbors("10.0.0.1");
        mgr.received_wake();
        dials(&mut outbox);
        mgr.socket_connected(&peer.to_socket_addr());

        mgr.peer_shutting_down(&peer);
        mgr.socket_disconnected(&peer.to_socket_addr());

        advance(&mut clock, 4 * 60);
        mgr.received_wake();
        assert!(dials(&mut outbox).is_empty());

        advance(&mut clock, 61);
        mgr.received_wake();
        assert_eq!(dials(&mut outbox).len(), 1);
    }

    #[test]
    fn lost_edges_retry_on_the_default_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.2:4040", dir.path());
        let peer: SocketAddr = "10.0.0.1:4040".parse().unwrap();

        mgr.add_neighbors("10.0.0.1");
        mgr.received_wake();
        dials(&mut outbox);
        mgr.socket_connected(&peer);
        mgr.socket_disconnected(&peer);

        advance(&mut clock, 59);
        mgr.received_wake();
        assert!(dials(&mut outbox).is_empty());

        advance(&mut clock, 2);
        mgr.received_wake();
        assert_eq!(dials(&mut outbox), vec![peer]);
    }

    #[test]
    fn gossip_backoff_doubles_up_to_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.2:4040", dir.path());
        let peer: SocketAddr = "10.0.0.3:4040".parse().unwrap();

        mgr.add_neighbors("10.0.0.3");

        let mut wait = 5u64;
        for _ in 0..3 {
            advance(&mut clock, wait);
            mgr.received_wake();
            assert_eq!(dials(&mut outbox), vec![peer]);

            // The dial fails; the next wait doubles.
            mgr.socket_disconnected(&peer);
            wait *= 2;

            advance(&mut clock, wait - 1);
            mgr.received_wake();
            assert!(dials(&mut outbox).is_empty());
            advance(&mut clock, 1);
        }

        assert_eq!(
            mgr.take_unreachable(),
            vec![CanonicalAddr::from(peer); 3]
        );
    }

    #[test]
    fn gossip_dies_on_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.2:4040", dir.path());
        let peer = CanonicalAddr::parse("10.0.0.3:4040", DEFAULT_PORT).unwrap();

        mgr.add_neighbors("10.0.0.3");
        advance(&mut clock, 5);
        mgr.received_wake();
        dials(&mut outbox);

        // Confirmation mid-flight returns the socket for closing.
        assert_eq!(mgr.gossip_confirmed(&peer), Some(peer.to_socket_addr()));

        // No further gossip attempts, ever.
        advance(&mut clock, 7200);
        mgr.received_wake();
        assert!(dials(&mut outbox).is_empty());
    }

    #[test]
    fn neighbor_set_survives_restart_via_the_cache_file() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (mut mgr, _, _) = manager("10.0.0.2:4040", dir.path());
            mgr.add_neighbors("10.0.0.1,0x0a.0.0.3:4040");
            assert_eq!(
                mgr.neighbors().collect::<Vec<_>>(),
                vec!["10.0.0.1:4040", "10.0.0.3:4040"]
            );
        }

        let contents = fs::read_to_string(dir.path().join("neighbors.txt")).unwrap();
        assert_eq!(contents, "10.0.0.1:4040\n10.0.0.3:4040\n");

        let (mut mgr, mut outbox, _) = manager("10.0.0.2:4040", dir.path());
        mgr.add_neighbors("");
        assert_eq!(mgr.neighbors().count(), 2);

        mgr.received_wake();
        assert_eq!(dials(&mut outbox).len(), 1);
    }

    #[test]
    fn comments_in_the_cache_file_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("neighbors.txt"),
            "# cluster seeds\n10.0.0.1:4040\n\n# retired\n",
        )
        .unwrap();

        let (mut mgr, _, _) = manager("10.0.0.2:4040", dir.path());
        mgr.add_neighbors("");

        assert_eq!(mgr.neighbors().collect::<Vec<_>>(), vec!["10.0.0.1:4040"]);
    }

    #[test]
    fn forget_removes_the_address_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, _) = manager("10.0.0.2:4040", dir.path());
        let peer = CanonicalAddr::parse("10.0.0.1:4040", DEFAULT_PORT).unwrap();

        mgr.add_neighbors("10.0.0.1");
        mgr.received_wake();
        dials(&mut outbox);
        mgr.socket_connected(&peer.to_socket_addr());

        let close = mgr.forget(&peer);
        assert_eq!(close, vec![peer.to_socket_addr()]);
        assert_eq!(mgr.neighbors().count(), 0);
        assert!(!mgr.is_mesh_peer(&peer));

        let contents = fs::read_to_string(dir.path().join("neighbors.txt")).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn stop_cancels_gossip_and_freezes_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, mut outbox, mut clock) = manager("10.0.0.2:4040", dir.path());

        mgr.add_neighbors("10.0.0.1,10.0.0.3");
        advance(&mut clock, 5);
        mgr.received_wake();
        let dialed = dials(&mut outbox);
        assert_eq!(dialed.len(), 2);

        let closing = mgr.stop();
        assert_eq!(closing, vec!["10.0.0.3:4040".parse().unwrap()]);

        advance(&mut clock, 3600);
        mgr.received_wake();
        assert!(dials(&mut outbox).is_empty());
    }
}
