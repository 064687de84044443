//! Scoped broadcasting.
//!
//! Local services receive the message as-is, if they advertised the
//! command. Copies forwarded to peer daemons are stamped with a unique
//! `broadcast_msgid`, an absolute `broadcast_timeout`, a hop count, the
//! originator, and the set of hosts already informed, so the flood
//! converges: every daemon processes a given broadcast at most once and
//! expired messages stop travelling.
use std::collections::HashMap;

use tracing::warn;

use crate::common::addr::{CanonicalAddr, NetworkClass};
use crate::fsm::event::Event;
use crate::fsm::handler::PeerId;
use crate::fsm::output::Wire;
use crate::message::Message;
use crate::net::{LocalDuration, LocalTime};

/// A broadcast stops being forwarded to other daemons after this many hops.
pub const MAX_HOPS: i64 = 5;
/// Lifetime given to a broadcast that carries no timeout yet.
pub const DEFAULT_BROADCAST_TTL: LocalDuration = LocalDuration::from_secs(10);

/// A possible destination for a broadcast.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Transport address to send on.
    pub addr: PeerId,
    /// Canonical host (no port), as recorded in the informed-neighbors set.
    pub host: String,
    pub kind: CandidateKind,
}

#[derive(Debug, Clone)]
pub enum CandidateKind {
    /// A registered local service; reached only if it understands the
    /// command.
    LocalService { understands: bool },
    /// A peer daemon; reached according to scope, hops and network class.
    Peer { class: NetworkClass },
}

/// The broadcast state machine.
#[derive(Debug)]
pub struct BroadcastEngine<U> {
    server_name: String,
    /// Our own `host:port`, stamped as originator.
    originator: String,
    /// Our own host, seeded into the informed set.
    my_host: String,
    /// `broadcast_msgid` → `broadcast_timeout` of processed broadcasts.
    seen: HashMap<String, LocalTime>,
    sequence: u64,
    upstream: U,
}

impl<U: Wire<Event>> BroadcastEngine<U> {
    pub fn new(server_name: &str, my_address: CanonicalAddr, upstream: U) -> Self {
        Self {
            server_name: server_name.to_owned(),
            originator: my_address.to_string(),
            my_host: my_address.host_string(),
            seen: HashMap::new(),
            sequence: 0,
            upstream,
        }
    }

    /// Entrance filter: whether an inbound message is a second arrival or
    /// has already expired, and must be dropped silently.
    pub fn should_drop(&self, msg: &Message, now: LocalTime) -> bool {
        let Some(msgid) = msg.param("broadcast_msgid") else {
            return false;
        };
        let Some(timeout) = msg.int_param("broadcast_timeout") else {
            // A broadcast without a timeout is malformed; stop it here.
            return true;
        };

        if LocalTime::from_secs(timeout.max(0) as u64) < now {
            return true;
        }
        self.seen.contains_key(msgid)
    }

    /// Broadcast a message with scope `service` ∈ {`.`, `?`, `*`} to every
    /// eligible candidate.
    pub fn broadcast(&mut self, msg: &Message, candidates: Vec<Candidate>, now: LocalTime) {
        if self.should_drop(msg, now) {
            return;
        }

        let hops = msg.int_param("broadcast_hops").unwrap_or(0);
        // The scope is normally the service (`.`, `?` or `*`); a message
        // with a concrete service broadcasts by its server field instead,
        // defaulting to this datacenter.
        let scope = match msg.service.as_str() {
            s @ ("." | "?" | "*") => s,
            _ if msg.server.is_empty() => "?",
            _ => msg.server.as_str(),
        };
        let all = hops < MAX_HOPS && scope == "*";
        let remote = hops < MAX_HOPS && (all || scope == "?");

        let mut informed = informed_list(msg);
        let mut chosen = Vec::new();

        for candidate in candidates {
            match candidate.kind {
                CandidateKind::LocalService { understands } => {
                    // Local services always get broadcasts, but only the
                    // commands they declared.
                    if understands {
                        self.upstream.message(candidate.addr, msg.clone());
                    }
                }
                CandidateKind::Peer { class } => {
                    let eligible = match class {
                        NetworkClass::Loopback => {
                            warn!(target: "bus", "peer daemon connected on a loopback address");
                            false
                        }
                        NetworkClass::Private => remote,
                        NetworkClass::Public => all,
                    };
                    if eligible && !informed.contains(&candidate.host) {
                        informed.push(candidate.host);
                        chosen.push(candidate.addr);
                    }
                }
            }
        }

        self.stamp_and_send(msg, chosen, informed, hops, now);
    }

    /// Forward a directed message to the given peer daemons, stamping it
    /// like a broadcast so the receiving side can deduplicate.
    pub fn forward(&mut self, msg: &Message, peers: Vec<Candidate>, now: LocalTime) {
        if self.should_drop(msg, now) {
            return;
        }

        let hops = msg.int_param("broadcast_hops").unwrap_or(0);
        let mut informed = informed_list(msg);
        let mut chosen = Vec::new();

        for candidate in peers {
            if !informed.contains(&candidate.host) {
                informed.push(candidate.host);
                chosen.push(candidate.addr);
            }
        }

        self.stamp_and_send(msg, chosen, informed, hops, now);
    }

    fn stamp_and_send(
        &mut self,
        msg: &Message,
        chosen: Vec<PeerId>,
        mut informed: Vec<String>,
        hops: i64,
        now: LocalTime,
    ) {
        let mut msgid = msg.param("broadcast_msgid").map(str::to_owned);
        let mut timeout = msg
            .int_param("broadcast_timeout")
            .map(|t| LocalTime::from_secs(t.max(0) as u64));

        if !chosen.is_empty() {
            // We know of the message too; no need for others to send it back.
            if !informed.iter().any(|host| *host == self.my_host) {
                informed.push(self.my_host.clone());
            }

            // A unique id is essential in a many-to-many flood: duplicates
            // are blocked by it, never by luck.
            self.sequence += 1;
            let msgid =
                msgid.get_or_insert_with(|| format!("{}-{}", self.server_name, self.sequence));

            let mut stamped = msg.clone();
            stamped.set_param("broadcast_msgid", msgid.clone());
            // The hop limit stops the flood from spreading, not from being
            // delivered: the receiving daemon still hands it to its own
            // services.
            stamped.set_param("broadcast_hops", (hops + 1).to_string());
            if stamped.param("broadcast_originator").is_none() {
                stamped.set_param("broadcast_originator", self.originator.clone());
            }
            let timeout = *timeout.get_or_insert(now + DEFAULT_BROADCAST_TTL);
            stamped.set_param("broadcast_timeout", timeout.as_secs().to_string());
            stamped.set_param("broadcast_informed_neighbors", informed.join(","));

            for addr in chosen {
                self.upstream.message(addr, stamped.clone());
            }
        }

        // Record the message id last, after dropping ids that expired.
        if let (Some(msgid), Some(timeout)) = (msgid, timeout) {
            self.seen.retain(|_, t| *t >= now);
            self.seen.insert(msgid, timeout);
        }
    }
}

fn informed_list(msg: &Message) -> Vec<String> {
    msg.param("broadcast_informed_neighbors")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Outbox;
    use crate::net::Io as NetIo;

    fn new_engine() -> (BroadcastEngine<Outbox>, Outbox) {
        let outbox = Outbox::default();
        let my_address = CanonicalAddr::parse("10.0.0.1:4040", 4040).unwrap();
        (
            BroadcastEngine::new("alpha", my_address, outbox.clone()),
            outbox,
        )
    }

    fn sent(outbox: &mut Outbox) -> Vec<(PeerId, Message)> {
        let mut out = Vec::new();
        for io in outbox.by_ref() {
            if let NetIo::Write(addr, msg) = io {
                out.push((addr, msg));
            }
        }
        out
    }

    fn local(addr: &str, understands: bool) -> Candidate {
        Candidate {
            addr: addr.parse().unwrap(),
            host: "127.0.0.1".into(),
            kind: CandidateKind::LocalService { understands },
        }
    }

    fn peer(addr: &str, host: &str, class: NetworkClass) -> Candidate {
        Candidate {
            addr: addr.parse().unwrap(),
            host: host.into(),
            kind: CandidateKind::Peer { class },
        }
    }

    #[test]
    fn local_services_only_get_commands_they_understand() {
        let (mut engine, mut outbox) = new_engine();
        let msg = Message::new("RUN").with_service(".");

        engine.broadcast(
            &msg,
            vec![
                local("127.0.0.1:5001", true),
                local("127.0.0.1:5002", false),
            ],
            LocalTime::from_secs(100),
        );

        let sent = sent(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "127.0.0.1:5001".parse().unwrap());
        // Local deliveries are not stamped.
        assert!(!sent[0].1.has_param("broadcast_msgid"));
    }

    #[test]
    fn forwarded_copies_are_stamped() {
        let (mut engine, mut outbox) = new_engine();
        let now = LocalTime::from_secs(1000);
        let msg = Message::new("RUN").with_service("?");

        engine.broadcast(
            &msg,
            vec![peer("10.0.0.2:4040", "10.0.0.2", NetworkClass::Private)],
            now,
        );

        let sent = sent(&mut outbox);
        assert_eq!(sent.len(), 1);
        let stamped = &sent[0].1;
        assert_eq!(stamped.param("broadcast_msgid"), Some("alpha-1"));
        assert_eq!(stamped.int_param("broadcast_hops"), Some(1));
        assert_eq!(stamped.param("broadcast_originator"), Some("10.0.0.1:4040"));
        assert_eq!(stamped.int_param("broadcast_timeout"), Some(1010));
        // Both the destination and ourselves are recorded as informed.
        assert_eq!(
            stamped.param("broadcast_informed_neighbors"),
            Some("10.0.0.2,10.0.0.1")
        );
    }

    #[test]
    fn second_arrival_is_dropped() {
        let (mut engine, mut outbox) = new_engine();
        let now = LocalTime::from_secs(1000);
        let msg = Message::new("RUN")
            .with_service("*")
            .with_param("broadcast_msgid", "beta-7")
            .with_param("broadcast_timeout", "1005");

        let candidates = || vec![peer("10.0.0.2:4040", "10.0.0.2", NetworkClass::Private)];

        engine.broadcast(&msg, candidates(), now);
        assert_eq!(sent(&mut outbox).len(), 1);
        assert!(engine.should_drop(&msg, now));

        engine.broadcast(&msg, candidates(), now);
        assert!(sent(&mut outbox).is_empty());
    }

    #[test]
    fn expired_broadcasts_stop_travelling() {
        let (mut engine, mut outbox) = new_engine();
        let msg = Message::new("RUN")
            .with_service("*")
            .with_param("broadcast_msgid", "beta-7")
            .with_param("broadcast_timeout", "999");

        assert!(engine.should_drop(&msg, LocalTime::from_secs(1000)));

        engine.broadcast(
            &msg,
            vec![peer("10.0.0.2:4040", "10.0.0.2", NetworkClass::Private)],
            LocalTime::from_secs(1000),
        );
        assert!(sent(&mut outbox).is_empty());
    }

    #[test]
    fn hop_limit_stops_peer_forwarding_but_not_local_delivery() {
        let (mut engine, mut outbox) = new_engine();
        let msg = Message::new("RUN")
            .with_service("*")
            .with_param("broadcast_msgid", "beta-7")
            .with_param("broadcast_timeout", "2000")
            .with_param("broadcast_hops", "5");

        engine.broadcast(
            &msg,
            vec![
                local("127.0.0.1:5001", true),
                peer("10.0.0.2:4040", "10.0.0.2", NetworkClass::Private),
            ],
            LocalTime::from_secs(1000),
        );

        let sent = sent(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "127.0.0.1:5001".parse().unwrap());
    }

    #[test]
    fn scope_selects_network_classes() {
        let now = LocalTime::from_secs(50);
        let candidates = || {
            vec![
                peer("10.0.0.2:4040", "10.0.0.2", NetworkClass::Private),
                peer("8.8.4.4:4040", "8.8.4.4", NetworkClass::Public),
            ]
        };

        // `?` reaches the datacenter only.
        let (mut engine, mut outbox) = new_engine();
        engine.broadcast(&Message::new("RUN").with_service("?"), candidates(), now);
        let datacenter = sent(&mut outbox);
        assert_eq!(datacenter.len(), 1);
        assert_eq!(datacenter[0].0, "10.0.0.2:4040".parse().unwrap());

        // `*` reaches everyone.
        let (mut engine, mut outbox) = new_engine();
        engine.broadcast(&Message::new("RUN").with_service("*"), candidates(), now);
        assert_eq!(sent(&mut outbox).len(), 2);
    }

    #[test]
    fn informed_neighbors_are_skipped() {
        let (mut engine, mut outbox) = new_engine();
        let msg = Message::new("RUN")
            .with_service("*")
            .with_param("broadcast_msgid", "beta-3")
            .with_param("broadcast_timeout", "100")
            .with_param("broadcast_informed_neighbors", "10.0.0.2");

        engine.broadcast(
            &msg,
            vec![
                peer("10.0.0.2:4040", "10.0.0.2", NetworkClass::Private),
                peer("10.0.0.3:4040", "10.0.0.3", NetworkClass::Private),
            ],
            LocalTime::from_secs(50),
        );

        let sent = sent(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "10.0.0.3:4040".parse().unwrap());
        assert_eq!(
            sent[0].1.param("broadcast_informed_neighbors"),
            Some("10.0.0.2,10.0.0.3,10.0.0.1")
        );
    }

    #[test]
    fn assigned_ids_are_unique_and_recorded() {
        let (mut engine, mut outbox) = new_engine();
        let now = LocalTime::from_secs(10);

        for _ in 0..2 {
            engine.broadcast(
                &Message::new("RUN").with_service("?"),
                vec![peer("10.0.0.2:4040", "10.0.0.2", NetworkClass::Private)],
                now,
            );
        }

        let sent = sent(&mut outbox);
        assert_eq!(sent[0].1.param("broadcast_msgid"), Some("alpha-1"));
        assert_eq!(sent[1].1.param("broadcast_msgid"), Some("alpha-2"));

        // Re-processing our own stamped copy is refused.
        assert!(engine.should_drop(&sent[0].1, now));
    }
}
