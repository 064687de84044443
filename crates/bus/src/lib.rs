//! meshbus: a per-node message bus for a clustered platform.
//!
//! Every host runs one daemon. Local services register over a loopback
//! socket; daemons on other hosts form a TCP mesh. Messages are routed by
//! `(server, service)` destination, broadcasts travel with deduplication
//! and a TTL, and the peer mesh self-heals through gossip.
pub mod client;
pub mod common;
pub mod fsm;
pub mod message;
pub mod net;
