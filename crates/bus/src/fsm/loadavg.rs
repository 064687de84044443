//! Load-average sampling and publication.
//!
//! A one-second timer, armed only while at least one connection is
//! subscribed, reads the 1-minute load average, divides it by the CPU
//! count, and publishes `LOADAVG` to every subscriber — but only when the
//! value moved by at least the hysteresis threshold since the last send.
use std::collections::{BTreeSet, HashMap};
use std::fs;

use tracing::{debug, error};

use crate::common::addr::{CanonicalAddr, DEFAULT_PORT};
use crate::common::time::Clock;
use crate::fsm::event::Event;
use crate::fsm::handler::PeerId;
use crate::fsm::output::{SetTimer, Wire};
use crate::net::{LocalDuration, LocalTime};

/// Interval between samples while subscribers exist.
const SAMPLE_INTERVAL: LocalDuration = LocalDuration::from_secs(1);
/// Minimum change between two published values.
const HYSTERESIS: f32 = 0.1;
/// The kernel's load-average source.
const PROC_LOADAVG: &str = "/proc/loadavg";
/// Remote samples older than the daemon itself are nonsense; anything
/// stamped before 2016 is rejected.
const MIN_SAMPLE_TIMESTAMP: i64 = 1_451_606_400;

/// A load-average sample received from another daemon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteSample {
    pub avg: f32,
    pub timestamp: i64,
}

/// Manages LOADAVG subscriptions, sampling and remote samples.
pub struct LoadavgManager<U, C> {
    /// Armed while at least one session subscribed.
    enabled: bool,
    last_sent: Option<f32>,
    last_sample_at: LocalTime,
    cpus: u32,
    my_address: String,
    /// Addresses named in LISTENLOADAVG, for re-requesting subscriptions
    /// whenever a matching peer session appears.
    listen_ips: BTreeSet<String>,
    /// Latest sample per remote daemon host.
    samples: HashMap<String, RemoteSample>,
    upstream: U,
    clock: C,
}

impl<U: Wire<Event> + SetTimer, C: Clock> LoadavgManager<U, C> {
    pub fn new(my_address: CanonicalAddr, upstream: U, clock: C) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Self {
            enabled: false,
            last_sent: None,
            last_sample_at: LocalTime::default(),
            cpus,
            my_address: my_address.to_string(),
            listen_ips: BTreeSet::new(),
            samples: HashMap::new(),
            upstream,
            clock,
        }
    }

    /// Arm or disarm the sampling timer. Idempotent: arming twice or
    /// disarming an idle manager changes nothing.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.upstream.set_timer(SAMPLE_INTERVAL);
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Timer wake: sample and publish if due.
    pub fn received_wake(&mut self, subscribers: &[PeerId]) {
        if !self.enabled {
            return;
        }
        let now = self.clock.local_time();
        if now - self.last_sample_at < SAMPLE_INTERVAL {
            self.upstream.set_timer(SAMPLE_INTERVAL);
            return;
        }
        self.last_sample_at = now;

        match read_proc_loadavg() {
            Some(raw) => self.process_sample(raw, subscribers, now),
            None => error!(target: "bus", "error reading the {} data", PROC_LOADAVG),
        }

        self.upstream.set_timer(SAMPLE_INTERVAL);
    }

    /// Publish a raw 1-minute load reading, normalized per CPU, unless it
    /// is within the hysteresis band of the previously sent value.
    fn process_sample(&mut self, raw: f32, subscribers: &[PeerId], now: LocalTime) {
        // A load of 1 on sixteen processors is a sixteenth of the machine.
        let avg = raw / self.cpus as f32;

        if let Some(last) = self.last_sent {
            if (last - avg).abs() < HYSTERESIS {
                return;
            }
        }
        self.last_sent = Some(avg);

        for addr in subscribers {
            self.upstream
                .loadavg(*addr, avg, &self.my_address, now.as_secs());
        }
    }

    /// LISTENLOADAVG: record addresses whose LOADAVG we want. Returns the
    /// hosts that were not yet recorded, so the router can request a
    /// subscription from any matching live session.
    pub fn listen(&mut self, ips_csv: &str) -> Vec<String> {
        let mut new = Vec::new();
        for ip in ips_csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if self.listen_ips.insert(ip.to_owned()) {
                new.push(ip.to_owned());
            }
        }
        new
    }

    /// Whether a peer address was named in a LISTENLOADAVG.
    pub fn is_listening_for(&self, address: &str) -> bool {
        self.listen_ips.contains(address)
    }

    /// Record an incoming LOADAVG sample. Malformed samples are dropped.
    pub fn record_remote(&mut self, avg: &str, my_address: &str, timestamp: &str) {
        let Ok(avg) = avg.parse::<f32>() else {
            return;
        };
        if avg < 0.0 {
            return;
        }
        let Ok(timestamp) = timestamp.parse::<i64>() else {
            return;
        };
        if timestamp < MIN_SAMPLE_TIMESTAMP {
            return;
        }
        let Ok(addr) = CanonicalAddr::parse(my_address, DEFAULT_PORT) else {
            return;
        };

        debug!(target: "bus", "Load average of {} is {}", addr, avg);

        self.samples
            .insert(addr.host_string(), RemoteSample { avg, timestamp });
    }

    /// Latest sample per remote host.
    pub fn samples(&self) -> impl Iterator<Item = (&str, &RemoteSample)> {
        self.samples.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn read_proc_loadavg() -> Option<f32> {
    let contents = fs::read_to_string(PROC_LOADAVG).ok()?;
    contents
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Outbox;
    use crate::net::Io as NetIo;
    use crate::message::Message;

    fn manager() -> (LoadavgManager<Outbox, LocalTime>, Outbox) {
        let outbox = Outbox::default();
        let my = CanonicalAddr::parse("10.0.0.1:4040", DEFAULT_PORT).unwrap();
        let mut mgr = LoadavgManager::new(my, outbox.clone(), LocalTime::from_secs(1_000));
        mgr.cpus = 1;
        (mgr, outbox)
    }

    fn published(outbox: &mut Outbox) -> Vec<Message> {
        let mut out = Vec::new();
        for io in outbox.by_ref() {
            if let NetIo::Write(_, msg) = io {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn hysteresis_suppresses_small_moves() {
        let (mut mgr, mut outbox) = manager();
        let subscriber: Vec<PeerId> = vec!["127.0.0.1:5001".parse().unwrap()];
        let now = LocalTime::from_secs(1_000);

        mgr.set_enabled(true);
        for raw in [0.50, 0.55, 0.62, 0.70] {
            mgr.process_sample(raw, &subscriber, now);
        }

        let sent = published(&mut outbox);
        let avgs: Vec<&str> = sent.iter().map(|m| m.param("avg").unwrap()).collect();
        assert_eq!(avgs, vec!["0.50", "0.62"]);
        assert_eq!(sent[0].param("my_address"), Some("10.0.0.1:4040"));
        assert_eq!(sent[0].param("timestamp"), Some("1000"));
    }

    #[test]
    fn samples_are_normalized_per_cpu() {
        let (mut mgr, mut outbox) = manager();
        mgr.cpus = 4;
        let subscriber: Vec<PeerId> = vec!["127.0.0.1:5001".parse().unwrap()];

        mgr.set_enabled(true);
        mgr.process_sample(2.0, &subscriber, LocalTime::from_secs(1_000));

        assert_eq!(published(&mut outbox)[0].param("avg"), Some("0.50"));
    }

    #[test]
    fn disabled_manager_does_not_sample() {
        let (mut mgr, mut outbox) = manager();
        mgr.received_wake(&["127.0.0.1:5001".parse().unwrap()]);
        assert!(published(&mut outbox).is_empty());
    }

    #[test]
    fn arming_is_idempotent() {
        let (mut mgr, mut outbox) = manager();

        mgr.set_enabled(true);
        mgr.set_enabled(true);

        let timers = outbox
            .by_ref()
            .filter(|io| matches!(io, NetIo::SetTimer(_)))
            .count();
        assert_eq!(timers, 1);

        mgr.set_enabled(false);
        mgr.set_enabled(false);
        assert!(!mgr.is_enabled());
    }

    #[test]
    fn listen_records_each_host_once() {
        let (mut mgr, _) = manager();

        assert_eq!(
            mgr.listen("10.0.0.5,10.0.0.6"),
            vec!["10.0.0.5", "10.0.0.6"]
        );
        assert!(mgr.listen("10.0.0.5").is_empty());
        assert!(mgr.is_listening_for("10.0.0.6"));
        assert!(!mgr.is_listening_for("10.0.0.9"));
    }

    #[test]
    fn remote_samples_are_validated() {
        let (mut mgr, _) = manager();

        mgr.record_remote("0.25", "10.0.0.7:4040", "1700000000");
        mgr.record_remote("-1", "10.0.0.8:4040", "1700000000");
        mgr.record_remote("0.5", "10.0.0.8:4040", "12345");
        mgr.record_remote("banana", "10.0.0.8:4040", "1700000000");

        let samples: Vec<_> = mgr.samples().collect();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, "10.0.0.7");
        assert_eq!(samples[0].1.avg, 0.25);
    }
}
