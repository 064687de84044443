//! Deferred-message cache.
//!
//! Messages addressed to a service this host advertises on disk, but whose
//! session is not presently registered, wait here until the service
//! REGISTERs or the per-message TTL runs out.
use tracing::warn;

use crate::message::Message;
use crate::net::{LocalDuration, LocalTime};

/// Default time-to-live, seconds.
const DEFAULT_TTL: i64 = 60;
/// Accepted TTL bounds, seconds.
const MIN_TTL: i64 = 10;
const MAX_TTL: i64 = 86_400;

#[derive(Debug)]
struct CacheEntry {
    expires: LocalTime,
    message: Message,
}

/// FIFO cache of deferred messages with per-entry expiry.
#[derive(Debug, Default)]
pub struct MessageCache {
    entries: Vec<CacheEntry>,
}

impl MessageCache {
    /// Cache a message according to its `cache` parameter. Returns `false`
    /// when the message asked not to be cached.
    pub fn push(&mut self, message: Message, now: LocalTime) -> bool {
        let cache = message.param("cache").unwrap_or_default();
        if cache == "no" {
            return false;
        }

        // The cache parameter is a `;`-separated list of `key=value`
        // options; `ttl` is the only one recognized.
        let mut ttl = DEFAULT_TTL;
        for option in cache.split(';') {
            if let Some(("ttl", value)) = option.split_once('=').map(|(k, v)| (k.trim(), v)) {
                match value.parse::<i64>() {
                    Ok(t) if (MIN_TTL..=MAX_TTL).contains(&t) => ttl = t,
                    _ => {
                        warn!(target: "bus", "Invalid ttl in message [{}]", message);
                    }
                }
            }
        }

        self.entries.push(CacheEntry {
            expires: now + LocalDuration::from_secs(ttl as u64),
            message,
        });

        true
    }

    /// Drop entries whose TTL ran out.
    pub fn sweep(&mut self, now: LocalTime) {
        self.entries.retain(|entry| now <= entry.expires);
    }

    /// Remove and return, in arrival order, the entries addressed to the
    /// given service. Expired entries are swept first.
    pub fn drain_for(&mut self, service: &str, now: LocalTime) -> Vec<Message> {
        self.sweep(now);

        let mut drained = Vec::new();
        self.entries.retain(|entry| {
            if entry.message.service == service {
                drained.push(entry.message.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
