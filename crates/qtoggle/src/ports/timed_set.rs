//! A set whose members expire after a fixed TTL.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Used for the read-error backoff: a port whose read failed stays in the
/// set (and is not polled) until its entry expires.
#[derive(Debug)]
pub struct TimedSet {
    ttl: Duration,
    entries: DashMap<String, Instant>,
}

impl TimedSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Add or refresh a member
    pub fn insert(&self, key: impl Into<String>) {
        self.entries.insert(key.into(), Instant::now() + self.ttl);
    }

    /// Whether `key` is a live member; expired members are dropped
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.remove_if(key, |_, expires| *expires <= now);
        self.entries.contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.retain(|_, expires| *expires > now);
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
