//! TTL-bounded delay cache.
//!
//! Keyed by proxy name, not by group: a proxy that appears in several groups
//! shares one entry. Entries past the TTL are never returned; the coordinator
//! sweeps them out periodically.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::SharedConfig;
use crate::observability::metrics;
use crate::topology::model::is_known_delay;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    delay: i32,
    recorded_at: Instant,
}

/// Shared proxy-name → delay table.
#[derive(Clone)]
pub struct DelayCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    config: SharedConfig,
}

impl DelayCache {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.recorded_at) < self.config.load().cache.ttl()
    }

    /// Cached delay for `proxy`, if recorded within the TTL.
    pub fn get(&self, proxy: &str) -> Option<i32> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(proxy)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.delay);
        metrics::record_cache_lookup(hit.is_some());
        hit
    }

    /// Record a measurement. Unknown delays are not cached.
    pub fn put(&self, proxy: &str, delay: i32) {
        if !is_known_delay(delay) {
            return;
        }
        self.entries.insert(
            proxy.to_string(),
            CacheEntry {
                delay,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Drop every entry past the TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| self.is_fresh(entry, now));
        before.saturating_sub(self.entries.len())
    }

    /// Keep only the named proxies.
    pub fn retain_proxies(&self, names: &HashSet<String>) {
        self.entries.retain(|name, _| names.contains(name));
    }

    /// True when every name has a valid entry.
    pub fn is_fresh_for_all<'a, I>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Instant::now();
        names.into_iter().all(|name| {
            self.entries
                .get(name)
                .is_some_and(|entry| self.is_fresh(&entry, now))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
