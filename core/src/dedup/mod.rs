//! Short-term duplicate suppression. A `LogEntry` whose
//! fingerprint was observed within `ttl` is dropped before it ever reaches
//! the dispatcher's ingress queue.
//!
//! Built as a `DashMap` for O(1) membership plus a side structure for
//! ordered eviction, the usual two-structure split for a capped LRU sweep.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::Fingerprint;

#[derive(Clone, Debug)]
pub struct DedupConfig {
    pub ttl: std::time::Duration,
    pub max_entries: usize,
    /// How often the background sweeper walks the insertion-order queue
    /// evicting TTL-expired entries that `observe_if_new` hasn't touched
    /// since expiring. Entries are still evicted lazily on touch regardless
    /// of this interval; the sweep only bounds memory held by fingerprints
    /// nobody asks about again.
    pub sweep_interval: std::time::Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: std::time::Duration::from_secs(10),
            max_entries: 200_000,
            sweep_interval: std::time::Duration::from_secs(5),
        }
    }
}

/// Fingerprint -> first-seen-instant map with insertion-order eviction.
/// `observe_if_new` is the only entry point workers call; everything else
/// is sweep bookkeeping.
pub struct DeduplicationCache {
    config: DedupConfig,
    seen: DashMap<Fingerprint, Instant>,
    order: Mutex<VecDeque<Fingerprint>>,
    pub suppressed_total: AtomicU64,
}

impl DeduplicationCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            suppressed_total: AtomicU64::new(0),
        }
    }

    /// Returns `true` if `fp` had not been seen within `ttl` (the entry
    /// should be forwarded), `false` if it is a duplicate (drop it). Expires
    /// stale entries lazily on the path that touches them, matching the
    /// access index's lazy-eviction-on-touch behaviour.
    pub async fn observe_if_new(&self, fp: Fingerprint) -> bool {
        let now = Instant::now();

        if let Some(seen_at) = self.seen.get(&fp) {
            if now.duration_since(*seen_at) < self.config.ttl {
                self.suppressed_total.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        self.seen.insert(fp, now);
        self.order.lock().await.push_back(fp);
        self.enforce_cap().await;
        true
    }

    /// Oldest-first eviction once the cache grows past `max_entries`,
    /// mirroring the access index's size-capped LRU ring.
    async fn enforce_cap(&self) {
        let mut order = self.order.lock().await;
        while self.seen.len() > self.config.max_entries {
            let Some(oldest) = order.pop_front() else {
                break;
            };
            self.seen.remove(&oldest);
        }
    }

    /// Periodic sweep for TTL-expired entries not touched by `observe_if_new`
    /// since expiring, so the cache doesn't grow unbounded between touches.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut order = self.order.lock().await;
        while let Some(&front) = order.front() {
            match self.seen.get(&front) {
                Some(seen_at) if now.duration_since(*seen_at) >= ttl => {
                    self.seen.remove(&front);
                    order.pop_front();
                }
                Some(_) => break,
                None => {
                    order.pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Spawns the periodic sweep on `config.sweep_interval` until `shutdown`
    /// fires, same `tokio::time::interval` + `CancellationToken` `select!`
    /// shape used by every other background task in this crate.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => cache.sweep_expired().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_observation_passes_duplicate_is_suppressed() {
        let cache = DeduplicationCache::new(DedupConfig::default());
        let fp = Fingerprint(42);
        assert!(cache.observe_if_new(fp).await);
        assert!(!cache.observe_if_new(fp).await);
        assert_eq!(cache.suppressed_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_allows_reobservation() {
        tokio::time::pause();
        let cache = DeduplicationCache::new(DedupConfig {
            ttl: std::time::Duration::from_secs(1),
            max_entries: 100,
            ..DedupConfig::default()
        });
        let fp = Fingerprint(1);
        assert!(cache.observe_if_new(fp).await);
        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert!(cache.observe_if_new(fp).await);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_first() {
        let cache = DeduplicationCache::new(DedupConfig {
            ttl: std::time::Duration::from_secs(60),
            max_entries: 2,
            ..DedupConfig::default()
        });
        assert!(cache.observe_if_new(Fingerprint(1)).await);
        assert!(cache.observe_if_new(Fingerprint(2)).await);
        assert!(cache.observe_if_new(Fingerprint(3)).await);
        assert_eq!(cache.len(), 2);
        // fingerprint 1 was evicted, so it's treated as new again
        assert!(cache.observe_if_new(Fingerprint(1)).await);
    }
}
