//! Session-wide registry of bucket hashes and bucket states.
//!
//! Two maps live here:
//! - route key → bucket hash, learned from `X-RateLimit-Bucket`;
//! - bucket key → [`Bucket`], where the key is either `"{hash}:{major}"` or, before a hash is
//!   known, `"{route key}:{major}"`.
//!
//! The registry is the only way to reach a bucket. Buckets are created on first use and idle
//! ones are swept once the map reaches the eviction threshold.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketSettings, BucketSnapshot};
use crate::clock::Clock;
use crate::route::Route;
use crate::sleeper::Sleeper;

/// Bucket count at which idle buckets start being evicted.
pub const DEFAULT_EVICTION_THRESHOLD: usize = 256;

/// In-memory registry backed by a read-mostly hash map and a bucket map.
#[derive(Debug)]
pub struct BucketRegistry {
    hashes: RwLock<HashMap<String, String>>,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    settings: BucketSettings,
    eviction_threshold: usize,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl BucketRegistry {
    pub fn new(
        settings: BucketSettings,
        eviction_threshold: usize,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            hashes: RwLock::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            settings,
            eviction_threshold: eviction_threshold.max(1),
            clock,
            sleeper,
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Arc<Bucket>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Known bucket hash for a route key.
    pub fn lookup(&self, route_key: &str) -> Option<String> {
        let hashes = self.hashes.read().unwrap_or_else(|e| e.into_inner());
        hashes.get(route_key).cloned()
    }

    /// Remember `hash` for `route_key`, returning the hash it replaces.
    pub fn record(&self, route_key: &str, hash: &str) -> Option<String> {
        let mut hashes = self.hashes.write().unwrap_or_else(|e| e.into_inner());
        hashes.insert(route_key.to_string(), hash.to_string())
    }

    /// Bucket key for `route` right now, plus the hash it was derived from (if any).
    pub fn resolve(&self, route: &Route) -> (String, Option<String>) {
        let hash = self.lookup(&route.key());
        (route.bucket_key(hash.as_deref()), hash)
    }

    /// Bucket stored under `key`, creating it on first use.
    pub fn bucket_for(&self, key: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets();
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(Bucket::new(
            self.settings.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.sleeper),
        ));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        if buckets.len() >= self.eviction_threshold {
            Self::sweep(&mut buckets);
        }
        bucket
    }

    /// Drop every idle bucket, returning how many were removed.
    pub fn evict_idle(&self) -> usize {
        Self::sweep(&mut self.buckets())
    }

    fn sweep(buckets: &mut HashMap<String, Arc<Bucket>>) -> usize {
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_idle());
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = buckets.len(), "evicted idle rate limit buckets");
        }
        evicted
    }

    /// Adopt a newly reported bucket hash for `route`.
    ///
    /// `bucket` (the state the request was using) is re-keyed under `"{hash}:{major}"` and the
    /// entry under `old_key` is removed, so subsequent callers inherit its counters. Returns the
    /// new key.
    pub fn migrate(
        &self,
        route: &Route,
        old_key: &str,
        hash: &str,
        bucket: &Arc<Bucket>,
    ) -> String {
        let route_key = route.key();
        match self.record(&route_key, hash) {
            Some(previous) if previous != hash => {
                debug!(
                    route = %route_key,
                    from = %previous,
                    to = %hash,
                    "route changed bucket hash"
                );
            }
            Some(_) => {}
            None => debug!(route = %route_key, hash = %hash, "discovered initial bucket hash"),
        }

        let new_key = route.bucket_key(Some(hash));
        let mut buckets = self.buckets();
        if let Some(existing) = buckets.get(&new_key) {
            if !Arc::ptr_eq(existing, bucket) {
                warn!(key = %new_key, "bucket key replaced; migrated state wins");
            }
        }
        buckets.insert(new_key.clone(), Arc::clone(bucket));
        if old_key != new_key {
            buckets.remove(old_key);
        }
        new_key
    }

    pub fn len(&self) -> usize {
        self.buckets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot bucket states sorted by key.
    pub fn snapshot(&self) -> Vec<(String, BucketSnapshot)> {
        let buckets = self.buckets();
        let mut entries: Vec<(String, BucketSnapshot)> =
            buckets.iter().map(|(k, v)| (k.clone(), v.snapshot())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn idle_after(&self) -> Duration {
        self.settings.idle_after
    }
}
