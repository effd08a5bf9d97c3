//! Result cache (`spec.md` §3 Cache Entry, §4.4 stage "cacheLookup" /
//! "cacheStore"): fingerprint keyed, TTL'd, with at-most-one-concurrent-
//! invoke per fingerprint so a burst of identical requests produces one
//! backend call instead of N. `DashMap` storage pattern grounded in the
//! teacher's `analytics/anomaly.rs` baseline map.

pub mod fingerprint;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::request::GenerationResult;

pub use fingerprint::fingerprint as compute_fingerprint;

/// One cached result plus the wall-clock it expires at.
#[derive(Debug, Clone)]
struct CacheEntry {
    result: GenerationResult,
    created_at_ms: i64,
    ttl_ms: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) as u64 >= self.ttl_ms
    }
}

/// Per-fingerprint coordination for concurrent identical requests: the
/// first caller to observe a miss becomes the "builder" and the rest
/// wait on `notify` for it to either populate the cache or drop without
/// writing (`spec.md` §5 "Cache: many readers, single-writer per
/// fingerprint, enforced by a per-key in-flight map").
struct InFlight {
    notify: Notify,
}

pub struct Cache {
    entries: DashMap<String, CacheEntry>,
    in_flight: Arc<DashMap<String, Arc<InFlight>>>,
    default_ttl_ms: u64,
}

/// Returned by [`Cache::get_or_lock`]: either the request was already
/// cached, or the caller must produce a result and report it back via
/// [`Cache::complete`]/[`Cache::abandon`].
pub enum Lookup {
    Hit(GenerationResult),
    Miss(InFlightGuard),
}

/// Held by whichever caller is responsible for computing the result for
/// a fingerprint. Its `Drop` impl removes the in-flight entry and wakes
/// every waiter if neither `complete` nor `abandon` already did so, so a
/// builder that bails out early (panics, or is simply dropped on an
/// error return) can never strand waiters parked in
/// `in_flight.notify.notified().await` forever.
pub struct InFlightGuard {
    fingerprint: String,
    in_flight: Arc<InFlight>,
    map: Arc<DashMap<String, Arc<InFlight>>>,
    released: bool,
}

impl InFlightGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.map.remove(&self.fingerprint);
        self.in_flight.notify.notify_waiters();
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl Cache {
    pub fn new(default_ttl_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
            default_ttl_ms,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Returns a hit if a live entry exists; otherwise either becomes
    /// the builder (first caller) or waits for the existing builder to
    /// finish and re-checks (subsequent callers), matching the dedup
    /// contract in `spec.md` §4.4.
    pub async fn get_or_lock(&self, key: &str) -> Lookup {
        loop {
            if let Some(entry) = self.entries.get(key) {
                if !entry.is_expired(Self::now_ms()) {
                    return Lookup::Hit(entry.result.clone());
                }
                drop(entry);
                self.entries.remove(key);
            }

            // Fast path: become the builder if nobody else is building.
            let mut became_builder = false;
            let in_flight = self
                .in_flight
                .entry(key.to_string())
                .or_insert_with(|| {
                    became_builder = true;
                    Arc::new(InFlight { notify: Notify::new() })
                })
                .clone();

            if became_builder {
                return Lookup::Miss(InFlightGuard {
                    fingerprint: key.to_string(),
                    in_flight,
                    map: self.in_flight.clone(),
                    released: false,
                });
            }

            // Someone else is building; wait for them to finish, then
            // loop back around to re-check the cache.
            in_flight.notify.notified().await;
        }
    }

    /// The builder reports a successful result: stores it with the
    /// default TTL (or an override) and wakes every waiter.
    pub fn complete(&self, mut guard: InFlightGuard, result: GenerationResult, ttl_ms: Option<u64>) {
        let entry = CacheEntry {
            result,
            created_at_ms: Self::now_ms(),
            ttl_ms: ttl_ms.unwrap_or(self.default_ttl_ms),
        };
        self.entries.insert(guard.fingerprint.clone(), entry);
        guard.release();
    }

    /// The builder failed or the result wasn't cache-eligible: release
    /// waiters without writing anything. Equivalent to simply dropping
    /// the guard; kept as an explicit call for readability at call sites
    /// that want to document the "gave up" path.
    pub fn abandon(&self, mut guard: InFlightGuard) {
        debug!(fingerprint = %guard.fingerprint, "cache build abandoned, nothing stored");
        guard.release();
    }

    /// Removes every expired entry. Not required for correctness (hits
    /// self-evict lazily) but keeps memory bounded under long-running
    /// processes with a large, churning key space.
    pub fn sweep_expired(&self) -> usize {
        let now = Self::now_ms();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|kv| kv.value().is_expired(now))
            .map(|kv| kv.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
