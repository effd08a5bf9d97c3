//! Per-model metrics, updated atomically at the end of each call
//! (`spec.md` §3). Independent counters use independent atomics rather
//! than one lock, so unrelated updates never serialize against each
//! other — a refinement of the teacher's single-`RwLock`
//! `CircuitBreakerState` pattern, which is fine for one small state
//! machine but would be a needless bottleneck for five unrelated
//! counters updated on every request.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    inference_count: AtomicU64,
    total_tokens: AtomicU64,
    /// Running sum of latencies in ms; divide by `inference_count` for
    /// the average. Avoids read-modify-write races that a stored average
    /// would need a lock to avoid.
    latency_sum_ms: AtomicU64,
    last_used_at_ms: AtomicI64,
    load_time_ms: AtomicU64,
    error_count: AtomicU64,
    /// Current in-flight request count, for the `least-loaded` strategy.
    in_flight: AtomicU64,
}

/// Immutable point-in-time view, safe to read outside any lock.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub inference_count: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
    pub last_used_at_ms: i64,
    pub load_time_ms: u64,
    pub error_count: u64,
    pub in_flight: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a `Metrics` from a previously persisted snapshot, used
    /// when the registry reloads its journal on startup.
    pub fn restore(snapshot: &MetricsSnapshot) -> Self {
        Self {
            inference_count: AtomicU64::new(snapshot.inference_count),
            total_tokens: AtomicU64::new(snapshot.total_tokens),
            latency_sum_ms: AtomicU64::new(
                (snapshot.avg_latency_ms * snapshot.inference_count as f64).round() as u64,
            ),
            last_used_at_ms: AtomicI64::new(snapshot.last_used_at_ms),
            load_time_ms: AtomicU64::new(snapshot.load_time_ms),
            error_count: AtomicU64::new(snapshot.error_count),
            in_flight: AtomicU64::new(0),
        }
    }

    /// RAII-friendly pair: call at invoke start, call the returned
    /// guard's drop (or `end_call`) when the call finishes, succeeds or
    /// fails, is cancelled, or times out.
    pub fn begin_call(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn record_success(&self, tokens: u32, latency_ms: u64, now_ms: i64) {
        self.inference_count.fetch_add(1, Ordering::Relaxed);
        self.total_tokens.fetch_add(tokens as u64, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.last_used_at_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_error(&self, now_ms: i64) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.last_used_at_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_load_time(&self, load_time_ms: u64) {
        self.load_time_ms.store(load_time_ms, Ordering::Relaxed);
    }

    pub fn last_used_at_ms(&self) -> i64 {
        self.last_used_at_ms.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.inference_count.load(Ordering::Relaxed);
        let sum = self.latency_sum_ms.load(Ordering::Relaxed);
        let avg = if count > 0 { sum as f64 / count as f64 } else { 0.0 };
        MetricsSnapshot {
            inference_count: count,
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            avg_latency_ms: avg,
            last_used_at_ms: self.last_used_at_ms.load(Ordering::Relaxed),
            load_time_ms: self.load_time_ms.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Error ratio over all recorded calls — a simplified stand-in for
    /// the sliding window in `spec.md` §4.2; the windowed variant lives
    /// in `router::health::CircuitBreaker`, which tracks only the last
    /// N outcomes. This whole-history ratio is exposed for diagnostics
    /// and the `cost-optimized`/`balanced` scoring functions.
    pub fn error_ratio(&self) -> f64 {
        let errors = self.error_count.load(Ordering::Relaxed);
        let successes = self.inference_count.load(Ordering::Relaxed);
        let total = errors + successes;
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_calls() {
        let m = Metrics::new();
        m.record_success(10, 100, 1_000);
        m.record_success(20, 300, 2_000);
        let snap = m.snapshot();
        assert_eq!(snap.inference_count, 2);
        assert_eq!(snap.total_tokens, 30);
        assert_eq!(snap.avg_latency_ms, 200.0);
        assert_eq!(snap.last_used_at_ms, 2_000);
    }

    #[test]
    fn error_ratio_accounts_for_both_outcomes() {
        let m = Metrics::new();
        m.record_success(1, 1, 1);
        m.record_error(2);
        m.record_error(3);
        assert!((m.error_ratio() - (2.0 / 3.0)).abs() < 1e-9);
    }
}
