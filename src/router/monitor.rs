//! Background score monitor (`spec.md` §4.2 "Concurrency"). Periodically
//! rebuilds the candidate list from the registry and publishes it as an
//! immutable snapshot so `Router::select_model` never locks across a
//! suspension point — grounded in the teacher's long-lived
//! `tokio::spawn` consumer loop (`pipeline/ingestion.rs::start_consuming`).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::registry::{EntryStatus, Registry};
use crate::router::health::CircuitBreaker;
use crate::router::strategy::Candidate;

/// Default recompute interval; `spec.md` §4.2 leaves this "configurable,
/// default 30s" and doesn't surface it as its own env var, so it's a
/// constructor argument rather than a `Config` field.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Published snapshot: every `loaded` model's current scoring inputs,
/// filtered to those whose circuit breaker currently allows traffic.
#[derive(Debug, Clone, Default)]
pub struct RouterSnapshot {
    pub candidates: Vec<Candidate>,
}

pub struct Monitor {
    registry: Arc<Registry>,
    snapshot: Arc<RwLock<Arc<RouterSnapshot>>>,
    interval: Duration,
}

impl Monitor {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            snapshot: Arc::new(RwLock::new(Arc::new(RouterSnapshot::default()))),
            interval,
        }
    }

    /// Cheap, lock-free-on-the-read-path handle to the latest snapshot.
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            snapshot: self.snapshot.clone(),
        }
    }

    /// Runs forever, refreshing the snapshot every `interval`. Intended
    /// to be `tokio::spawn`ed once at startup; the returned `JoinHandle`
    /// is owned by the caller for shutdown.
    pub async fn run(self, breakers: Arc<dashmap::DashMap<String, Arc<CircuitBreaker>>>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.refresh(&breakers).await;
        }
    }

    #[instrument(skip(self, breakers))]
    async fn refresh(&self, breakers: &dashmap::DashMap<String, Arc<CircuitBreaker>>) {
        let mut candidates = Vec::new();
        for entry in self.registry.list().await {
            if entry.status != EntryStatus::Loaded {
                continue;
            }
            if let Some(breaker) = breakers.get(&entry.descriptor.id) {
                if !breaker.is_available().await {
                    continue;
                }
            }
            candidates.push(Candidate {
                id: entry.descriptor.id.clone(),
                capabilities: entry.descriptor.capabilities.clone(),
                quality_score: entry.descriptor.quality_score,
                avg_latency_ms: entry.metrics.avg_latency_ms,
                cost_per_million_tokens: entry.descriptor.cost_per_million_tokens(),
                in_flight: entry.metrics.in_flight,
                last_used_at_ms: entry.metrics.last_used_at_ms,
            });
        }

        debug!(count = candidates.len(), "router snapshot refreshed");
        let mut guard = self.snapshot.write().await;
        *guard = Arc::new(RouterSnapshot { candidates });
    }

    /// Forces an immediate refresh, used right after a model finishes
    /// loading so selection doesn't wait a full tick to see it.
    pub async fn refresh_now(&self, breakers: &dashmap::DashMap<String, Arc<CircuitBreaker>>) {
        self.refresh(breakers).await;
    }
}

/// Lightweight clone-able reader, held by the router and pipeline.
#[derive(Clone)]
pub struct MonitorHandle {
    snapshot: Arc<RwLock<Arc<RouterSnapshot>>>,
}

impl MonitorHandle {
    pub async fn current(&self) -> Arc<RouterSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Publishes a freshly computed candidate list, used by `Router` to
    /// force an out-of-band refresh (e.g. right after a load completes)
    /// without waiting for the monitor's next tick.
    pub async fn publish(&self, candidates: Vec<Candidate>) {
        let mut guard = self.snapshot.write().await;
        *guard = Arc::new(RouterSnapshot { candidates });
    }
}
