//! The Router (`spec.md` §4.2): given a request and the registry,
//! returns an ordered candidate list headed by the chosen model.

pub mod health;
pub mod monitor;
pub mod strategy;

pub use health::CircuitBreaker;
pub use monitor::{Monitor, MonitorHandle, RouterSnapshot};
pub use strategy::{Candidate, Strategy};

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::instrument;

use crate::error::{CandidateAttempt, Result, RouterError};
use crate::model::descriptor::{Capability, CapabilitySet};
use crate::registry::Registry;
use crate::request::{GenerationOptions, Request};

/// Sliding window size and error-ratio threshold for every model's
/// circuit breaker, and the cooldown before a half-open probe.
pub const HEALTH_WINDOW: usize = 20;
pub const HEALTH_ERROR_RATIO_THRESHOLD: f64 = 0.5;
pub const HEALTH_COOLDOWN_MS: u64 = 30_000;

pub struct Router {
    registry: Arc<Registry>,
    monitor_handle: MonitorHandle,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    round_robin_cursors: DashMap<Strategy, AtomicUsize>,
    default_strategy: Strategy,
}

impl Router {
    /// Builds a `Router` and spawns its background `Monitor` task.
    /// Returns the router plus the monitor's `JoinHandle` so the caller
    /// owns its lifetime (aborted on shutdown).
    pub fn spawn(
        registry: Arc<Registry>,
        default_strategy: Strategy,
        monitor_interval: Duration,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let breakers = Arc::new(DashMap::new());
        let monitor = Monitor::new(registry.clone(), monitor_interval);
        let monitor_handle = monitor.handle();

        let router = Arc::new(Self {
            registry,
            monitor_handle,
            breakers,
            round_robin_cursors: DashMap::new(),
            default_strategy,
        });

        let breakers_for_task = router.breakers.clone();
        let join = tokio::spawn(monitor.run(breakers_for_task));
        (router, join)
    }

    /// Breaker for `model_id`, creating one with the default window on
    /// first use.
    pub fn breaker_for(&self, model_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(model_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    HEALTH_WINDOW,
                    HEALTH_ERROR_RATIO_THRESHOLD,
                    HEALTH_COOLDOWN_MS,
                ))
            })
            .clone()
    }

    /// Forces the monitor to rebuild its snapshot immediately — called
    /// right after a model finishes loading so it's selectable without
    /// waiting a full tick.
    pub async fn refresh_now(&self) {
        let candidates = self.live_candidates().await;
        self.monitor_handle.publish(candidates).await;
    }

    async fn live_candidates(&self) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for entry in self.registry.list().await {
            if entry.status != crate::registry::EntryStatus::Loaded {
                continue;
            }
            let breaker = self.breaker_for(&entry.descriptor.id);
            if !breaker.is_available().await {
                continue;
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
        candidates
    }

    fn required_capabilities(options: &GenerationOptions) -> CapabilitySet {
        let mut required = CapabilitySet::new();
        if options.stream {
            required.insert(Capability::Streaming);
        }
        required
    }

    /// Returns the ordered candidate list for `request`: head is the
    /// chosen model, rest are fallback order. Fails with `NoViableModel`
    /// if nothing passes the capability/health filter (the caller
    /// distinguishes an empty result from a genuine error — this method
    /// returns `Ok(vec![])` and lets the pipeline raise `NoViableModel`
    /// with its own attempt log once it has exhausted the list).
    #[instrument(skip(self, request))]
    pub async fn select_model(&self, request: &Request) -> Result<Vec<Candidate>> {
        let strategy = request.strategy_override.unwrap_or(self.default_strategy);
        let required = Self::required_capabilities(&request.options);
        let candidates = self.monitor_handle.current().await.candidates.clone();

        if strategy == Strategy::Explicit {
            let model_id = request
                .model_id
                .as_deref()
                .ok_or_else(|| RouterError::ValidationError(
                    "explicit strategy requires request.model_id".into(),
                ))?;
            if !self.registry_contains(model_id).await {
                return Err(RouterError::NotFound(model_id.to_string()));
            }
        }

        let cursor = if strategy == Strategy::RoundRobin {
            Some(self.round_robin_cursors.entry(strategy).or_insert_with(|| AtomicUsize::new(0)))
        } else {
            None
        };

        let ordered = strategy.select(
            &candidates,
            &required,
            cursor.as_deref(),
            request.model_id.as_deref(),
        );

        Ok(ordered)
    }

    async fn registry_contains(&self, id: &str) -> bool {
        self.registry.get(id).await.is_ok()
    }

    /// Builds the `NoViableModel` error once the pipeline has exhausted
    /// every candidate in the ordered list.
    pub fn no_viable_model(attempts: Vec<CandidateAttempt>) -> RouterError {
        RouterError::NoViableModel(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::{CapabilitySet, ModelDescriptor, ModelFormat, ModelParameters};
    use crate::request::Request;
    use tempfile::tempdir;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            format: ModelFormat::Mock,
            source: format!("mock://{id}"),
            capabilities: CapabilitySet::from_iter_caps([Capability::Chat]),
            parameters: ModelParameters::default(),
            provider_config: None,
            quality_score: 0.5,
        }
    }

    #[tokio::test]
    async fn select_model_returns_empty_when_nothing_loaded() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(10, dir.path().join("registry.json")));
        registry.register(descriptor("m1")).await.unwrap();

        let (router, join) = Router::spawn(registry, Strategy::Balanced, Duration::from_millis(10));
        let request = Request::new("hello");
        let candidates = router.select_model(&request).await.unwrap();
        assert!(candidates.is_empty(), "m1 is registered but not loaded");
        join.abort();
    }

    #[tokio::test]
    async fn select_model_sees_loaded_entries_after_refresh() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(10, dir.path().join("registry.json")));
        registry.register(descriptor("m1")).await.unwrap();
        registry.mark_status("m1", crate::registry::EntryStatus::Loaded).await.unwrap();

        let (router, join) = Router::spawn(registry, Strategy::Balanced, Duration::from_secs(30));
        router.refresh_now().await;

        let request = Request::new("hello");
        let candidates = router.select_model(&request).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "m1");
        join.abort();
    }

    #[tokio::test]
    async fn explicit_strategy_requires_known_model_id() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(10, dir.path().join("registry.json")));
        let (router, join) = Router::spawn(registry, Strategy::Balanced, Duration::from_secs(30));

        let mut request = Request::new("hello");
        request.strategy_override = Some(Strategy::Explicit);
        request.model_id = Some("missing".to_string());

        let err = router.select_model(&request).await.unwrap_err();
        assert!(matches!(err, RouterError::NotFound(_)));
        join.abort();
    }
}
