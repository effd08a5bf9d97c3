//! Transport-independent request surface (`spec.md` §6): `generate`,
//! `stream`, `load`, `unload`, `listModels`, `health`. A transport (HTTP,
//! WebSocket, gRPC), the CLI, and language bindings are all expected to
//! be thin wrappers around one `RouterService` instance — none of them
//! are specified here (`spec.md` §1 Non-goals), only the facade they
//! call into.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::engine::EngineSelector;
use crate::error::{Result, RouterError};
use crate::model::descriptor::ModelDescriptor;
use crate::model::handle::ChunkStream;
use crate::pipeline::{AuthorizeHook, NoopAuthorize, Pipeline, PipelineOutcome, DEFAULT_MAX_FALLBACKS};
use crate::registry::{EntryStatus, Registry, RegistryEntrySnapshot};
use crate::request::{GenerationResult, Request};
use crate::router::{Router, Strategy};

/// One component's health, part of [`HealthReport`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    pub detail: String,
}

/// `health()` response (`spec.md` §6): overall status plus a per-component
/// breakdown.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub components: Vec<ComponentHealth>,
}

/// Owns the Registry, Router, Engine Selector, Cache, and Pipeline for
/// one process and exposes the six operations in `spec.md` §6. Building
/// one of these is the only thing a transport, the CLI, or a language
/// binding needs to do.
pub struct RouterService {
    registry: Arc<Registry>,
    router: Arc<Router>,
    engine: Arc<EngineSelector>,
    cache: Arc<Cache>,
    pipeline: Pipeline,
    monitor_join: tokio::task::JoinHandle<()>,
    max_fallbacks: usize,
    cache_ttl_ms: u64,
}

impl RouterService {
    /// Builds a service from a validated [`Config`], with no
    /// tenant/quota hook. Loads the registry journal if present;
    /// a missing or corrupt journal starts the registry empty
    /// (`spec.md` §4.1).
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with_authorize(config, Arc::new(NoopAuthorize)).await
    }

    /// Same as [`Self::from_config`], but lets a caller plug in a
    /// tenant/quota hook for pipeline stage 2 (`spec.md` §4.4 step 2).
    pub async fn from_config_with_authorize(
        config: &Config,
        authorize: Arc<dyn AuthorizeHook>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new(default_capacity(), config.registry_path.clone()));
        registry.load().await?;

        let (router, monitor_join) = Router::spawn(
            registry.clone(),
            config.strategy,
            crate::router::monitor::DEFAULT_MONITOR_INTERVAL,
        );
        router.refresh_now().await;

        let engine = Arc::new(EngineSelector::default_set());
        let cache = Arc::new(Cache::new(config.cache_ttl_ms));

        let pipeline = Pipeline::default_stages(
            registry.clone(),
            router.clone(),
            engine.clone(),
            cache.clone(),
            authorize,
            DEFAULT_MAX_FALLBACKS,
            config.cache_ttl_ms,
        );

        Ok(Self {
            registry,
            router,
            engine,
            cache,
            pipeline,
            monitor_join,
            max_fallbacks: DEFAULT_MAX_FALLBACKS,
            cache_ttl_ms: config.cache_ttl_ms,
        })
    }

    /// Lower-level constructor for tests and embedders that already hold
    /// their own `Registry`/`Strategy` and don't want `Config::from_env`.
    pub fn new(registry: Arc<Registry>, strategy: Strategy) -> Self {
        let (router, monitor_join) = Router::spawn(
            registry.clone(),
            strategy,
            crate::router::monitor::DEFAULT_MONITOR_INTERVAL,
        );
        let engine = Arc::new(EngineSelector::default_set());
        let cache = Arc::new(Cache::new(crate::config::DEFAULT_CACHE_TTL_MS));
        let pipeline = Pipeline::default_stages(
            registry.clone(),
            router.clone(),
            engine.clone(),
            cache.clone(),
            Arc::new(NoopAuthorize),
            DEFAULT_MAX_FALLBACKS,
            crate::config::DEFAULT_CACHE_TTL_MS,
        );
        Self {
            registry,
            router,
            engine,
            cache,
            pipeline,
            monitor_join,
            max_fallbacks: DEFAULT_MAX_FALLBACKS,
            cache_ttl_ms: crate::config::DEFAULT_CACHE_TTL_MS,
        }
    }

    /// Registers a descriptor and, unless it's `Mock`/`Simple`, leaves it
    /// `registered` until first use (`spec.md` §3 "created lazily on
    /// first use or eagerly at startup"). Eager loaders can call
    /// [`Self::load_now`] right after.
    #[instrument(skip(self, descriptor), fields(id = %descriptor.id))]
    pub async fn load(&self, descriptor: ModelDescriptor) -> Result<RegistryEntrySnapshot> {
        let entry = self.registry.register(descriptor).await?;
        self.router.refresh_now().await;
        Ok(entry)
    }

    /// Eagerly binds a handle for an already-registered model and marks
    /// it `loaded`, instead of waiting for the pipeline's lazy
    /// `ensureLoaded` on first request.
    #[instrument(skip(self))]
    pub async fn load_now(&self, model_id: &str) -> Result<()> {
        let snapshot = self.registry.get(model_id).await?;
        let handle = self.engine.load_model(&snapshot.descriptor).await?;
        self.registry.attach_handle(model_id, handle).await?;
        self.router.refresh_now().await;
        Ok(())
    }

    /// Tears down a loaded model and removes it from the registry
    /// entirely (`spec.md` §6 `unload(modelId)`).
    #[instrument(skip(self))]
    pub async fn unload(&self, model_id: &str) -> Result<()> {
        self.registry.unregister(model_id).await?;
        self.router.refresh_now().await;
        Ok(())
    }

    /// `listModels()` (`spec.md` §6): every descriptor plus its current
    /// status.
    pub async fn list_models(&self) -> Vec<RegistryEntrySnapshot> {
        self.registry.list().await
    }

    /// Batched completion (`spec.md` §6 `generate`). Runs the full
    /// default pipeline with no deadline beyond the request's own
    /// `options.timeoutMs`, if present.
    #[instrument(skip(self, request))]
    pub async fn generate(&self, request: Request) -> Result<GenerationResult> {
        let cancel = CancellationToken::new();
        let outcome = self.run_with_timeout(request, cancel).await?;
        match outcome {
            PipelineOutcome::Result(result) => Ok(result),
            PipelineOutcome::Stream(_) => Err(RouterError::InternalError(
                "generate() received a streaming outcome; call stream() for options.stream = true".into(),
            )),
        }
    }

    /// Streaming completion (`spec.md` §6 `stream`). Returns a finite,
    /// cancellable sequence of chunks; dropping it mid-sequence releases
    /// every per-request resource (`spec.md` §4.3).
    #[instrument(skip(self, request))]
    pub async fn stream(&self, mut request: Request) -> Result<ChunkStream> {
        request.options.stream = true;
        let cancel = CancellationToken::new();
        let outcome = self.run_with_timeout(request, cancel).await?;
        match outcome {
            PipelineOutcome::Stream(stream) => Ok(stream),
            PipelineOutcome::Result(_) => Err(RouterError::InternalError(
                "stream() received a batched outcome".into(),
            )),
        }
    }

    /// Runs the pipeline, wiring `options.timeoutMs` (if present) into
    /// the cancellation token so a deadline abort and an explicit cancel
    /// share one code path (`spec.md` §5).
    async fn run_with_timeout(&self, request: Request, cancel: CancellationToken) -> Result<PipelineOutcome> {
        let Some(timeout_ms) = request.options.timeout_ms else {
            return self.pipeline.execute(request, cancel).await;
        };

        let child = cancel.child_token();
        let timer_cancel = child.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            timer_cancel.cancel();
        });

        let result = self.pipeline.execute(request, child).await;
        timer.abort();

        match result {
            Err(RouterError::Cancelled(msg)) if !cancel.is_cancelled() => {
                // Our own timer fired, not an externally supplied token.
                Err(RouterError::Timeout(msg))
            }
            other => other,
        }
    }

    /// `health()` (`spec.md` §6): aggregate status across the registry,
    /// the monitor task, and the cache.
    #[instrument(skip(self))]
    pub async fn health(&self) -> HealthReport {
        let mut components = Vec::new();
        let mut all_healthy = true;

        let registry_healthy = !self.monitor_join.is_finished();
        components.push(ComponentHealth {
            name: "router-monitor",
            healthy: registry_healthy,
            detail: if registry_healthy {
                "background score monitor running".to_string()
            } else {
                "background score monitor task has exited".to_string()
            },
        });
        all_healthy &= registry_healthy;

        let entries = self.registry.list().await;
        let loaded = entries.iter().filter(|e| e.status == EntryStatus::Loaded).count();
        let errored = entries.iter().filter(|e| e.status == EntryStatus::Error).count();
        let registry_ok = !entries.is_empty() || loaded == 0;
        components.push(ComponentHealth {
            name: "registry",
            healthy: registry_ok,
            detail: format!("{} registered, {loaded} loaded, {errored} errored", entries.len()),
        });

        components.push(ComponentHealth {
            name: "cache",
            healthy: true,
            detail: format!("{} entries", self.cache.len()),
        });

        if errored > 0 {
            warn!(errored, "health check observed errored models");
        }

        HealthReport {
            status: if all_healthy { "healthy" } else { "degraded" },
            components,
        }
    }

    /// Releases the monitor task and every substrate's resources. Call
    /// on graceful shutdown.
    pub async fn shutdown(self) -> Result<()> {
        self.monitor_join.abort();
        self.engine.cleanup().await?;
        info!("router service shut down");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn max_fallbacks(&self) -> usize {
        self.max_fallbacks
    }

    pub fn cache_ttl_ms(&self) -> u64 {
        self.cache_ttl_ms
    }
}

fn default_capacity() -> usize {
    // `spec.md` doesn't name a registry capacity env key in §6's table;
    // a generous default keeps `register` from hitting `CapacityExceeded`
    // in ordinary operation while still exercising LRU eviction under
    // deliberate load in tests.
    1024
}
