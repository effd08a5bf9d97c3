//! Concrete stage implementations for the default pipeline
//! (`spec.md` §4.4). Each stage is deliberately narrow: validation
//! doesn't know about routing, routing doesn't know about caching, and
//! so on, so the ordered list in `Pipeline::default_stages` is the only
//! place the full sequence is assembled.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::engine::EngineSelector;
use crate::error::{Result, RouterError};
use crate::pipeline::{check_cancelled, mark_attempt, mark_model_failed, Context, Stage, DEFAULT_MAX_FALLBACKS};
use crate::registry::{EntryStatus, Registry};
use crate::router::Router;

/// Stage 1: shape-check options. Fails fast, no retry (`spec.md` §4.4
/// step 1, §7 `ValidationError`).
pub struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn run(&self, ctx: Context, cancel: &CancellationToken) -> Result<Context> {
        check_cancelled(cancel)?;
        ctx.request.options.validate().map_err(RouterError::ValidationError)?;
        if ctx.request.prompt.trim().is_empty() && ctx.request.messages.is_empty() {
            return Err(RouterError::ValidationError(
                "request must supply a non-empty prompt or at least one message".into(),
            ));
        }
        Ok(ctx)
    }
}

/// External collaborator hook for stage 2 (`spec.md` §4.4 step 2:
/// "external collaborator may attach a tenant and a quota check").
/// Default implementation ([`NoopAuthorize`]) always allows.
#[async_trait]
pub trait AuthorizeHook: Send + Sync {
    async fn authorize(&self, request: &crate::request::Request) -> Result<()>;
}

pub struct NoopAuthorize;

#[async_trait]
impl AuthorizeHook for NoopAuthorize {
    async fn authorize(&self, _request: &crate::request::Request) -> Result<()> {
        Ok(())
    }
}

pub struct AuthorizeStage {
    hook: Arc<dyn AuthorizeHook>,
}

impl AuthorizeStage {
    pub fn new(hook: Arc<dyn AuthorizeHook>) -> Self {
        Self { hook }
    }
}

#[async_trait]
impl Stage for AuthorizeStage {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn run(&self, ctx: Context, cancel: &CancellationToken) -> Result<Context> {
        check_cancelled(cancel)?;
        self.hook.authorize(&ctx.request).await?;
        Ok(ctx)
    }
}

/// Stage 3: invoke the Router, attach the ordered candidate list.
pub struct RouteStage {
    router: Arc<Router>,
}

impl RouteStage {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Stage for RouteStage {
    fn name(&self) -> &'static str {
        "route"
    }

    async fn run(&self, mut ctx: Context, cancel: &CancellationToken) -> Result<Context> {
        check_cancelled(cancel)?;
        ctx.candidates = self.router.select_model(&ctx.request).await?;
        Ok(ctx)
    }
}

/// Stage 4: compute the fingerprint and consult the cache. Skipped
/// entirely for streaming requests and for non-cache-eligible options
/// (`spec.md` §4.4 "Streaming" note).
pub struct CacheLookupStage {
    cache: Arc<Cache>,
}

impl CacheLookupStage {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Stage for CacheLookupStage {
    fn name(&self) -> &'static str {
        "cacheLookup"
    }

    async fn run(&self, mut ctx: Context, cancel: &CancellationToken) -> Result<Context> {
        check_cancelled(cancel)?;
        if ctx.request.options.stream || !ctx.request.options.is_cache_eligible() {
            return Ok(ctx);
        }
        let Some(head) = ctx.candidates.first() else {
            return Ok(ctx);
        };

        let key = crate::cache::compute_fingerprint(&head.id, &ctx.request.prompt, &ctx.request.options);
        match self.cache.get_or_lock(&key).await {
            crate::cache::Lookup::Hit(result) => {
                ctx.fingerprint = Some(key);
                ctx.result = Some(result);
            }
            crate::cache::Lookup::Miss(guard) => {
                ctx.fingerprint = Some(key);
                ctx.cache_guard = Some(guard);
            }
        }
        Ok(ctx)
    }
}

/// Stage 5: borrow a handle from the head candidate (loading it via the
/// Engine Selector if not yet resident) and call `generate`/`stream`.
/// On a fallback-eligible error, tries the next candidate, up to
/// `max_fallbacks` additional attempts (`spec.md` §4.4 step 5, §7).
pub struct InvokeStage {
    registry: Arc<Registry>,
    router: Arc<Router>,
    engine: Arc<EngineSelector>,
    max_fallbacks: usize,
}

impl InvokeStage {
    pub fn new(registry: Arc<Registry>, router: Arc<Router>, engine: Arc<EngineSelector>, max_fallbacks: usize) -> Self {
        Self { registry, router, engine, max_fallbacks }
    }

    async fn ensure_loaded(&self, model_id: &str) -> Result<Arc<dyn crate::model::handle::ModelHandle>> {
        match self.registry.handle_for(model_id).await {
            Ok(handle) => Ok(handle),
            Err(_) => {
                let snapshot = self.registry.get(model_id).await?;
                let handle = self.engine.load_model(&snapshot.descriptor).await?;
                self.registry.attach_handle(model_id, handle.clone()).await?;
                self.router.refresh_now().await;
                Ok(handle)
            }
        }
    }
}

#[async_trait]
impl Stage for InvokeStage {
    fn name(&self) -> &'static str {
        "invoke"
    }

    async fn run(&self, mut ctx: Context, cancel: &CancellationToken) -> Result<Context> {
        check_cancelled(cancel)?;
        if ctx.result.is_some() {
            // cacheLookup already produced a hit; nothing to invoke.
            return Ok(ctx);
        }

        if ctx.candidates.is_empty() {
            return Err(RouterError::NoViableModel(ctx.attempts));
        }

        let budget = self.max_fallbacks.min(ctx.candidates.len().saturating_sub(1));
        let tried = ctx.candidates.iter().take(budget + 1).cloned().collect::<Vec<_>>();

        for candidate in &tried {
            check_cancelled(cancel)?;
            let handle = match self.ensure_loaded(&candidate.id).await {
                Ok(h) => h,
                Err(e) => {
                    mark_attempt(&mut ctx.attempts, &candidate.id, e.to_string());
                    if e.is_fallback_eligible() {
                        continue;
                    }
                    return Err(e);
                }
            };

            let metrics = self.registry.metrics_for(&candidate.id).await.ok();
            let breaker = self.router.breaker_for(&candidate.id);
            if let Some(m) = &metrics {
                m.begin_call();
            }

            let outcome = if ctx.request.options.stream {
                handle.stream(&ctx.request.prompt, &ctx.request.options).await.map(|s| (None, Some(s)))
            } else {
                handle.generate(&ctx.request.prompt, &ctx.request.options).await.map(|r| (Some(r), None))
            };

            if let Some(m) = &metrics {
                m.end_call();
            }

            match outcome {
                Ok((result, stream)) => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let Some(m) = &metrics {
                        match &result {
                            Some(r) => m.record_success(r.tokens, r.latency_ms, now_ms),
                            // A stream starting successfully is itself evidence of
                            // health; per-token accounting happens as chunks land,
                            // not here, so this records activity without tokens.
                            None => m.record_success(0, 0, now_ms),
                        }
                    }
                    breaker.record_success().await;
                    ctx.result = result;
                    ctx.stream = stream;
                    return Ok(ctx);
                }
                Err(e) => {
                    mark_attempt(&mut ctx.attempts, &candidate.id, e.to_string());
                    if let Some(m) = &metrics {
                        m.record_error(chrono::Utc::now().timestamp_millis());
                    }
                    if matches!(e, RouterError::TransientBackendError(_) | RouterError::PermanentBackendError(_)) {
                        breaker.record_failure().await;
                    }
                    if matches!(e, RouterError::PermanentBackendError(_)) {
                        mark_model_failed(&self.registry, &candidate.id).await;
                    }
                    if e.is_fallback_eligible() {
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(RouterError::NoViableModel(ctx.attempts))
    }
}

/// Stage 6: store the result under its fingerprint, only for
/// non-streaming, cache-eligible requests that actually missed.
pub struct CacheStoreStage {
    cache: Arc<Cache>,
    default_ttl_ms: u64,
}

impl CacheStoreStage {
    pub fn new(cache: Arc<Cache>, default_ttl_ms: u64) -> Self {
        Self { cache, default_ttl_ms }
    }
}

#[async_trait]
impl Stage for CacheStoreStage {
    fn name(&self) -> &'static str {
        "cacheStore"
    }

    async fn run(&self, mut ctx: Context, cancel: &CancellationToken) -> Result<Context> {
        check_cancelled(cancel)?;
        let Some(guard) = ctx.cache_guard.take() else {
            return Ok(ctx);
        };

        match &ctx.result {
            Some(result) if ctx.request.options.is_cache_eligible() && !ctx.request.options.stream => {
                self.cache.complete(guard, result.clone(), Some(self.default_ttl_ms));
            }
            _ => {
                self.cache.abandon(guard);
            }
        }
        Ok(ctx)
    }
}

/// Stage 7: per-model counters are already updated inside the handle's
/// own `generate`/`stream` implementation; this stage only emits the
/// observability event and, for a cache hit, nothing further (no
/// backend call happened to count).
pub struct MetricsStage {
    registry: Arc<Registry>,
}

impl MetricsStage {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for MetricsStage {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn run(&self, ctx: Context, _cancel: &CancellationToken) -> Result<Context> {
        let model_id = ctx
            .result
            .as_ref()
            .map(|r| r.model_id.clone())
            .or_else(|| ctx.candidates.first().map(|c| c.id.clone()));

        if let Some(id) = &model_id {
            if self.registry.get(id).await.is_err() {
                warn!(model_id = %id, "metrics stage could not find model in registry");
            }
        }
        crate::pipeline::log_outcome(model_id.as_deref().unwrap_or("unknown"), ctx.attempts.len());
        info!(cache_hit = ctx.cache_guard.is_none() && ctx.fingerprint.is_some() && ctx.result.is_some(), "pipeline stage complete");
        Ok(ctx)
    }
}
