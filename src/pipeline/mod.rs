//! Execution Pipeline (`spec.md` §4.4): an ordered list of stages, each
//! a pure function `(Context) -> Context`, taking one request from
//! validation through to a result. Cancellation-aware; streaming and
//! non-streaming requests share the same stage list, branching inside
//! stages 4-6 rather than running a separate pipeline.

pub mod stages;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cache::Cache;
use crate::engine::EngineSelector;
use crate::error::{CandidateAttempt, Result, RouterError};
use crate::model::handle::ChunkStream;
use crate::registry::{EntryStatus, Registry};
use crate::request::{GenerationResult, Request};
use crate::router::{Candidate, Router};

pub use stages::{AuthorizeHook, NoopAuthorize};

/// How many additional candidates `invoke` tries after the first one
/// fails with a fallback-eligible error (`spec.md` §4.4 step 5).
pub const DEFAULT_MAX_FALLBACKS: usize = 2;

/// Mutable state threaded through the stage list. `result` is set by
/// `invoke` for a batched call; `stream` is set instead when
/// `request.options.stream` is true. Exactly one of the two is present
/// once `invoke` has run successfully.
pub struct Context {
    pub request: Request,
    pub candidates: Vec<Candidate>,
    pub fingerprint: Option<String>,
    pub cache_guard: Option<crate::cache::InFlightGuard>,
    pub attempts: Vec<CandidateAttempt>,
    pub result: Option<GenerationResult>,
    pub stream: Option<ChunkStream>,
}

impl Context {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request,
            candidates: Vec::new(),
            fingerprint: None,
            cache_guard: None,
            attempts: Vec::new(),
            result: None,
            stream: None,
        }
    }
}

/// One step of the pipeline. `run` must check `cancel` at its own
/// suspension points; the pipeline itself only checks between stages.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, ctx: Context, cancel: &CancellationToken) -> Result<Context>;
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RouterError::Cancelled("request cancelled before pipeline could continue".into()))
    } else {
        Ok(())
    }
}

/// The default seven-stage pipeline (`spec.md` §4.4).
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Wires the default stage list against live services. `authorize`
    /// lets callers plug in a tenant/quota hook; pass
    /// `Arc::new(NoopAuthorize)` when there is none.
    pub fn default_stages(
        registry: Arc<Registry>,
        router: Arc<Router>,
        engine: Arc<EngineSelector>,
        cache: Arc<Cache>,
        authorize: Arc<dyn AuthorizeHook>,
        max_fallbacks: usize,
        cache_ttl_ms: u64,
    ) -> Self {
        Self::new(vec![
            Arc::new(stages::ValidateStage),
            Arc::new(stages::AuthorizeStage::new(authorize)),
            Arc::new(stages::RouteStage::new(router.clone())),
            Arc::new(stages::CacheLookupStage::new(cache.clone())),
            Arc::new(stages::InvokeStage::new(registry.clone(), router, engine, max_fallbacks)),
            Arc::new(stages::CacheStoreStage::new(cache, cache_ttl_ms)),
            Arc::new(stages::MetricsStage::new(registry)),
        ])
    }

    /// Runs every stage in order, short-circuiting on the first error
    /// (except that `cacheLookup` itself may short-circuit the
    /// remaining stages by jumping straight to a hit — see
    /// [`stages::CacheLookupStage`]).
    #[instrument(skip(self, request, cancel), fields(stream = request.options.stream))]
    pub async fn execute(&self, request: Request, cancel: CancellationToken) -> Result<PipelineOutcome> {
        let mut ctx = Context::new(request);
        for stage in &self.stages {
            check_cancelled(&cancel)?;
            ctx = stage.run(ctx, &cancel).await?;
            if ctx.result.is_some() || ctx.stream.is_some() {
                // cacheLookup hit: skip straight to metrics, matching
                // spec.md's "short-circuit to stage 7".
                if stage.name() == "cacheLookup" {
                    let metrics_stage = self.stages.last().expect("pipeline always has a metrics stage");
                    ctx = metrics_stage.run(ctx, &cancel).await?;
                    break;
                }
            }
        }

        match (ctx.result, ctx.stream) {
            (Some(result), None) => Ok(PipelineOutcome::Result(result)),
            (None, Some(stream)) => Ok(PipelineOutcome::Stream(stream)),
            (None, None) => Err(RouterError::InternalError("pipeline completed without a result or stream".into())),
            (Some(_), Some(_)) => Err(RouterError::InternalError("pipeline produced both a result and a stream".into())),
        }
    }
}

pub enum PipelineOutcome {
    Result(GenerationResult),
    Stream(ChunkStream),
}

/// Best-effort teardown budget for an unresponsive backend during
/// cancellation (`spec.md` §5, "forceKillMs default 5s"). Not yet wired
/// to a real force-kill path (loaders don't expose one uniformly), kept
/// here so the pipeline and loaders agree on the same constant once one
/// does.
pub const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn mark_attempt(attempts: &mut Vec<CandidateAttempt>, model_id: &str, cause: impl Into<String>) {
    attempts.push(CandidateAttempt {
        model_id: model_id.to_string(),
        cause: cause.into(),
    });
}

pub(crate) async fn mark_model_failed(registry: &Registry, model_id: &str) {
    if let Err(e) = registry.mark_status(model_id, EntryStatus::Error).await {
        warn!(model_id, error = %e, "failed to mark model as errored after permanent backend failure");
    }
}

pub(crate) fn log_outcome(model_id: &str, attempts: usize) {
    info!(model_id, attempts, "request served");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSelector;
    use crate::model::descriptor::{CapabilitySet, ModelDescriptor, ModelFormat, ModelParameters};
    use crate::router::Strategy;
    use tempfile::tempdir;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            format: ModelFormat::Mock,
            source: format!("mock://{id}"),
            capabilities: CapabilitySet::from_iter_caps([crate::model::descriptor::Capability::Chat]),
            parameters: ModelParameters::default(),
            provider_config: None,
            quality_score: 0.8,
        }
    }

    async fn build_pipeline() -> (Pipeline, Arc<Registry>, tokio::task::JoinHandle<()>) {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(10, dir.path().join("registry.json")));
        registry.register(descriptor("m1")).await.unwrap();

        let engine = Arc::new(EngineSelector::default_set());
        let handle = engine.load_model(&descriptor("m1")).await.unwrap();
        registry.attach_handle("m1", handle).await.unwrap();

        let (router, join) = Router::spawn(registry.clone(), Strategy::Balanced, Duration::from_secs(30));
        router.refresh_now().await;

        let cache = Arc::new(Cache::new(60_000));
        let pipeline = Pipeline::default_stages(
            registry.clone(),
            router,
            engine,
            cache,
            Arc::new(NoopAuthorize),
            DEFAULT_MAX_FALLBACKS,
            60_000,
        );
        (pipeline, registry, join)
    }

    #[tokio::test]
    async fn generate_happy_path_returns_a_result() {
        let (pipeline, _registry, join) = build_pipeline().await;
        let request = Request::new("hello there");
        let outcome = pipeline.execute(request, CancellationToken::new()).await.unwrap();
        match outcome {
            PipelineOutcome::Result(r) => assert_eq!(r.model_id, "m1"),
            PipelineOutcome::Stream(_) => panic!("expected a batched result"),
        }
        join.abort();
    }

    #[tokio::test]
    async fn streaming_request_returns_a_stream() {
        let (pipeline, _registry, join) = build_pipeline().await;
        let mut request = Request::new("hello there");
        request.options.stream = true;
        let outcome = pipeline.execute(request, CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Stream(_)));
        join.abort();
    }

    #[tokio::test]
    async fn no_registered_models_yields_no_viable_model() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::new(10, dir.path().join("registry.json")));
        let engine = Arc::new(EngineSelector::default_set());
        let (router, join) = Router::spawn(registry.clone(), Strategy::Balanced, Duration::from_secs(30));
        let cache = Arc::new(Cache::new(60_000));
        let pipeline = Pipeline::default_stages(
            registry,
            router,
            engine,
            cache,
            Arc::new(NoopAuthorize),
            DEFAULT_MAX_FALLBACKS,
            60_000,
        );

        let request = Request::new("hello");
        let err = pipeline.execute(request, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RouterError::NoViableModel(_)));
        join.abort();
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_any_stage() {
        let (pipeline, _registry, join) = build_pipeline().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline.execute(Request::new("hi"), cancel).await.unwrap_err();
        assert!(matches!(err, RouterError::Cancelled(_)));
        join.abort();
    }

    #[tokio::test]
    async fn repeated_request_is_served_from_cache_on_second_call() {
        let (pipeline, _registry, join) = build_pipeline().await;
        let mut request = Request::new("deterministic prompt");
        request.options.temperature = 0.0;

        let first = pipeline.execute(request.clone(), CancellationToken::new()).await.unwrap();
        let first_text = match first {
            PipelineOutcome::Result(r) => r.text,
            PipelineOutcome::Stream(_) => panic!("expected result"),
        };

        let second = pipeline.execute(request, CancellationToken::new()).await.unwrap();
        let second_text = match second {
            PipelineOutcome::Result(r) => r.text,
            PipelineOutcome::Stream(_) => panic!("expected result"),
        };
        assert_eq!(first_text, second_text);
        join.abort();
    }
}
