//! Model Handle — the live counterpart to a descriptor (`spec.md` §3,
//! §4.3). Lifecycle state machine shape grounded in the teacher's
//! `CircuitBreakerState` (`resilience/circuit_breaker.rs`): one small
//! mutable struct behind a single lock, transitions checked and written
//! under that lock so no reader ever observes a torn state.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::RwLock;

use crate::error::{RouterError, Result};
use crate::model::descriptor::ModelDescriptor;
use crate::model::metrics::MetricsSnapshot;
use crate::request::{GenerationOptions, GenerationResult, StreamChunk};

/// A handle is either `Loading`, `Loaded`, `Failed`, or `Unloaded`.
/// Transitions are monotonic within one load attempt; a fresh attempt
/// restarts from `Loading` (`spec.md` §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Loading,
    Loaded,
    Failed,
    Unloaded,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleState::Loading => "loading",
            HandleState::Loaded => "loaded",
            HandleState::Failed => "failed",
            HandleState::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

/// Guards `HandleState` transitions. A fresh attempt (`begin_load`)
/// always restarts from `Loading` regardless of the prior terminal
/// state, matching the spec's "fresh attempt restarts" rule.
#[derive(Debug)]
pub struct HandleLifecycle {
    state: RwLock<HandleState>,
}

impl HandleLifecycle {
    pub fn new(initial: HandleState) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub async fn state(&self) -> HandleState {
        *self.state.read().await
    }

    pub async fn begin_load(&self) {
        *self.state.write().await = HandleState::Loading;
    }

    pub async fn mark_loaded(&self) {
        *self.state.write().await = HandleState::Loaded;
    }

    pub async fn mark_failed(&self) {
        *self.state.write().await = HandleState::Failed;
    }

    pub async fn mark_unloaded(&self) {
        *self.state.write().await = HandleState::Unloaded;
    }

    pub async fn is_loaded(&self) -> bool {
        self.state().await == HandleState::Loaded
    }
}

/// A finite, cancellable lazy sequence of chunks. Dropping the stream
/// before it's exhausted must release all per-request resources
/// (`spec.md` §4.3 scoped-acquisition requirement) — concrete
/// implementations achieve this by holding an RAII guard inside the
/// stream's state that releases a handle slot / semaphore permit on drop.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Live, invocable inference object created by a [`crate::loader::Loader`].
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Synchronous completion. Honors every option in `spec.md` §3 and
    /// updates metrics atomically on return (success or failure).
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult>;

    /// Produces a finite, cancellable sequence of chunks. Legal only if
    /// `streaming` is in the descriptor's capabilities; otherwise fails
    /// with `CapabilityUnavailable` at stream-creation time, before any
    /// backend resources are acquired.
    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> Result<ChunkStream>;

    /// Descriptor snapshot plus current metrics.
    async fn info(&self) -> (ModelDescriptor, MetricsSnapshot);

    /// Current lifecycle state.
    async fn state(&self) -> HandleState;

    /// Releases all backend resources (native contexts, sockets, file
    /// handles). Safe to call on any state; idempotent. Called by the
    /// owning [`crate::loader::Loader`]'s `unload` and by the registry
    /// on eviction/unregister.
    async fn unload(&self) -> Result<()>;
}

/// Convenience used by loaders: fail fast if streaming was requested but
/// the descriptor doesn't advertise the capability.
pub fn require_streaming_capability(descriptor: &ModelDescriptor) -> Result<()> {
    use crate::model::descriptor::Capability;
    if descriptor.capabilities.contains(Capability::Streaming) {
        Ok(())
    } else {
        Err(RouterError::CapabilityUnavailable(format!(
            "model {} does not advertise the streaming capability",
            descriptor.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_load_attempt_restarts_from_loading() {
        let lifecycle = HandleLifecycle::new(HandleState::Failed);
        assert_eq!(lifecycle.state().await, HandleState::Failed);
        lifecycle.begin_load().await;
        assert_eq!(lifecycle.state().await, HandleState::Loading);
        lifecycle.mark_loaded().await;
        assert!(lifecycle.is_loaded().await);
    }

    #[test]
    fn streaming_requirement_rejects_missing_capability() {
        use crate::model::descriptor::{CapabilitySet, ModelFormat};
        let descriptor = ModelDescriptor {
            id: "m1".into(),
            name: "m1".into(),
            format: ModelFormat::Mock,
            source: "mock://m1".into(),
            capabilities: CapabilitySet::new(),
            parameters: Default::default(),
            provider_config: None,
            quality_score: 0.5,
        };
        let err = require_streaming_capability(&descriptor).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CapabilityUnavailable);
    }
}
