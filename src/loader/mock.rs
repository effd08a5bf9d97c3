//! Mock loader/handle: deterministic backend used directly for
//! `ModelFormat::Mock` and shared (via [`deterministic_generation`]) by
//! every other loader, since actual tensor math is out of scope
//! (`spec.md` Non-goals). Output is a reproducible function of the
//! prompt and options, which makes routing/pipeline tests exact rather
//! than approximate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Result, RouterError};
use crate::loader::Loader;
use crate::model::descriptor::ModelDescriptor;
use crate::model::handle::{require_streaming_capability, ChunkStream, HandleLifecycle, HandleState, ModelHandle};
use crate::model::metrics::Metrics;
use crate::request::{GenerationOptions, GenerationResult, StreamChunk, Usage};

/// Deterministic "generation": token count is derived from prompt length
/// and `max_tokens`, text is a reproducible transform of the prompt.
/// Shared by every format's handle so loaders differ only in their
/// preflight/contract, not in what they "generate".
pub fn deterministic_generation(model_id: &str, prompt: &str, options: &GenerationOptions) -> (String, u32) {
    let target_tokens = options.max_tokens.min((prompt.split_whitespace().count() as u32 + 8).max(1));
    let text = format!("[{model_id}] {}", prompt.chars().rev().collect::<String>());
    (text, target_tokens)
}

pub fn deterministic_chunks(text: &str, count: u32) -> Vec<String> {
    if count == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    let chunk_len = (chars.len() as u32).div_ceil(count).max(1) as usize;
    chars
        .chunks(chunk_len)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

/// Spawns the task that actually delivers `pieces` over a channel and
/// returns the resulting [`ChunkStream`]. Shared by every loader's
/// `stream()` so none of them has to hand-roll the delivered-chunk
/// bookkeeping: `delivered` only advances on a chunk that was actually
/// sent, so if the consumer drops its receiver early (abandons the
/// stream), the loop's `tx.send(..).await.is_err()` breaks out before
/// that chunk counts, and `record_success` reports exactly how many
/// chunks reached the consumer rather than the full token count
/// (`spec.md` §8 "Streaming consumer abandons after k chunks ... metrics
/// include partial token count").
pub fn spawn_chunk_stream(metrics: Arc<Metrics>, pieces: Vec<String>, per_chunk_delay: Duration) -> ChunkStream {
    spawn_chunk_stream_with_guard(metrics, pieces, per_chunk_delay, ())
}

/// Same as [`spawn_chunk_stream`] but keeps `guard` alive for the whole
/// delivery task — used by loaders that must hold a resource (e.g. a
/// rate-limiter permit) for as long as the backend call is actually in
/// flight, not just until `stream()` returns.
pub fn spawn_chunk_stream_with_guard<G: Send + 'static>(
    metrics: Arc<Metrics>,
    pieces: Vec<String>,
    per_chunk_delay: Duration,
    guard: G,
) -> ChunkStream {
    let total = pieces.len() as u32;
    let (tx, rx) = mpsc::channel(pieces.len().max(1));
    tokio::spawn(async move {
        let _guard = guard;
        let mut delivered: u32 = 0;
        for (i, piece) in pieces.into_iter().enumerate() {
            if !per_chunk_delay.is_zero() {
                tokio::time::sleep(per_chunk_delay).await;
            }
            let done = i as u32 + 1 == total;
            let usage = done.then_some(Usage {
                prompt_tokens: 0,
                completion_tokens: total,
                total_tokens: total,
            });
            if tx.send(Ok(StreamChunk { delta: piece, done, usage })).await.is_err() {
                break;
            }
            delivered += 1;
        }
        metrics.record_success(delivered, 0, chrono::Utc::now().timestamp_millis());
        metrics.end_call();
    });
    Box::pin(ReceiverStream::new(rx))
}

pub struct MockHandle {
    descriptor: ModelDescriptor,
    lifecycle: HandleLifecycle,
    metrics: Arc<Metrics>,
}

impl MockHandle {
    pub fn new(descriptor: ModelDescriptor) -> Self {
        let lifecycle = HandleLifecycle::new(HandleState::Loaded);
        Self {
            descriptor,
            lifecycle,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

#[async_trait]
impl ModelHandle for MockHandle {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult> {
        options.validate().map_err(RouterError::ValidationError)?;
        self.metrics.begin_call();
        let (text, tokens) = deterministic_generation(&self.descriptor.id, prompt, options);
        let latency_ms = 5 + (prompt.len() as u64 % 20);
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.metrics.record_success(tokens, latency_ms, now_ms);
        self.metrics.end_call();

        Ok(GenerationResult {
            text,
            tokens,
            latency_ms,
            model_id: self.descriptor.id.clone(),
            usage: Usage {
                prompt_tokens: prompt.split_whitespace().count() as u32,
                completion_tokens: tokens,
                total_tokens: prompt.split_whitespace().count() as u32 + tokens,
            },
            metadata: Default::default(),
        })
    }

    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> Result<ChunkStream> {
        require_streaming_capability(&self.descriptor)?;
        options.validate().map_err(RouterError::ValidationError)?;

        let (text, tokens) = deterministic_generation(&self.descriptor.id, prompt, options);
        let pieces = deterministic_chunks(&text, tokens.max(1));
        let metrics = self.metrics.clone();
        metrics.begin_call();

        Ok(spawn_chunk_stream(metrics, pieces, Duration::from_millis(1)))
    }

    async fn info(&self) -> (ModelDescriptor, crate::model::metrics::MetricsSnapshot) {
        (self.descriptor.clone(), self.metrics.snapshot())
    }

    async fn state(&self) -> HandleState {
        self.lifecycle.state().await
    }

    async fn unload(&self) -> Result<()> {
        self.lifecycle.mark_unloaded().await;
        Ok(())
    }
}

pub struct MockLoader;

impl MockLoader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Loader for MockLoader {
    fn supports(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor.format == crate::model::descriptor::ModelFormat::Mock
            || descriptor.format == crate::model::descriptor::ModelFormat::Simple
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        Ok(Arc::new(MockHandle::new(descriptor.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::{CapabilitySet, Capability, ModelFormat, ModelParameters};
    use futures::StreamExt;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            id: "mock-1".into(),
            name: "mock-1".into(),
            format: ModelFormat::Mock,
            source: "mock://mock-1".into(),
            capabilities: CapabilitySet::from_iter_caps([Capability::Chat, Capability::Streaming]),
            parameters: ModelParameters::default(),
            provider_config: None,
            quality_score: 0.5,
        }
    }

    #[tokio::test]
    async fn generate_is_deterministic_for_same_input() {
        let handle = MockHandle::new(descriptor());
        let opts = GenerationOptions::default();
        let a = handle.generate("hello world", &opts).await.unwrap();
        let b = handle.generate("hello world", &opts).await.unwrap();
        assert_eq!(a.text, b.text);
        assert_eq!(a.tokens, b.tokens);
    }

    #[tokio::test]
    async fn stream_without_streaming_capability_fails() {
        let mut d = descriptor();
        d.capabilities = CapabilitySet::from_iter_caps([Capability::Chat]);
        let handle = MockHandle::new(d);
        let err = handle.stream("hi", &GenerationOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CapabilityUnavailable);
    }

    #[tokio::test]
    async fn stream_delivers_chunks_in_order_ending_with_done() {
        let handle = MockHandle::new(descriptor());
        let mut stream = handle.stream("hello there friend", &GenerationOptions::default()).await.unwrap();
        let mut saw_done = false;
        let mut count = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            count += 1;
            if chunk.done {
                saw_done = true;
                assert!(chunk.usage.is_some());
            }
        }
        assert!(saw_done);
        assert!(count >= 1);
    }

    #[tokio::test]
    async fn fully_drained_stream_records_the_full_chunk_count_in_metrics() {
        let handle = MockHandle::new(descriptor());
        let mut options = GenerationOptions::default();
        options.max_tokens = 20;
        let mut stream = handle.stream("hello there friend, how are you today", &options).await.unwrap();
        let mut delivered = 0u32;
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
            delivered += 1;
        }

        // Give the producer task a moment to call `record_success` after
        // sending the final chunk.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, snapshot) = handle.info().await;
        assert_eq!(snapshot.total_tokens, delivered as u64);
    }

    #[tokio::test]
    async fn abandoning_a_stream_early_records_only_the_delivered_chunks() {
        let handle = MockHandle::new(descriptor());
        let mut options = GenerationOptions::default();
        options.max_tokens = 20;
        let stream = handle.stream("hello there friend, how are you today", &options).await.unwrap();
        {
            let mut stream = stream;
            assert!(stream.next().await.is_some());
            assert!(stream.next().await.is_some());
            // Dropping the stream here closes the receiver, so the
            // producer's next `tx.send` fails and it stops early.
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, snapshot) = handle.info().await;
        assert!(
            snapshot.total_tokens >= 2 && snapshot.total_tokens < 20,
            "expected a partial count, got {}",
            snapshot.total_tokens
        );
    }
}
