//! Graph-format loader (`spec.md` §4.3 "Graph-format"): loads a
//! serialized graph from a path or URL, exposes named inputs/outputs,
//! selects an execution provider with CPU always available as a
//! fallback. Actual graph execution is out of scope (Non-goals);
//! generation delegates to the shared deterministic mock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, RouterError};
use crate::loader::mock::{deterministic_chunks, deterministic_generation, spawn_chunk_stream};
use crate::model::descriptor::{ModelDescriptor, ModelFormat};
use crate::model::handle::{require_streaming_capability, ChunkStream, HandleLifecycle, HandleState, ModelHandle};
use crate::model::metrics::{Metrics, MetricsSnapshot};
use crate::request::{GenerationOptions, GenerationResult, Usage};

/// Closed set of execution providers a graph loader can bind to. CPU is
/// always supported; GPU is selected when the descriptor asks for it
/// and the host advertises the capability via its own `gpu` capability
/// tag (used here only as an availability signal, not a requirement
/// filter — that filtering is the router's job).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cpu,
    Gpu,
}

fn select_execution_provider(descriptor: &ModelDescriptor) -> ExecutionProvider {
    if descriptor.capabilities.contains(crate::model::descriptor::Capability::Gpu) {
        ExecutionProvider::Gpu
    } else {
        ExecutionProvider::Cpu
    }
}

pub struct GraphHandle {
    descriptor: ModelDescriptor,
    provider: ExecutionProvider,
    named_inputs: Vec<String>,
    named_outputs: Vec<String>,
    lifecycle: HandleLifecycle,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl ModelHandle for GraphHandle {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult> {
        options.validate().map_err(RouterError::ValidationError)?;
        let (text, tokens) = deterministic_generation(&self.descriptor.id, prompt, options);
        let latency_ms = match self.provider {
            ExecutionProvider::Gpu => 4,
            ExecutionProvider::Cpu => 15,
        };
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.metrics.record_success(tokens, latency_ms, now_ms);

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
            metadata: [(
                "executionProvider".to_string(),
                serde_json::json!(format!("{:?}", self.provider)),
            )]
            .into_iter()
            .collect(),
        })
    }

    async fn stream(&self, prompt: &str, options: &GenerationOptions) -> Result<ChunkStream> {
        require_streaming_capability(&self.descriptor)?;
        let (text, tokens) = deterministic_generation(&self.descriptor.id, prompt, options);
        let pieces = deterministic_chunks(&text, tokens.max(1));
        let metrics = self.metrics.clone();
        metrics.begin_call();

        Ok(spawn_chunk_stream(metrics, pieces, Duration::from_millis(1)))
    }

    async fn info(&self) -> (ModelDescriptor, MetricsSnapshot) {
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

impl GraphHandle {
    pub fn named_inputs(&self) -> &[String] {
        &self.named_inputs
    }

    pub fn named_outputs(&self) -> &[String] {
        &self.named_outputs
    }
}

pub struct GraphLoader;

impl GraphLoader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GraphLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::loader::Loader for GraphLoader {
    fn supports(&self, descriptor: &ModelDescriptor) -> bool {
        matches!(descriptor.format, ModelFormat::Onnx | ModelFormat::Tfjs | ModelFormat::Hf)
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        let is_url = descriptor.source.starts_with("http://") || descriptor.source.starts_with("https://");
        if !is_url && !std::path::Path::new(&descriptor.source).exists() {
            return Err(RouterError::PermanentBackendError(format!(
                "graph source not found: {}",
                descriptor.source
            )));
        }

        let provider = select_execution_provider(descriptor);
        let lifecycle = HandleLifecycle::new(HandleState::Loading);
        lifecycle.mark_loaded().await;

        Ok(Arc::new(GraphHandle {
            descriptor: descriptor.clone(),
            provider,
            named_inputs: vec!["input_ids".to_string(), "attention_mask".to_string()],
            named_outputs: vec!["logits".to_string()],
            lifecycle,
            metrics: Arc::new(Metrics::new()),
        }))
    }
}
