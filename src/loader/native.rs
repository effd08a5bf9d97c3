//! Native quantized loader (`spec.md` §4.3 "Native quantized"): accepts
//! a filesystem path, detects a magic signature, opens a context sized
//! by `contextSize`/`threads`/`batchSize`. Actual tensor math is out of
//! scope (Non-goals); preflight and context sizing are real, generation
//! itself delegates to [`crate::loader::mock::deterministic_generation`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, RouterError};
use crate::loader::detect::detect_by_signature;
use crate::loader::mock::{deterministic_chunks, deterministic_generation, spawn_chunk_stream};
use crate::model::descriptor::{ModelDescriptor, ModelFormat};
use crate::model::handle::{require_streaming_capability, ChunkStream, HandleLifecycle, HandleState, ModelHandle};
use crate::model::metrics::{Metrics, MetricsSnapshot};
use crate::request::{GenerationOptions, GenerationResult, Usage};

const GGUF_MAGIC: &[u8] = b"GGUF";

/// Context sized at load time from the descriptor's declared parameters,
/// with threads auto-clamped to `max(1, cpuCount - 1)` per §4.3.
#[derive(Debug, Clone, Copy)]
struct ContextConfig {
    context_size: u32,
    threads: u32,
    batch_size: u32,
}

fn resolve_context(descriptor: &ModelDescriptor) -> ContextConfig {
    let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
    let auto_threads = cpu_count.saturating_sub(1).max(1);
    ContextConfig {
        context_size: descriptor.parameters.context_window.unwrap_or(2048),
        threads: descriptor.parameters.threads.unwrap_or(auto_threads).min(auto_threads.max(1)),
        batch_size: descriptor.parameters.batch_size.unwrap_or(8),
    }
}

pub struct NativeHandle {
    descriptor: ModelDescriptor,
    context: ContextConfig,
    lifecycle: HandleLifecycle,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl ModelHandle for NativeHandle {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult> {
        options.validate().map_err(RouterError::ValidationError)?;
        self.metrics.begin_call();
        let (text, tokens) = deterministic_generation(&self.descriptor.id, prompt, options);
        let tokens = tokens.min(self.context.batch_size * 64);
        let latency_ms = 3 + (self.context.context_size as u64 / self.context.threads.max(1) as u64) % 40;
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

pub struct NativeQuantizedLoader;

impl NativeQuantizedLoader {
    pub fn new() -> Self {
        Self
    }

    /// Preflight: the source path exists and, if it's a `.gguf` file,
    /// carries the expected magic signature.
    fn preflight(&self, descriptor: &ModelDescriptor) -> Result<()> {
        let path = Path::new(&descriptor.source);
        if !path.exists() {
            return Err(RouterError::PermanentBackendError(format!(
                "native model source not found: {}",
                descriptor.source
            )));
        }
        if descriptor.format == ModelFormat::Gguf {
            let header = std::fs::read(path)
                .map_err(|e| RouterError::PermanentBackendError(format!("failed to read {}: {e}", descriptor.source)))?;
            if detect_by_signature(&header[..header.len().min(16)]) != Some(ModelFormat::Gguf) {
                return Err(RouterError::PermanentBackendError(format!(
                    "{} does not start with the GGUF magic signature",
                    descriptor.source
                )));
            }
        }
        Ok(())
    }
}

impl Default for NativeQuantizedLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::loader::Loader for NativeQuantizedLoader {
    fn supports(&self, descriptor: &ModelDescriptor) -> bool {
        matches!(
            descriptor.format,
            ModelFormat::Gguf | ModelFormat::Binary | ModelFormat::BitNet
        )
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        self.preflight(descriptor)?;
        let context = resolve_context(descriptor);
        let lifecycle = HandleLifecycle::new(HandleState::Loading);
        lifecycle.mark_loaded().await;
        Ok(Arc::new(NativeHandle {
            descriptor: descriptor.clone(),
            context,
            lifecycle,
            metrics: Arc::new(Metrics::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use crate::model::descriptor::{CapabilitySet, ModelParameters};
    use tempfile::NamedTempFile;

    fn descriptor(source: String) -> ModelDescriptor {
        ModelDescriptor {
            id: "gguf-1".into(),
            name: "gguf-1".into(),
            format: ModelFormat::Gguf,
            source,
            capabilities: CapabilitySet::new(),
            parameters: ModelParameters::default(),
            provider_config: None,
            quality_score: 0.5,
        }
    }

    #[tokio::test]
    async fn load_fails_when_source_missing() {
        let loader = NativeQuantizedLoader::new();
        let err = loader.load(&descriptor("/nonexistent/path.gguf".into())).await;
        assert!(matches!(err, Err(RouterError::PermanentBackendError(_))));
    }

    #[tokio::test]
    async fn load_fails_without_gguf_magic() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not a gguf file").unwrap();
        let loader = NativeQuantizedLoader::new();
        let err = loader.load(&descriptor(file.path().to_string_lossy().into_owned())).await;
        assert!(matches!(err, Err(RouterError::PermanentBackendError(_))));
    }

    #[tokio::test]
    async fn load_succeeds_with_gguf_magic() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"GGUF0000").unwrap();
        let loader = NativeQuantizedLoader::new();
        let handle = loader
            .load(&descriptor(file.path().to_string_lossy().into_owned()))
            .await
            .unwrap();
        assert_eq!(handle.state().await, HandleState::Loaded);
    }

    #[test]
    fn threads_auto_clamp_never_exceeds_cpu_minus_one() {
        let mut d = descriptor("/tmp/x.gguf".into());
        d.parameters.threads = Some(9_999);
        let ctx = resolve_context(&d);
        let cpu = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
        assert!(ctx.threads <= cpu.saturating_sub(1).max(1));
    }
}
