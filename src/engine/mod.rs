//! Engine Selector (`spec.md` §4.5): chooses the execution substrate a
//! loader runs on. Closed set, preference-ordered the same way
//! `LoaderSet` picks the first supporting loader — grounded in the
//! teacher's `AdapterManager` fan-out (`adapters/mod.rs`).

pub mod substrate;

pub use substrate::{Substrate, SubstrateKind};

use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{Result, RouterError};
use crate::model::descriptor::ModelDescriptor;
use crate::model::handle::ModelHandle;

/// `native > worker > wasm > edge > remote`, per `spec.md` §4.5 step 2.
const PREFERENCE_ORDER: [SubstrateKind; 5] = [
    SubstrateKind::Native,
    SubstrateKind::Worker,
    SubstrateKind::Wasm,
    SubstrateKind::Edge,
    SubstrateKind::Remote,
];

/// Holds one instance per substrate kind and picks the first, in
/// preference order, that both reports itself supported on this host
/// and accepts the descriptor.
pub struct EngineSelector {
    substrates: Vec<Arc<dyn Substrate>>,
}

impl EngineSelector {
    pub fn new(substrates: Vec<Arc<dyn Substrate>>) -> Self {
        Self { substrates }
    }

    /// The closed set of five substrates named in `spec.md` §4.5.
    pub fn default_set() -> Self {
        use substrate::{EdgeSubstrate, NativeSubstrate, RemoteSubstrate, WasmSubstrate, WorkerSubstrate};
        Self::new(vec![
            Arc::new(NativeSubstrate::new()),
            Arc::new(WorkerSubstrate::new()),
            Arc::new(WasmSubstrate::new()),
            Arc::new(EdgeSubstrate::new()),
            Arc::new(RemoteSubstrate::new()),
        ])
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Substrate>> {
        PREFERENCE_ORDER
            .iter()
            .filter_map(move |kind| self.substrates.iter().find(|s| s.kind() == *kind))
    }

    /// Picks and initializes the first substrate, in preference order,
    /// that is supported on this host and willing to bind to `descriptor`.
    #[instrument(skip(self, descriptor), fields(id = %descriptor.id))]
    pub async fn select(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn Substrate>> {
        for substrate in self.ordered() {
            if !substrate.is_supported() {
                continue;
            }
            if !substrate.initialize().await? {
                continue;
            }
            if substrate.can_bind(descriptor) {
                info!(substrate = %substrate.kind(), id = %descriptor.id, "substrate selected");
                return Ok(substrate.clone());
            }
        }
        Err(RouterError::ValidationError(format!(
            "no substrate in {native, worker, wasm, edge, remote} supports model {}",
            descriptor.id
        )))
    }

    pub async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        let substrate = self.select(descriptor).await?;
        substrate.load_model(descriptor).await
    }

    /// Releases every substrate's resources. Safe to call repeatedly.
    pub async fn cleanup(&self) -> Result<()> {
        for substrate in &self.substrates {
            substrate.cleanup().await?;
        }
        Ok(())
    }
}
