//! Model Descriptor & Capability, Model Handle, and Metrics
//! (`spec.md` §3, §4.3).

pub mod descriptor;
pub mod handle;
pub mod metrics;

pub use descriptor::{AuthKind, Capability, CapabilitySet, ModelDescriptor, ModelFormat, ModelParameters, ProviderConfig};
pub use handle::{ChunkStream, HandleLifecycle, HandleState, ModelHandle};
pub use metrics::{Metrics, MetricsSnapshot};
