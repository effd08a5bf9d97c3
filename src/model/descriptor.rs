//! Model Descriptor & Capability — immutable configuration naming one
//! model and what it can do. Shape grounded in the teacher's
//! `adapters/registry.rs::ModelMetadata` (provider, capabilities,
//! pricing, performance), retyped to the closed sets `spec.md` §3 names.

use std::collections::BTreeSet;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

/// Closed set of model source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFormat {
    Gguf,
    Onnx,
    SafeTensors,
    PyTorch,
    Binary,
    Api,
    Mock,
    Simple,
    BitNet,
    Hf,
    Tfjs,
}

/// Closed set of capability tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Streaming,
    Chat,
    Embedding,
    Quantization,
    Gpu,
    FunctionCalling,
}

/// A set of capability tags. Accepts either a JSON array
/// (`["chat", "streaming"]`) or a JSON object whose keys are the tags
/// (`{"chat": true, "streaming": true}`) on the wire — both normalize to
/// the same `BTreeSet`, per `spec.md` §4.1's indexing requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn from_iter_caps(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn is_superset(&self, required: &CapabilitySet) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn insert(&mut self, cap: Capability) -> bool {
        self.0.insert(cap)
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CapSetVisitor;

        impl<'de> Visitor<'de> for CapSetVisitor {
            type Value = CapabilitySet;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a list of capability tags or a map keyed by capability tag")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut set = BTreeSet::new();
                while let Some(cap) = seq.next_element::<Capability>()? {
                    set.insert(cap);
                }
                Ok(CapabilitySet(set))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut set = BTreeSet::new();
                while let Some((key, _value)) = map.next_entry::<Capability, de::IgnoredAny>()? {
                    set.insert(key);
                }
                Ok(CapabilitySet(set))
            }
        }

        deserializer.deserialize_any(CapSetVisitor)
    }
}

/// Optional tunables. Fields are options so a descriptor can omit what
/// doesn't apply to its format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParameters {
    pub context_window: Option<u32>,
    pub quantization_level: Option<String>,
    pub threads: Option<u32>,
    pub batch_size: Option<u32>,
    pub max_tokens: Option<u32>,
}

/// Auth kind for an API-backed provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    Bearer,
    ApiKey,
    Basic,
    None,
}

/// Configuration for API-backed models (cloud providers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub auth_kind: AuthKind,
    pub allowed_model_ids: Vec<String>,
    pub cost_per_million_tokens: f64,
}

/// Immutable configuration identifying one model and what it can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub format: ModelFormat,
    pub source: String,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub parameters: ModelParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<ProviderConfig>,
    /// Declared quality prior in `[0, 1]` used by `quality-first` and
    /// `balanced` scoring until enough live traffic accumulates to trust
    /// observed metrics alone. Defaults to a neutral 0.5.
    #[serde(default = "default_quality_score")]
    pub quality_score: f64,
}

fn default_quality_score() -> f64 {
    0.5
}

impl ModelDescriptor {
    /// Validates that the mandatory string fields are present per
    /// `spec.md` §4.1's `register` preconditions.
    pub fn validate_non_empty(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id must not be empty".into());
        }
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.source.trim().is_empty() {
            return Err("source must not be empty".into());
        }
        Ok(())
    }

    /// Cost per million output tokens; models without a provider config
    /// (local/self-hosted formats) cost nothing to run.
    pub fn cost_per_million_tokens(&self) -> f64 {
        self.provider_config
            .as_ref()
            .map(|p| p.cost_per_million_tokens)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            name: "Mock Model".to_string(),
            format: ModelFormat::Mock,
            source: "mock://m".to_string(),
            capabilities: CapabilitySet::from_iter_caps([Capability::Chat]),
            parameters: ModelParameters::default(),
            provider_config: None,
            quality_score: 0.5,
        }
    }

    #[test]
    fn capability_set_parses_from_array() {
        let json = r#"["chat", "streaming"]"#;
        let caps: CapabilitySet = serde_json::from_str(json).unwrap();
        assert!(caps.contains(Capability::Chat));
        assert!(caps.contains(Capability::Streaming));
        assert!(!caps.contains(Capability::Gpu));
    }

    #[test]
    fn capability_set_parses_from_map_keys() {
        let json = r#"{"chat": true, "gpu": false}"#;
        let caps: CapabilitySet = serde_json::from_str(json).unwrap();
        assert!(caps.contains(Capability::Chat));
        assert!(caps.contains(Capability::Gpu), "keys are the effective set regardless of boolean value");
    }

    #[test]
    fn superset_check() {
        let full = CapabilitySet::from_iter_caps([Capability::Chat, Capability::Streaming]);
        let required = CapabilitySet::from_iter_caps([Capability::Chat]);
        assert!(full.is_superset(&required));
        let required_gpu = CapabilitySet::from_iter_caps([Capability::Gpu]);
        assert!(!full.is_superset(&required_gpu));
    }

    #[test]
    fn validate_rejects_empty_id() {
        let mut d = descriptor("");
        assert!(d.validate_non_empty().is_err());
        d.id = "ok".into();
        assert!(d.validate_non_empty().is_ok());
    }
}
