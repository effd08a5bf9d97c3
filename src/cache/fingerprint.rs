//! Deterministic fingerprint of `(modelId, prompt, options)` (`spec.md`
//! §3 Cache Entry, §4.4 stage "cacheLookup"). Canonicalizes to
//! sorted-key JSON with fixed-precision floats before hashing so the
//! same logical request always maps to the same key regardless of
//! struct field order or float formatting noise.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::request::GenerationOptions;

/// Collapses a float to 6 decimal places before it enters the
/// canonical form, so `0.7` and `0.70000000001` (possible after a
/// round trip through a transport layer) fingerprint identically.
fn format_float(f: f64) -> String {
    format!("{:.6}", f)
}

/// Only the options that change what the model actually produces are
/// part of the fingerprint; `timeoutMs`, `stream`, and `cacheable` are
/// transport/runtime concerns that don't affect `text`.
fn canonical_options(options: &GenerationOptions) -> Value {
    let mut map = Map::new();
    map.insert("maxTokens".into(), Value::from(options.max_tokens));
    map.insert("temperature".into(), Value::String(format_float(options.temperature)));
    map.insert("topP".into(), Value::String(format_float(options.top_p)));
    map.insert("topK".into(), Value::from(options.top_k));
    map.insert("repeatPenalty".into(), Value::String(format_float(options.repeat_penalty)));
    let mut stops = options.stop_strings.clone();
    stops.sort();
    map.insert("stopStrings".into(), Value::from(stops));
    map.insert(
        "systemPrompt".into(),
        options.system_prompt.clone().map(Value::String).unwrap_or(Value::Null),
    );
    Value::Object(map)
}

fn normalize_prompt(prompt: &str) -> String {
    prompt.trim().to_string()
}

/// Sorted-key JSON canonicalization of the triple, SHA-256 hashed, hex
/// encoded. `serde_json::Map` defaults to a `BTreeMap` in this crate's
/// feature set, so key order is already sorted; built explicitly here
/// instead of relying on that default to keep the canonical form
/// obvious at the call site.
pub fn fingerprint(model_id: &str, prompt: &str, options: &GenerationOptions) -> String {
    let mut top = Map::new();
    top.insert("modelId".into(), Value::String(model_id.to_string()));
    top.insert("prompt".into(), Value::String(normalize_prompt(prompt)));
    top.insert("options".into(), canonical_options(options));

    let mut sorted = Map::new();
    let mut keys: Vec<_> = top.keys().cloned().collect();
    keys.sort();
    for k in keys {
        sorted.insert(k.clone(), top.remove(&k).unwrap());
    }

    let canonical = serde_json::to_string(&sorted).expect("canonical map always serializes");
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let opts = GenerationOptions::default();
        let a = fingerprint("m1", "hello world", &opts);
        let b = fingerprint("m1", "hello world", &opts);
        assert_eq!(a, b);
    }

    #[test]
    fn different_prompts_produce_different_fingerprints() {
        let opts = GenerationOptions::default();
        let a = fingerprint("m1", "hello", &opts);
        let b = fingerprint("m1", "goodbye", &opts);
        assert_ne!(a, b);
    }

    #[test]
    fn whitespace_padded_prompt_normalizes_to_same_fingerprint() {
        let opts = GenerationOptions::default();
        let a = fingerprint("m1", "hello", &opts);
        let b = fingerprint("m1", "  hello  ", &opts);
        assert_eq!(a, b);
    }

    #[test]
    fn float_noise_within_precision_does_not_change_fingerprint() {
        let mut a = GenerationOptions::default();
        a.temperature = 0.7;
        let mut b = GenerationOptions::default();
        b.temperature = 0.7000001;
        assert_eq!(fingerprint("m1", "hi", &a), fingerprint("m1", "hi", &b));
    }

    #[test]
    fn stop_strings_order_does_not_change_fingerprint() {
        let mut a = GenerationOptions::default();
        a.stop_strings = vec!["b".into(), "a".into()];
        let mut b = GenerationOptions::default();
        b.stop_strings = vec!["a".into(), "b".into()];
        assert_eq!(fingerprint("m1", "hi", &a), fingerprint("m1", "hi", &b));
    }

    #[test]
    fn different_model_id_produces_different_fingerprint() {
        let opts = GenerationOptions::default();
        assert_ne!(fingerprint("m1", "hi", &opts), fingerprint("m2", "hi", &opts));
    }
}
