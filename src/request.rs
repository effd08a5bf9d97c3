//! Request/Result value types (`spec.md` §3). Shape grounded in the
//! teacher's `AnalyticsEvent`/`CommonEventFields` split (flattened common
//! fields, variant-specific payload) for [`GenerationResult`]'s
//! usage/metadata structure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::router::strategy::Strategy;

/// A single chat message, used when `messages` is supplied instead of a
/// bare `prompt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Recognized generation options, with the defaults from `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
    pub stop_strings: Vec<String>,
    pub stream: bool,
    pub system_prompt: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Explicit opt-in to caching for non-zero-temperature requests.
    pub cacheable: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            stop_strings: Vec::new(),
            stream: false,
            system_prompt: None,
            timeout_ms: None,
            cacheable: false,
        }
    }
}

impl GenerationOptions {
    /// Whether this request's result is eligible for caching, per
    /// `spec.md` §4.4 stage 6: deterministic (temperature == 0) OR an
    /// explicit `cacheable: true`.
    pub fn is_cache_eligible(&self) -> bool {
        self.temperature == 0.0 || self.cacheable
    }

    /// Shape-check and clamp. Never silently drops an out-of-range value;
    /// returns an error message describing the first violation found,
    /// matching `spec.md` §4.4 stage 1 ("fail with ValidationError on
    /// out-of-range").
    pub fn validate(&self) -> Result<(), String> {
        if self.max_tokens == 0 {
            return Err("maxTokens must be a positive integer".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature {} out of range [0, 2]",
                self.temperature
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) || self.top_p <= 0.0 {
            return Err(format!("topP {} out of range (0, 1]", self.top_p));
        }
        if !(1..=1000).contains(&self.top_k) {
            return Err(format!("topK {} out of range [1, 1000]", self.top_k));
        }
        if self.repeat_penalty < 1.0 {
            return Err(format!(
                "repeatPenalty {} must be >= 1",
                self.repeat_penalty
            ));
        }
        if let Some(timeout) = self.timeout_ms {
            if timeout == 0 {
                return Err("timeoutMs must be a positive integer".to_string());
            }
        }
        Ok(())
    }
}

/// Transport-independent request (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: GenerationOptions,
    #[serde(default)]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub strategy_override: Option<Strategy>,
    #[serde(default)]
    pub model_id: Option<String>,
}

impl Request {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            messages: Vec::new(),
            options: GenerationOptions::default(),
            requester_id: None,
            strategy_override: None,
            model_id: None,
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Token usage accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A batched completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens: u32,
    pub latency_ms: u64,
    pub model_id: String,
    pub usage: Usage,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One chunk of a streamed completion. The final chunk has `done = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(GenerationOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_max_tokens_is_rejected() {
        let mut opts = GenerationOptions::default();
        opts.max_tokens = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn temperature_zero_is_cache_eligible() {
        let mut opts = GenerationOptions::default();
        opts.temperature = 0.0;
        assert!(opts.is_cache_eligible());
    }

    #[test]
    fn explicit_cacheable_overrides_nonzero_temperature() {
        let mut opts = GenerationOptions::default();
        opts.temperature = 0.9;
        opts.cacheable = true;
        assert!(opts.is_cache_eligible());
    }

    #[test]
    fn nonzero_temperature_without_cacheable_is_not_cached() {
        let opts = GenerationOptions::default();
        assert!(!opts.is_cache_eligible());
    }

    #[test]
    fn top_k_out_of_range_rejected() {
        let mut opts = GenerationOptions::default();
        opts.top_k = 0;
        assert!(opts.validate().is_err());
        opts.top_k = 1001;
        assert!(opts.validate().is_err());
    }
}
