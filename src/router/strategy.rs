//! Selection strategies (`spec.md` §4.2). Each variant is a pure scoring
//! function over a list of candidates; the router filters by capability
//! and health before scoring, then stable-sorts descending with the
//! documented tie-break.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::descriptor::CapabilitySet;

/// Closed set of selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    QualityFirst,
    CostOptimized,
    SpeedPriority,
    Balanced,
    Random,
    RoundRobin,
    LeastLoaded,
    CapabilityMatch,
    Explicit,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::QualityFirst => "quality-first",
            Strategy::CostOptimized => "cost-optimized",
            Strategy::SpeedPriority => "speed-priority",
            Strategy::Balanced => "balanced",
            Strategy::Random => "random",
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastLoaded => "least-loaded",
            Strategy::CapabilityMatch => "capability-match",
            Strategy::Explicit => "explicit",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quality-first" => Ok(Strategy::QualityFirst),
            "cost-optimized" => Ok(Strategy::CostOptimized),
            "speed-priority" => Ok(Strategy::SpeedPriority),
            "balanced" => Ok(Strategy::Balanced),
            "random" => Ok(Strategy::Random),
            "round-robin" => Ok(Strategy::RoundRobin),
            "least-loaded" => Ok(Strategy::LeastLoaded),
            "capability-match" => Ok(Strategy::CapabilityMatch),
            "explicit" => Ok(Strategy::Explicit),
            other => Err(format!(
                "unknown strategy '{other}': expected one of quality-first, cost-optimized, \
                 speed-priority, balanced, random, round-robin, least-loaded, capability-match, explicit"
            )),
        }
    }
}

/// One scored candidate's inputs, read from a registry snapshot plus
/// live metrics. Carried by value so scoring never holds a registry lock.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub capabilities: CapabilitySet,
    pub quality_score: f64,
    pub avg_latency_ms: f64,
    pub cost_per_million_tokens: f64,
    pub in_flight: u64,
    pub last_used_at_ms: i64,
}

/// Balanced weights from `spec.md` §4.2: quality 0.4, cost 0.3, latency 0.3.
const WEIGHT_QUALITY: f64 = 0.4;
const WEIGHT_COST: f64 = 0.3;
const WEIGHT_LATENCY: f64 = 0.3;

impl Strategy {
    /// Filters candidates whose capability set satisfies `required`,
    /// scores and stable-sorts them per this strategy's rule, and
    /// applies the `(score desc, lastUsedAt asc, id asc)` tie-break.
    /// `round_robin_cursor` is consulted/advanced only for `RoundRobin`;
    /// `explicit_model_id` only for `Explicit`.
    pub fn select(
        &self,
        candidates: &[Candidate],
        required: &CapabilitySet,
        round_robin_cursor: Option<&AtomicUsize>,
        explicit_model_id: Option<&str>,
    ) -> Vec<Candidate> {
        let mut pool: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.capabilities.is_superset(required))
            .cloned()
            .collect();

        match self {
            Strategy::Explicit => {
                let Some(id) = explicit_model_id else {
                    return Vec::new();
                };
                pool.retain(|c| c.id == id);
                return pool;
            }
            Strategy::Random => {
                let mut rng = rand::thread_rng();
                let mut shuffled = pool;
                for i in (1..shuffled.len()).rev() {
                    let j = rng.gen_range(0..=i);
                    shuffled.swap(i, j);
                }
                return shuffled;
            }
            Strategy::RoundRobin => {
                if pool.is_empty() {
                    return pool;
                }
                let cursor = round_robin_cursor
                    .map(|c| c.fetch_add(1, Ordering::Relaxed))
                    .unwrap_or(0);
                let start = cursor % pool.len();
                pool.rotate_left(start);
                return pool;
            }
            _ => {}
        }

        let scored: Vec<(f64, Candidate)> = pool
            .into_iter()
            .map(|c| (self.score(&c, &candidates_bounds(candidates)), c))
            .collect();

        sort_by_score_desc(scored)
    }

    fn score(&self, c: &Candidate, bounds: &Bounds) -> f64 {
        match self {
            Strategy::QualityFirst => c.quality_score,
            Strategy::CostOptimized => -c.cost_per_million_tokens,
            Strategy::SpeedPriority => -c.avg_latency_ms,
            Strategy::LeastLoaded => -(c.in_flight as f64),
            Strategy::Balanced | Strategy::CapabilityMatch => {
                let quality = c.quality_score;
                let cost = 1.0 - bounds.normalize_cost(c.cost_per_million_tokens);
                let latency = 1.0 - bounds.normalize_latency(c.avg_latency_ms);
                WEIGHT_QUALITY * quality + WEIGHT_COST * cost + WEIGHT_LATENCY * latency
            }
            Strategy::Explicit | Strategy::Random | Strategy::RoundRobin => unreachable!(
                "handled by early return in select()"
            ),
        }
    }
}

/// Min/max bounds across the full candidate set (before capability
/// filtering), used to normalize cost and latency into `[0, 1]` for the
/// weighted-sum strategies. Computed over the full pool so a request
/// that needs a rare capability doesn't distort the normalization by a
/// single-candidate range.
struct Bounds {
    cost_min: f64,
    cost_max: f64,
    latency_min: f64,
    latency_max: f64,
}

fn candidates_bounds(candidates: &[Candidate]) -> Bounds {
    let mut cost_min = f64::INFINITY;
    let mut cost_max = f64::NEG_INFINITY;
    let mut latency_min = f64::INFINITY;
    let mut latency_max = f64::NEG_INFINITY;

    for c in candidates {
        cost_min = cost_min.min(c.cost_per_million_tokens);
        cost_max = cost_max.max(c.cost_per_million_tokens);
        latency_min = latency_min.min(c.avg_latency_ms);
        latency_max = latency_max.max(c.avg_latency_ms);
    }

    if candidates.is_empty() {
        cost_min = 0.0;
        cost_max = 0.0;
        latency_min = 0.0;
        latency_max = 0.0;
    }

    Bounds {
        cost_min,
        cost_max,
        latency_min,
        latency_max,
    }
}

impl Bounds {
    fn normalize_cost(&self, value: f64) -> f64 {
        normalize(value, self.cost_min, self.cost_max)
    }

    fn normalize_latency(&self, value: f64) -> f64 {
        normalize(value, self.latency_min, self.latency_max)
    }
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        0.0
    } else {
        (value - min) / (max - min)
    }
}

/// Stable sort descending by score; ties broken by `(lastUsedAt asc, id
/// asc)` per `spec.md` §4.2.
fn sort_by_score_desc(mut scored: Vec<(f64, Candidate)>) -> Vec<Candidate> {
    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.last_used_at_ms.cmp(&b.last_used_at_ms))
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.into_iter().map(|(_, c)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::Capability;

    fn candidate(id: &str, quality: f64, latency_ms: f64, cost: f64, in_flight: u64) -> Candidate {
        Candidate {
            id: id.to_string(),
            capabilities: CapabilitySet::from_iter_caps([Capability::Chat]),
            quality_score: quality,
            avg_latency_ms: latency_ms,
            cost_per_million_tokens: cost,
            in_flight,
            last_used_at_ms: 0,
        }
    }

    #[test]
    fn strategy_parses_closed_set() {
        assert_eq!("balanced".parse::<Strategy>().unwrap(), Strategy::Balanced);
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert!("made-up".parse::<Strategy>().is_err());
    }

    #[test]
    fn speed_priority_orders_by_latency() {
        let fast = candidate("fast", 0.5, 50.0, 0.0, 0);
        let good = candidate("good", 0.95, 500.0, 0.0, 0);
        let required = CapabilitySet::from_iter_caps([Capability::Chat]);
        let ranked = Strategy::SpeedPriority.select(&[fast, good], &required, None, None);
        assert_eq!(ranked[0].id, "fast");
        assert_eq!(ranked[1].id, "good");
    }

    #[test]
    fn quality_first_orders_by_quality() {
        let fast = candidate("fast", 0.5, 50.0, 0.0, 0);
        let good = candidate("good", 0.95, 500.0, 0.0, 0);
        let required = CapabilitySet::from_iter_caps([Capability::Chat]);
        let ranked = Strategy::QualityFirst.select(&[fast, good], &required, None, None);
        assert_eq!(ranked[0].id, "good");
        assert_eq!(ranked[1].id, "fast");
    }

    #[test]
    fn least_loaded_prefers_fewer_in_flight() {
        let busy = candidate("busy", 0.5, 50.0, 0.0, 5);
        let idle = candidate("idle", 0.5, 50.0, 0.0, 0);
        let required = CapabilitySet::from_iter_caps([Capability::Chat]);
        let ranked = Strategy::LeastLoaded.select(&[busy, idle], &required, None, None);
        assert_eq!(ranked[0].id, "idle");
    }

    #[test]
    fn capability_filter_excludes_non_superset() {
        let chat_only = Candidate {
            capabilities: CapabilitySet::from_iter_caps([Capability::Chat]),
            ..candidate("chat-only", 0.5, 50.0, 0.0, 0)
        };
        let streaming_chat = Candidate {
            capabilities: CapabilitySet::from_iter_caps([Capability::Chat, Capability::Streaming]),
            ..candidate("streaming", 0.5, 50.0, 0.0, 0)
        };
        let required = CapabilitySet::from_iter_caps([Capability::Chat, Capability::Streaming]);
        let ranked = Strategy::Balanced.select(
            &[chat_only, streaming_chat],
            &required,
            None,
            None,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "streaming");
    }

    #[test]
    fn explicit_requires_matching_id_or_returns_empty() {
        let a = candidate("a", 0.5, 50.0, 0.0, 0);
        let required = CapabilitySet::from_iter_caps([Capability::Chat]);
        let found = Strategy::Explicit.select(&[a.clone()], &required, None, Some("a"));
        assert_eq!(found.len(), 1);
        let missing = Strategy::Explicit.select(&[a], &required, None, Some("z"));
        assert!(missing.is_empty());
    }

    #[test]
    fn round_robin_advances_start_position() {
        let cursor = AtomicUsize::new(0);
        let pool = vec![
            candidate("a", 0.5, 50.0, 0.0, 0),
            candidate("b", 0.5, 50.0, 0.0, 0),
            candidate("c", 0.5, 50.0, 0.0, 0),
        ];
        let required = CapabilitySet::from_iter_caps([Capability::Chat]);

        let first = Strategy::RoundRobin.select(&pool, &required, Some(&cursor), None);
        assert_eq!(first[0].id, "a");
        let second = Strategy::RoundRobin.select(&pool, &required, Some(&cursor), None);
        assert_eq!(second[0].id, "b");
        let third = Strategy::RoundRobin.select(&pool, &required, Some(&cursor), None);
        assert_eq!(third[0].id, "c");
        let fourth = Strategy::RoundRobin.select(&pool, &required, Some(&cursor), None);
        assert_eq!(fourth[0].id, "a");
    }

    #[test]
    fn tie_break_uses_last_used_then_id() {
        let mut a = candidate("b-model", 0.5, 50.0, 0.0, 0);
        a.last_used_at_ms = 100;
        let mut b = candidate("a-model", 0.5, 50.0, 0.0, 0);
        b.last_used_at_ms = 100;
        let required = CapabilitySet::from_iter_caps([Capability::Chat]);
        let ranked = Strategy::QualityFirst.select(&[a, b], &required, None, None);
        assert_eq!(ranked[0].id, "a-model", "equal score and lastUsedAt falls back to id asc");
    }
}
