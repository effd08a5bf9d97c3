//! Per-model health gate (`spec.md` §4.2). Same three-state machine as
//! the teacher's `resilience/circuit_breaker.rs::CircuitBreaker`, but
//! generalized from a fixed failure count to a sliding window of the
//! last N outcomes with an error-ratio threshold, and one instance per
//! model rather than a single shared breaker.

use std::collections::VecDeque;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states — same shape as the teacher's `CircuitState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_successes: usize,
}

/// Half-open probes need this many consecutive successes to close again,
/// matching the teacher's `success_count >= 3` recovery vote.
const HALF_OPEN_RECOVERY_VOTES: usize = 3;

/// Per-model sliding-window circuit breaker.
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    window: usize,
    error_ratio_threshold: f64,
    cooldown: tokio::time::Duration,
}

impl CircuitBreaker {
    /// `window` is clamped to at least 20 per `spec.md` §4.2 ("N≥20").
    pub fn new(window: usize, error_ratio_threshold: f64, cooldown_ms: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(window.max(20)),
                opened_at: None,
                half_open_successes: 0,
            }),
            window: window.max(20),
            error_ratio_threshold,
            cooldown: tokio::time::Duration::from_millis(cooldown_ms),
        }
    }

    /// `true` if a call may be attempted right now. In `Open` state this
    /// also performs the cooldown-elapsed transition to `HalfOpen`, the
    /// "recheck by allowing one probe every cooldownMs" rule.
    pub async fn is_available(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(opened_at) = inner.opened_at {
                    if opened_at.elapsed() >= self.cooldown {
                        info!("circuit breaker entering half-open probe");
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_successes = 0;
                        return true;
                    }
                }
                false
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        push_outcome(&mut inner.outcomes, self.window, true);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= HALF_OPEN_RECOVERY_VOTES {
                    info!("circuit breaker closing after recovery probes succeeded");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.outcomes.clear();
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        push_outcome(&mut inner.outcomes, self.window, false);

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopening after failure during half-open probe");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            CircuitState::Closed => {
                if inner.outcomes.len() >= self.window && error_ratio(&inner.outcomes) > self.error_ratio_threshold {
                    warn!(
                        ratio = error_ratio(&inner.outcomes),
                        "circuit breaker opening, error ratio exceeded threshold"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.outcomes.clear();
        inner.opened_at = None;
        inner.half_open_successes = 0;
    }
}

fn push_outcome(outcomes: &mut VecDeque<bool>, window: usize, success: bool) {
    outcomes.push_back(success);
    while outcomes.len() > window {
        outcomes.pop_front();
    }
}

fn error_ratio(outcomes: &VecDeque<bool>) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let errors = outcomes.iter().filter(|ok| !**ok).count();
    errors as f64 / outcomes.len() as f64
}
