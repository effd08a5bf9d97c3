//! Error taxonomy for the router.
//!
//! Every boundary between Registry, Router, Loader/Handle, and Pipeline
//! yields one of these variants. String messages inside each variant are
//! for humans; callers that need to branch should match on [`ErrorKind`].

use std::fmt;

use thiserror::Error;

/// A single candidate's outcome when the pipeline tries it and moves on.
#[derive(Debug, Clone)]
pub struct CandidateAttempt {
    pub model_id: String,
    pub cause: String,
}

impl fmt::Display for CandidateAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.model_id, self.cause)
    }
}

/// Coarse classification used by transports to pick a status class
/// without matching the full [`RouterError`] enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    DuplicateId,
    CapacityExceeded,
    CapabilityUnavailable,
    TransientBackend,
    PermanentBackend,
    Busy,
    Timeout,
    Cancelled,
    NoViableModel,
    Internal,
}

#[derive(Debug, Error)]
pub enum RouterError {
    /// Pipeline stage 1. No retry, no fallback.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Registry lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Registry register() with an id that already exists.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Registry register() after failed LRU eviction.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Loader/Handle: requested capability not present. Pipeline tries
    /// the next candidate with the same strategy.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Loader/Handle: network, timeout, rate-limit, circuit open.
    /// Retried on the next candidate up to `maxFallbacks`.
    #[error("transient backend error: {0}")]
    TransientBackendError(String),

    /// Loader/Handle: auth, missing file. Model is marked failed and the
    /// pipeline moves to the next candidate.
    #[error("permanent backend error: {0}")]
    PermanentBackendError(String),

    /// Handle queue full. Caller should retry later.
    #[error("busy: {0}")]
    Busy(String),

    /// Pipeline deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Pipeline cancelled by caller.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// All candidates exhausted.
    #[error("no viable model: tried {0:?}")]
    NoViableModel(Vec<CandidateAttempt>),

    /// Anything unexpected. Logged with context, request fails.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::ValidationError(_) => ErrorKind::Validation,
            RouterError::NotFound(_) => ErrorKind::NotFound,
            RouterError::DuplicateId(_) => ErrorKind::DuplicateId,
            RouterError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            RouterError::CapabilityUnavailable(_) => ErrorKind::CapabilityUnavailable,
            RouterError::TransientBackendError(_) => ErrorKind::TransientBackend,
            RouterError::PermanentBackendError(_) => ErrorKind::PermanentBackend,
            RouterError::Busy(_) => ErrorKind::Busy,
            RouterError::Timeout(_) => ErrorKind::Timeout,
            RouterError::Cancelled(_) => ErrorKind::Cancelled,
            RouterError::NoViableModel(_) => ErrorKind::NoViableModel,
            RouterError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Whether the pipeline should try the next candidate after this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapabilityUnavailable | ErrorKind::TransientBackend | ErrorKind::PermanentBackend
        )
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_is_not_fallback_eligible() {
        let e = RouterError::ValidationError("maxTokens must be > 0".into());
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert!(!e.is_fallback_eligible());
    }

    #[test]
    fn transient_backend_error_is_fallback_eligible() {
        let e = RouterError::TransientBackendError("timeout".into());
        assert!(e.is_fallback_eligible());
    }

    #[test]
    fn no_viable_model_formats_attempts() {
        let e = RouterError::NoViableModel(vec![CandidateAttempt {
            model_id: "m1".into(),
            cause: "circuit open".into(),
        }]);
        let msg = e.to_string();
        assert!(msg.contains("m1"));
        assert!(msg.contains("circuit open"));
    }
}
