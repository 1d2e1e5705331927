use std::time::Duration;

/// Failures surfaced by the memory subsystem.
///
/// Orchestration never propagates these as hard errors: a cleanup pass folds
/// them into [`crate::CleanupResult::error`] and keeps going. Only
/// construction-time validation returns them through `Result`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory query failed: {0}")]
    QueryFailure(String),

    #[error("cleanup handler `{name}` failed: {message}")]
    HandlerFailure { name: String, message: String },

    #[error("cleanup handler `{name}` timed out after {timeout:?}")]
    HandlerTimedOut { name: String, timeout: Duration },

    #[error("cleanup already in progress")]
    ReentrancyRejected,

    #[error("cleanup suppressed: cooldown active for another {remaining:?}")]
    CooldownActive { remaining: Duration },

    #[error("invalid pressure thresholds: {0}")]
    InvalidThresholds(String),

    #[error("invalid byte size {input:?}: {reason}")]
    InvalidByteSize { input: String, reason: String },
}
