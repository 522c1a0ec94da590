//! Pool error types.

use thiserror::Error;

use crate::pool::lifecycle::LifecycleError;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No resource could be handed out within the configured policy.
    #[error("pool exhausted ({active} active, {idle} idle, {waiting} waiting)")]
    Exhausted {
        active: usize,
        idle: usize,
        waiting: usize,
    },

    /// Constructing or activating a new resource failed.
    #[error("resource creation failed: {source}")]
    CreateFailed {
        #[source]
        source: LifecycleError,
    },

    /// The pool has been permanently closed.
    #[error("pool is closed")]
    Closed,

    /// The resource does not belong to this pool's active set.
    ///
    /// Returning a foreign resource is always a bug in the caller.
    #[error("resource is not owned by this pool")]
    NotOwned,

    /// A blocked acquire was cancelled by its caller.
    #[error("acquire was cancelled")]
    Cancelled,

    /// Rejected configuration at construction time.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Check if this error is retryable.
    ///
    /// Exhaustion clears when a resource is returned; a failed construction
    /// may succeed on retry unless the cause is configuration-level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Exhausted { .. } | PoolError::CreateFailed { .. }
        )
    }

    pub(crate) fn create_failed(source: impl Into<LifecycleError>) -> Self {
        Self::CreateFailed {
            source: source.into(),
        }
    }
}
