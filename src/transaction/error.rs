//! Scope error types.

use std::error::Error as StdError;

use thiserror::Error;

use crate::transaction::compensation::CompensationFailure;

/// Result type for scope operations.
pub type ScopeResult<T> = Result<T, ScopeError>;

/// Boxed provider error carried through scope failures.
pub type ProviderError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur during transaction scope operations.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// The underlying provider failed or refused the request.
    #[error("provider unavailable: {source}")]
    Provider {
        #[source]
        source: ProviderError,
    },

    /// The calling unit of work already has a live scope; scopes do not nest.
    #[error("a transaction scope is already active on this unit of work")]
    AlreadyActive,

    /// A transactional write resource was requested while read handles are
    /// outstanding; toggling auto-commit would change behavior under them.
    #[error("cannot switch auto-commit with {reads} read handle(s) outstanding; release reads first")]
    SwitchNotAllowed { reads: usize },

    /// One or more compensations failed during rollback replay. External
    /// state may be inconsistent; manual recovery is required.
    #[error("rollback incomplete, {} compensation(s) failed: {}", failures.len(), failed_names(failures))]
    IncompleteRollback { failures: Vec<CompensationFailure> },

    /// The owning unit of work was cancelled or terminated; the scope rolled
    /// back and finished itself.
    #[error("unit of work terminated; scope rolled back and finished")]
    Terminated,

    /// Operation on a scope that has already finished.
    #[error("scope has already finished")]
    Finished,
}

fn failed_names(failures: &[CompensationFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.action.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ScopeError {
    /// Check if this error is retryable.
    ///
    /// Only provider-level failures may clear on retry; everything else is
    /// either a usage bug or needs operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScopeError::Provider { .. })
    }

    /// Whether the error indicates external state needing manual recovery.
    pub fn needs_operator(&self) -> bool {
        matches!(self, ScopeError::IncompleteRollback { .. })
    }

    pub(crate) fn provider(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Provider {
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let provider = ScopeError::provider(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "broker down",
        ));
        assert!(provider.is_retryable());

        assert!(!ScopeError::AlreadyActive.is_retryable());
        assert!(!ScopeError::SwitchNotAllowed { reads: 1 }.is_retryable());
        assert!(!ScopeError::Terminated.is_retryable());
    }

    #[test]
    fn test_incomplete_rollback_names_failures() {
        let err = ScopeError::IncompleteRollback {
            failures: vec![
                CompensationFailure {
                    action: "unregister-webhook".to_string(),
                    error: "endpoint gone".into(),
                },
                CompensationFailure {
                    action: "delete-upload".to_string(),
                    error: "permission denied".into(),
                },
            ],
        };
        assert!(err.needs_operator());
        let text = err.to_string();
        assert!(text.contains("unregister-webhook"));
        assert!(text.contains("delete-upload"));
    }
}
