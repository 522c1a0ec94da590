//! Scope manager - hands out transaction scopes and enforces the
//! one-active-scope-per-unit-of-work rule.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use ulid::Ulid;

use crate::transaction::error::{ScopeError, ScopeResult};
use crate::transaction::provider::ConnectionProvider;
use crate::transaction::scope::{ScopeOptions, TransactionScope};

/// Metadata for an active scope.
#[derive(Debug, Clone)]
pub struct ScopeMetadata {
    /// Unique scope ID.
    pub scope_id: String,
    /// When the scope started.
    pub started_at: DateTime<Utc>,
    pub transactional: bool,
    pub commit_on_finish: bool,
}

/// Entry point for transaction scopes.
///
/// Thread-safe: can be shared across threads via `Clone` (uses `Arc`
/// internally). Each executing unit of work may hold at most one live scope
/// at a time; a second [`begin`](Self::begin) fails with
/// [`ScopeError::AlreadyActive`] until the first scope finishes.
pub struct ScopeManager<P: ConnectionProvider> {
    inner: Arc<ScopeManagerInner<P>>,
}

struct ScopeManagerInner<P> {
    provider: P,
    /// Active scopes keyed by their owning unit of work.
    active: RwLock<HashMap<ThreadId, ScopeMetadata>>,
}

impl<P: ConnectionProvider> ScopeManager<P> {
    /// Create a manager over the given connection provider.
    pub fn new(provider: P) -> Self {
        Self {
            inner: Arc::new(ScopeManagerInner {
                provider,
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn provider(&self) -> &P {
        &self.inner.provider
    }

    /// Start a scope for the calling unit of work.
    pub fn begin(&self, options: ScopeOptions) -> ScopeResult<TransactionScope<P>> {
        let unit = thread::current().id();
        let scope_id = Ulid::new().to_string().to_lowercase();
        {
            let mut active = self.inner.active.write();
            if active.contains_key(&unit) {
                return Err(ScopeError::AlreadyActive);
            }
            active.insert(
                unit,
                ScopeMetadata {
                    scope_id: scope_id.clone(),
                    started_at: Utc::now(),
                    transactional: options.transactional,
                    commit_on_finish: options.commit_on_finish,
                },
            );
        }
        debug!(scope = %scope_id, "scope started");
        Ok(TransactionScope::new(self.clone(), scope_id, unit, options))
    }

    /// Get the number of active scopes across all units of work.
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// Check if the calling unit of work has a live scope.
    pub fn has_active_scope(&self) -> bool {
        self.inner
            .active
            .read()
            .contains_key(&thread::current().id())
    }

    /// Metadata for every active scope.
    pub fn active_scopes(&self) -> Vec<ScopeMetadata> {
        self.inner.active.read().values().cloned().collect()
    }

    pub(crate) fn deregister(&self, unit: ThreadId) {
        self.inner.active.write().remove(&unit);
    }

    /// Execute a function within a scope, committing on success and rolling
    /// back on failure; the scope finishes on every path.
    ///
    /// When both the closure and the rollback fail, an incomplete rollback
    /// outranks the original error, since it is the one needing an operator.
    pub fn with_scope<F, T>(&self, options: ScopeOptions, f: F) -> ScopeResult<T>
    where
        F: FnOnce(&mut TransactionScope<P>) -> ScopeResult<T>,
    {
        let mut scope = self.begin(options)?;
        let outcome = match f(&mut scope) {
            Ok(value) => scope.commit().map(|()| value),
            Err(cause) => Err(cause),
        };
        let outcome = match outcome {
            Ok(value) => Ok(value),
            Err(cause) => match scope.rollback() {
                Ok(()) => Err(cause),
                Err(incomplete @ ScopeError::IncompleteRollback { .. }) => Err(incomplete),
                Err(_) => Err(cause),
            },
        };
        scope.finish();
        outcome
    }
}

impl<P: ConnectionProvider> Clone for ScopeManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ConnectionProvider> std::fmt::Debug for ScopeManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeManager")
            .field("active_count", &self.active_count())
            .finish()
    }
}
