//! Transaction scope for one logical unit of work.

use std::marker::PhantomData;
use std::thread::ThreadId;

use tracing::{debug, warn};

use crate::pool::CancelToken;
use crate::transaction::compensation::{CompensationLog, UndoableAction};
use crate::transaction::error::{ScopeError, ScopeResult};
use crate::transaction::manager::ScopeManager;
use crate::transaction::provider::ConnectionProvider;

/// Options for a new scope.
#[derive(Debug, Clone)]
pub struct ScopeOptions {
    /// Disable auto-commit on the write resource once obtained.
    pub transactional: bool,
    /// Whether this scope owns the commit decision. When `false` the scope
    /// participates in an outer transaction and [`commit`] is a no-op.
    ///
    /// [`commit`]: TransactionScope::commit
    pub commit_on_finish: bool,
    /// Liveness guard: once cancelled, the scope rolls back and finishes
    /// instead of making further provider calls.
    pub cancel: Option<CancelToken>,
}

impl ScopeOptions {
    /// Transactional, commit-owning options with no liveness guard.
    pub fn new() -> Self {
        Self {
            transactional: true,
            commit_on_finish: true,
            cancel: None,
        }
    }

    pub fn transactional(mut self, value: bool) -> Self {
        self.transactional = value;
        self
    }

    pub fn commit_on_finish(mut self, value: bool) -> Self {
        self.commit_on_finish = value;
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self::new()
    }
}

struct WriteState<C> {
    conn: C,
    /// Auto-commit state found on the resource, restored before release.
    original_auto_commit: bool,
}

/// Per-unit-of-work transaction state.
///
/// A scope caches at most one read and one write resource from its provider.
/// Once a write resource exists, every later read request returns it too, so
/// the unit of work keeps a single consistent view. Compensating actions
/// registered with [`add_compensation`] replay in reverse on [`rollback`].
///
/// Scopes are handed out by [`ScopeManager::begin`] and are pinned to the
/// unit of work that started them (`!Send`). Call [`finish`] on every exit
/// path; dropping the scope finishes it best-effort.
///
/// [`add_compensation`]: Self::add_compensation
/// [`rollback`]: Self::rollback
/// [`finish`]: Self::finish
pub struct TransactionScope<P: ConnectionProvider> {
    manager: ScopeManager<P>,
    id: String,
    unit: ThreadId,
    write: Option<WriteState<P::Conn>>,
    read: Option<P::Conn>,
    read_refs: usize,
    transactional: bool,
    commit_on_finish: bool,
    compensations: CompensationLog,
    cancel: Option<CancelToken>,
    finished: bool,
    _unit_local: PhantomData<*const ()>,
}

impl<P: ConnectionProvider> TransactionScope<P> {
    pub(crate) fn new(
        manager: ScopeManager<P>,
        id: String,
        unit: ThreadId,
        options: ScopeOptions,
    ) -> Self {
        Self {
            manager,
            id,
            unit,
            write: None,
            read: None,
            read_refs: 0,
            transactional: options.transactional,
            commit_on_finish: options.commit_on_finish,
            compensations: CompensationLog::new(),
            cancel: options.cancel,
            finished: false,
            _unit_local: PhantomData,
        }
    }

    /// Get the scope ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn commits_on_finish(&self) -> bool {
        self.commit_on_finish
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read handles currently outstanding on the cached read resource.
    pub fn read_refs(&self) -> usize {
        self.read_refs
    }

    /// Compensations queued for a later rollback.
    pub fn pending_compensations(&self) -> usize {
        self.compensations.len()
    }

    /// Borrow a read resource.
    ///
    /// Returns the scope's write resource when one exists (reads never see a
    /// second physical resource after that), otherwise the cached read
    /// resource, fetching one from the provider on first use.
    pub fn acquire_read(&mut self) -> ScopeResult<&mut P::Conn> {
        self.ensure_active()?;
        self.ensure_live()?;
        if let Some(write) = self.write.as_mut() {
            return Ok(&mut write.conn);
        }
        if self.read.is_none() {
            let conn = self
                .manager
                .provider()
                .get_read()
                .map_err(ScopeError::provider)?;
            self.read = Some(conn);
        }
        self.read_refs += 1;
        Ok(self.read.as_mut().expect("read resource cached above"))
    }

    /// Borrow the scope's single write resource, fetching and pinning it on
    /// first use.
    ///
    /// When the scope is transactional the resource's auto-commit is switched
    /// off for the duration of the scope. The switch is refused with
    /// [`ScopeError::SwitchNotAllowed`] while read handles are outstanding,
    /// since it would change behavior out from under them.
    pub fn acquire_write(&mut self) -> ScopeResult<&mut P::Conn> {
        self.ensure_active()?;
        self.ensure_live()?;
        if self.write.is_none() {
            let provider = self.manager.provider();
            let mut conn = provider.get_write().map_err(ScopeError::provider)?;
            let original = provider.auto_commit(&conn).map_err(ScopeError::provider)?;
            let desired = !self.transactional;
            if original != desired {
                if self.read_refs > 0 {
                    provider.release_write(conn);
                    return Err(ScopeError::SwitchNotAllowed {
                        reads: self.read_refs,
                    });
                }
                if let Err(cause) = provider.set_auto_commit(&mut conn, desired) {
                    provider.release_write(conn);
                    return Err(ScopeError::provider(cause));
                }
            }
            debug!(scope = %self.id, transactional = self.transactional, "write resource pinned");
            self.write = Some(WriteState {
                conn,
                original_auto_commit: original,
            });
        }
        let write = self.write.as_mut().expect("write resource pinned above");
        Ok(&mut write.conn)
    }

    /// Give back one read handle.
    ///
    /// Only the reference count drops here; the resource physically returns
    /// to the provider at [`finish`](Self::finish). A write resource is never
    /// released mid-scope.
    pub fn release_read(&mut self) {
        if self.read_refs == 0 {
            warn!(scope = %self.id, "unbalanced read release");
            return;
        }
        self.read_refs -= 1;
    }

    /// Queue a compensating action for a later rollback.
    pub fn add_compensation(&mut self, action: impl UndoableAction + 'static) -> ScopeResult<()> {
        self.ensure_active()?;
        self.compensations.push(Box::new(action));
        Ok(())
    }

    /// Commit the write resource, when this scope owns that decision.
    ///
    /// A no-op unless a write resource exists, runs with auto-commit off, and
    /// the scope was configured to commit on finish. Queued compensations are
    /// kept: an outer unit of work may still roll the overall operation back.
    pub fn commit(&mut self) -> ScopeResult<()> {
        self.ensure_active()?;
        self.ensure_live()?;
        let Some(write) = self.write.as_mut() else {
            return Ok(());
        };
        let provider = self.manager.provider();
        let auto = provider
            .auto_commit(&write.conn)
            .map_err(ScopeError::provider)?;
        if auto || !self.commit_on_finish {
            return Ok(());
        }
        provider
            .commit(&mut write.conn)
            .map_err(ScopeError::provider)?;
        debug!(scope = %self.id, "write resource committed");
        Ok(())
    }

    /// Roll back the write resource and replay the compensation log in
    /// reverse.
    ///
    /// Every compensation runs even when an earlier one fails; collected
    /// failures surface as [`ScopeError::IncompleteRollback`], the signal
    /// that external state needs manual recovery.
    pub fn rollback(&mut self) -> ScopeResult<()> {
        self.ensure_active()?;
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> ScopeResult<()> {
        let mut provider_failure = None;
        if let Some(write) = self.write.as_mut() {
            let provider = self.manager.provider();
            match provider.auto_commit(&write.conn) {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(cause) = provider.rollback(&mut write.conn) {
                        provider_failure = Some(ScopeError::provider(cause));
                    }
                }
                Err(cause) => provider_failure = Some(ScopeError::provider(cause)),
            }
        }

        let failures = self.compensations.replay();
        if !failures.is_empty() {
            return Err(ScopeError::IncompleteRollback { failures });
        }
        match provider_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Release held resources and discard scope state. Idempotent.
    pub fn finish(&mut self) {
        self.finish_inner();
    }

    fn ensure_active(&self) -> ScopeResult<()> {
        if self.finished {
            Err(ScopeError::Finished)
        } else {
            Ok(())
        }
    }

    /// Bail out early when the owning unit of work is already gone, instead
    /// of leaking resources into a context that will never release them.
    fn ensure_live(&mut self) -> ScopeResult<()> {
        let cancelled = self
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled);
        if cancelled {
            warn!(scope = %self.id, "unit of work terminated mid-scope; rolling back");
            let _ = self.rollback_inner();
            self.finish_inner();
            return Err(ScopeError::Terminated);
        }
        Ok(())
    }

    fn finish_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let provider = self.manager.provider();
        if let Some(mut write) = self.write.take() {
            let desired = !self.transactional;
            if write.original_auto_commit != desired {
                if let Err(cause) =
                    provider.set_auto_commit(&mut write.conn, write.original_auto_commit)
                {
                    warn!(scope = %self.id, error = %cause, "could not restore auto-commit before release");
                }
            }
            provider.release_write(write.conn);
        }
        if let Some(read) = self.read.take() {
            provider.release_read(read);
        }
        self.read_refs = 0;
        self.compensations.clear();
        self.manager.deregister(self.unit);
        debug!(scope = %self.id, "scope finished");
    }
}

impl<P: ConnectionProvider> Drop for TransactionScope<P> {
    fn drop(&mut self) {
        // Covers every exit path; an explicit finish makes this a no-op.
        self.finish_inner();
    }
}

impl<P: ConnectionProvider> std::fmt::Debug for TransactionScope<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("has_write", &self.write.is_some())
            .field("read_refs", &self.read_refs)
            .field("pending_compensations", &self.compensations.len())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use thiserror::Error;

    use crate::transaction::compensation::UndoError;
    use crate::transaction::manager::ScopeManager;

    #[derive(Debug)]
    struct MockConn {
        id: usize,
        auto_commit: bool,
    }

    #[derive(Default)]
    struct ProviderLog {
        next_id: usize,
        read_gets: usize,
        write_gets: usize,
        released_read: Vec<usize>,
        released_write: Vec<(usize, bool)>,
        commits: Vec<usize>,
        rollbacks: Vec<usize>,
        fail_gets: bool,
    }

    #[derive(Default)]
    struct MockProvider {
        log: Mutex<ProviderLog>,
    }

    #[derive(Debug, Error)]
    #[error("broker offline")]
    struct BrokerOffline;

    impl ConnectionProvider for Arc<MockProvider> {
        type Conn = MockConn;
        type Error = BrokerOffline;

        fn get_read(&self) -> Result<MockConn, BrokerOffline> {
            let mut log = self.log.lock();
            if log.fail_gets {
                return Err(BrokerOffline);
            }
            let id = log.next_id;
            log.next_id += 1;
            log.read_gets += 1;
            Ok(MockConn {
                id,
                auto_commit: true,
            })
        }

        fn get_write(&self) -> Result<MockConn, BrokerOffline> {
            let mut log = self.log.lock();
            if log.fail_gets {
                return Err(BrokerOffline);
            }
            let id = log.next_id;
            log.next_id += 1;
            log.write_gets += 1;
            Ok(MockConn {
                id,
                auto_commit: true,
            })
        }

        fn release_read(&self, conn: MockConn) {
            self.log.lock().released_read.push(conn.id);
        }

        fn release_write(&self, conn: MockConn) {
            self.log.lock().released_write.push((conn.id, conn.auto_commit));
        }

        fn commit(&self, conn: &mut MockConn) -> Result<(), BrokerOffline> {
            self.log.lock().commits.push(conn.id);
            Ok(())
        }

        fn rollback(&self, conn: &mut MockConn) -> Result<(), BrokerOffline> {
            self.log.lock().rollbacks.push(conn.id);
            Ok(())
        }

        fn auto_commit(&self, conn: &MockConn) -> Result<bool, BrokerOffline> {
            Ok(conn.auto_commit)
        }

        fn set_auto_commit(&self, conn: &mut MockConn, enabled: bool) -> Result<(), BrokerOffline> {
            conn.auto_commit = enabled;
            Ok(())
        }
    }

    struct Recorded {
        name: String,
        fail: bool,
        order: Arc<Mutex<Vec<String>>>,
    }

    impl UndoableAction for Recorded {
        fn name(&self) -> &str {
            &self.name
        }

        fn undo(&mut self) -> Result<(), UndoError> {
            self.order.lock().push(self.name.clone());
            if self.fail {
                Err(format!("{} refused", self.name).into())
            } else {
                Ok(())
            }
        }
    }

    fn setup() -> (Arc<MockProvider>, ScopeManager<Arc<MockProvider>>) {
        let provider = Arc::new(MockProvider::default());
        let manager = ScopeManager::new(provider.clone());
        (provider, manager)
    }

    #[test]
    fn test_write_resource_reused_for_all_later_requests() {
        let (provider, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();

        let first = scope.acquire_write().unwrap().id;
        let second = scope.acquire_write().unwrap().id;
        let read = scope.acquire_read().unwrap().id;

        assert_eq!(first, second);
        assert_eq!(first, read);
        let log = provider.log.lock();
        assert_eq!(log.write_gets, 1);
        assert_eq!(log.read_gets, 0);
    }

    #[test]
    fn test_read_resource_cached_with_refcount() {
        let (provider, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();

        let first = scope.acquire_read().unwrap().id;
        let second = scope.acquire_read().unwrap().id;

        assert_eq!(first, second);
        assert_eq!(scope.read_refs(), 2);
        assert_eq!(provider.log.lock().read_gets, 1);
    }

    #[test]
    fn test_transactional_write_refused_while_reads_outstanding() {
        let (provider, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        scope.acquire_read().unwrap();

        match scope.acquire_write() {
            Err(ScopeError::SwitchNotAllowed { reads }) => assert_eq!(reads, 1),
            other => panic!("expected switch rejection, got {other:?}"),
        }
        // The probed write connection went straight back, untouched.
        assert_eq!(provider.log.lock().released_write, vec![(1, true)]);

        scope.release_read();
        let conn = scope.acquire_write().unwrap();
        assert!(!conn.auto_commit);
    }

    #[test]
    fn test_non_transactional_write_allowed_with_reads() {
        let (_, manager) = setup();
        let mut scope = manager
            .begin(ScopeOptions::new().transactional(false))
            .unwrap();
        scope.acquire_read().unwrap();

        let conn = scope.acquire_write().unwrap();
        assert!(conn.auto_commit, "no toggle was needed");
    }

    #[test]
    fn test_commit_respects_ownership_and_mode() {
        // Scope owns the commit: provider commit runs.
        let (provider, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        let id = scope.acquire_write().unwrap().id;
        scope.commit().unwrap();
        assert_eq!(provider.log.lock().commits, vec![id]);
        drop(scope);

        // Outer transaction owns the commit: no-op.
        let (provider, manager) = setup();
        let mut scope = manager
            .begin(ScopeOptions::new().commit_on_finish(false))
            .unwrap();
        scope.acquire_write().unwrap();
        scope.commit().unwrap();
        assert!(provider.log.lock().commits.is_empty());
        drop(scope);

        // Auto-commit resource: nothing to commit.
        let (provider, manager) = setup();
        let mut scope = manager
            .begin(ScopeOptions::new().transactional(false))
            .unwrap();
        scope.acquire_write().unwrap();
        scope.commit().unwrap();
        assert!(provider.log.lock().commits.is_empty());
    }

    #[test]
    fn test_rollback_replays_compensations_in_reverse() {
        let (provider, manager) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        let write_id = scope.acquire_write().unwrap().id;

        for (name, fail) in [("u1", false), ("u2", true), ("u3", false)] {
            scope
                .add_compensation(Recorded {
                    name: name.to_string(),
                    fail,
                    order: order.clone(),
                })
                .unwrap();
        }

        match scope.rollback() {
            Err(ScopeError::IncompleteRollback { failures }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].action, "u2");
            }
            other => panic!("expected incomplete rollback, got {other:?}"),
        }
        assert_eq!(*order.lock(), vec!["u3", "u2", "u1"]);
        assert_eq!(provider.log.lock().rollbacks, vec![write_id]);
        assert_eq!(scope.pending_compensations(), 0);
    }

    #[test]
    fn test_finish_is_idempotent_and_restores_auto_commit() {
        let (provider, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        let id = scope.acquire_write().unwrap().id;

        scope.finish();
        scope.finish();
        drop(scope);

        let log = provider.log.lock();
        assert_eq!(log.released_write, vec![(id, true)]);
    }

    #[test]
    fn test_read_resource_released_at_finish_only() {
        let (provider, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        let id = scope.acquire_read().unwrap().id;

        scope.release_read();
        assert!(provider.log.lock().released_read.is_empty());

        scope.finish();
        assert_eq!(provider.log.lock().released_read, vec![id]);
    }

    #[test]
    fn test_provider_failure_propagates() {
        let (provider, manager) = setup();
        provider.log.lock().fail_gets = true;
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();

        let err = scope.acquire_read().unwrap_err();
        assert!(matches!(err, ScopeError::Provider { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_terminated_unit_of_work_rolls_back_and_finishes() {
        let (provider, manager) = setup();
        let token = CancelToken::new();
        let mut scope = manager
            .begin(ScopeOptions::new().cancel(token.clone()))
            .unwrap();
        let write_id = scope.acquire_write().unwrap().id;

        token.cancel();
        assert!(matches!(
            scope.acquire_read(),
            Err(ScopeError::Terminated)
        ));
        assert!(scope.is_finished());
        assert_eq!(manager.active_count(), 0);
        {
            let log = provider.log.lock();
            assert_eq!(log.rollbacks, vec![write_id]);
            assert_eq!(log.released_write.len(), 1);
        }

        // Further use reports the scope as finished, not terminated again.
        assert!(matches!(scope.acquire_read(), Err(ScopeError::Finished)));
    }

    #[test]
    fn test_operations_rejected_after_finish() {
        let (_, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        scope.finish();

        assert!(matches!(scope.acquire_write(), Err(ScopeError::Finished)));
        assert!(matches!(scope.commit(), Err(ScopeError::Finished)));
        assert!(matches!(scope.rollback(), Err(ScopeError::Finished)));
    }

    #[test]
    fn test_compensations_survive_commit() {
        let (_, manager) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        scope.acquire_write().unwrap();
        scope
            .add_compensation(Recorded {
                name: "notify".to_string(),
                fail: false,
                order: order.clone(),
            })
            .unwrap();

        scope.commit().unwrap();
        // An outer unit of work may still need to undo this scope's effects.
        assert_eq!(scope.pending_compensations(), 1);

        scope.finish();
        assert_eq!(scope.pending_compensations(), 0);
        assert!(order.lock().is_empty(), "finish must not replay compensations");
    }

    #[test]
    fn test_unbalanced_read_release_is_tolerated() {
        let (_, manager) = setup();
        let mut scope = manager.begin(ScopeOptions::new()).unwrap();
        scope.release_read();
        assert_eq!(scope.read_refs(), 0);
    }
}
