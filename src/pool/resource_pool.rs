//! The resource pool engine.
//!
//! One mutex protects the idle deque, the active map, and the waiter counter.
//! It is held only for in-memory bookkeeping: every lifecycle call (create,
//! activate, deactivate, validate, destroy) runs unlocked so a slow resource
//! never stalls unrelated callers.

use std::backtrace::Backtrace;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::pool::cancel::CancelToken;
use crate::pool::config::{ExhaustedAction, PoolConfig};
use crate::pool::entry::{ActiveEntry, PooledEntry};
use crate::pool::error::{PoolError, PoolResult};
use crate::pool::lifecycle::ResourceLifecycle;
use crate::pool::stats::{PoolStats, StatsState};

/// How often an unbounded blocking acquire rechecks its cancel token.
const CANCEL_RECHECK: Duration = Duration::from_millis(500);

/// A checked-out resource.
///
/// Derefs to the underlying resource. Dropping a lease returns the resource
/// to its pool best-effort; use [`ResourcePool::release`] to learn whether the
/// resource was pooled again or destroyed.
pub struct Lease<L: ResourceLifecycle> {
    id: Ulid,
    resource: Option<L::Resource>,
    core: Weak<PoolCore<L>>,
}

impl<L: ResourceLifecycle> Lease<L> {
    /// Identifier of the pool entry backing this lease.
    pub fn entry_id(&self) -> Ulid {
        self.id
    }
}

impl<L: ResourceLifecycle> Deref for Lease<L> {
    type Target = L::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("lease resource already released")
    }
}

impl<L: ResourceLifecycle> DerefMut for Lease<L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("lease resource already released")
    }
}

impl<L: ResourceLifecycle> fmt::Debug for Lease<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("entry", &self.id).finish()
    }
}

impl<L: ResourceLifecycle> Drop for Lease<L> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        match self.core.upgrade() {
            Some(core) => {
                let _ = core.give_back(self.id, resource);
            }
            None => drop(resource),
        }
    }
}

/// Outcome of one maintenance sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    /// Idle entries destroyed for staleness, age, or a failed probe.
    pub evicted: usize,
    /// Overdue checkouts whose slots were forcibly freed.
    pub reclaimed: usize,
    /// Fresh entries created to restore the idle floor.
    pub refilled: usize,
}

/// A generic, thread-safe pool of expensive-to-construct resources.
///
/// Thread-safe: can be shared across threads via `Clone` (uses `Arc`
/// internally). The pool pre-warms to `min_idle` at construction and stays
/// permanently closed after [`close`](Self::close).
pub struct ResourcePool<L: ResourceLifecycle> {
    core: Arc<PoolCore<L>>,
}

struct PoolCore<L: ResourceLifecycle> {
    config: PoolConfig,
    lifecycle: L,
    state: Mutex<PoolState<L::Resource>>,
    /// Signalled whenever a slot frees up; waiters re-check from scratch.
    available: Arc<Condvar>,
}

struct PoolState<T> {
    /// Front is the stalest entry; acquisition pops from the back so warm
    /// resources are reused first.
    idle: VecDeque<PooledEntry<T>>,
    active: HashMap<Ulid, ActiveEntry>,
    /// Constructions in flight, reserved against `max_active`.
    creating: usize,
    waiting: usize,
    running: bool,
    stats: StatsState,
}

enum CheckoutPlan<T> {
    Reuse(PooledEntry<T>),
    Create,
}

impl<L: ResourceLifecycle> ResourcePool<L> {
    /// Create a pool and pre-warm it to `min_idle` entries.
    pub fn new(config: PoolConfig, lifecycle: L) -> PoolResult<Self> {
        config.validate()?;
        let core = Arc::new(PoolCore {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: HashMap::new(),
                creating: 0,
                waiting: 0,
                running: true,
                stats: StatsState::default(),
            }),
            available: Arc::new(Condvar::new()),
            config,
            lifecycle,
        });
        for _ in 0..core.config.min_idle {
            let resource = core
                .lifecycle
                .create()
                .map_err(|source| PoolError::CreateFailed { source })?;
            let mut state = core.state.lock();
            state.stats.created += 1;
            state.idle.push_back(PooledEntry::new(resource));
        }
        Ok(Self { core })
    }

    /// Check out a resource, creating or waiting per the exhaustion policy.
    pub fn acquire(&self) -> PoolResult<Lease<L>> {
        PoolCore::acquire_inner(&self.core, None)
    }

    /// Like [`acquire`](Self::acquire), but interruptible through `token`.
    ///
    /// A cancelled wait returns [`PoolError::Cancelled`], distinct from the
    /// timeout's [`PoolError::Exhausted`].
    pub fn acquire_with(&self, token: &CancelToken) -> PoolResult<Lease<L>> {
        PoolCore::acquire_inner(&self.core, Some(token))
    }

    /// Return a leased resource.
    ///
    /// `Ok(true)` means the resource went back to the idle set, `Ok(false)`
    /// that it was destroyed (broken, past its lifetime, surplus, or the pool
    /// is closed). Resources that were never leased from this pool fail with
    /// [`PoolError::NotOwned`].
    pub fn release(&self, mut lease: Lease<L>) -> PoolResult<bool> {
        match lease.resource.take() {
            Some(resource) => self.core.give_back(lease.id, resource),
            None => Err(PoolError::NotOwned),
        }
    }

    /// Run one maintenance pass: evict stale idle entries, reclaim overdue
    /// checkouts, refill to `min_idle`.
    ///
    /// Idempotent; meant to be invoked periodically by whatever scheduler the
    /// embedding application owns.
    pub fn sweep(&self) -> SweepSummary {
        self.core.sweep()
    }

    /// Permanently stop the pool: destroy idle entries, wake waiters, refuse
    /// further acquisition. Resources still checked out are destroyed as they
    /// come back.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        !self.core.state.lock().running
    }

    /// Total resources currently owned by or lent out from the pool.
    pub fn size(&self) -> usize {
        let state = self.core.state.lock();
        state.idle.len() + state.active.len()
    }

    pub fn num_idle(&self) -> usize {
        self.core.state.lock().idle.len()
    }

    pub fn num_active(&self) -> usize {
        self.core.state.lock().active.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.core.state.lock().waiting
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.core.state.lock();
        state
            .stats
            .snapshot(state.idle.len(), state.active.len(), state.waiting)
    }
}

impl<L: ResourceLifecycle> Clone for ResourcePool<L> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<L: ResourceLifecycle> fmt::Debug for ResourcePool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("ResourcePool")
            .field("idle", &state.idle.len())
            .field("active", &state.active.len())
            .field("waiting", &state.waiting)
            .field("running", &state.running)
            .finish()
    }
}

impl<L: ResourceLifecycle> PoolCore<L> {
    fn acquire_inner(core: &Arc<Self>, token: Option<&CancelToken>) -> PoolResult<Lease<L>> {
        if core.config.track_owner {
            let state = core.state.lock();
            core.warn_if_thread_holds_resource(&state);
        }

        let deadline = core.config.max_wait.map(|wait| Instant::now() + wait);
        let mut watching = false;

        loop {
            let plan = {
                let mut state = core.state.lock();
                loop {
                    if !state.running {
                        return Err(PoolError::Closed);
                    }
                    if let Some(token) = token {
                        if token.is_cancelled() {
                            return Err(PoolError::Cancelled);
                        }
                    }
                    if let Some(entry) = state.idle.pop_back() {
                        state.active.insert(
                            entry.id,
                            ActiveEntry::checkout(entry.created_at, core.config.track_owner),
                        );
                        break CheckoutPlan::Reuse(entry);
                    }
                    let has_capacity = match core.config.max_active {
                        Some(max) => state.active.len() + state.creating < max,
                        None => true,
                    };
                    if has_capacity {
                        state.creating += 1;
                        break CheckoutPlan::Create;
                    }
                    match core.config.exhausted_action {
                        ExhaustedAction::Fail => return Err(core.exhausted(&state)),
                        ExhaustedAction::Grow => {
                            state.creating += 1;
                            break CheckoutPlan::Create;
                        }
                        ExhaustedAction::Block => {
                            if let Some(token) = token {
                                if !watching {
                                    token.watch(&core.available);
                                    watching = true;
                                }
                            }
                            state.waiting += 1;
                            let timed_out = match deadline {
                                Some(deadline) => core
                                    .available
                                    .wait_until(&mut state, deadline)
                                    .timed_out(),
                                None => {
                                    if token.is_some() {
                                        core.available.wait_for(&mut state, CANCEL_RECHECK);
                                    } else {
                                        core.available.wait(&mut state);
                                    }
                                    false
                                }
                            };
                            state.waiting -= 1;
                            if let Some(token) = token {
                                if token.is_cancelled() {
                                    return Err(PoolError::Cancelled);
                                }
                            }
                            if timed_out {
                                return Err(core.exhausted(&state));
                            }
                        }
                    }
                }
            };

            let (mut entry, fresh) = match plan {
                CheckoutPlan::Reuse(entry) => (entry, false),
                CheckoutPlan::Create => {
                    let resource = match core.lifecycle.create() {
                        Ok(resource) => resource,
                        Err(source) => {
                            let mut state = core.state.lock();
                            state.creating -= 1;
                            // Let one waiter contest the freed slot instead of
                            // starving behind a failed construction.
                            core.available.notify_one();
                            return Err(PoolError::CreateFailed { source });
                        }
                    };
                    let entry = PooledEntry::new(resource);
                    let mut state = core.state.lock();
                    state.creating -= 1;
                    if !state.running {
                        drop(state);
                        core.lifecycle.destroy(entry.resource);
                        return Err(PoolError::Closed);
                    }
                    state.stats.created += 1;
                    state.active.insert(
                        entry.id,
                        ActiveEntry::checkout(entry.created_at, core.config.track_owner),
                    );
                    (entry, true)
                }
            };

            let healthy = core.lifecycle.activate(&mut entry.resource)
                && (!core.config.test_on_activate
                    || core.lifecycle.validate(&mut entry.resource));
            if healthy {
                return Ok(Lease {
                    id: entry.id,
                    resource: Some(entry.resource),
                    core: Arc::downgrade(core),
                });
            }

            {
                let mut state = core.state.lock();
                state.active.remove(&entry.id);
                state.stats.broken += 1;
                state.stats.destroyed += 1;
                core.available.notify_one();
            }
            let entry_id = entry.id;
            core.lifecycle.destroy(entry.resource);
            if fresh {
                return Err(PoolError::create_failed(
                    "newly created resource failed activation",
                ));
            }
            debug!(entry = %entry_id, "idle resource failed activation; retrying");
        }
    }

    fn give_back(&self, id: Ulid, mut resource: L::Resource) -> PoolResult<bool> {
        let (created_at, checked_out_at, was_running) = {
            let state = self.state.lock();
            match state.active.get(&id) {
                Some(active) => (active.created_at, active.checked_out_at, state.running),
                None => {
                    drop(state);
                    error!(entry = %id, "released resource is not in this pool's active set");
                    self.lifecycle.destroy(resource);
                    self.state.lock().stats.destroyed += 1;
                    return Err(PoolError::NotOwned);
                }
            }
        };

        let mut broken = false;
        let mut poolable = was_running;
        if poolable && self.config.test_on_deactivate && !self.lifecycle.validate(&mut resource)
        {
            broken = true;
            poolable = false;
        }
        if poolable && !self.lifecycle.deactivate(&mut resource) {
            broken = true;
            poolable = false;
        }
        if poolable {
            if let Some(max_life) = self.config.max_life_time {
                if created_at.elapsed() > max_life {
                    poolable = false;
                }
            }
        }

        let to_destroy = {
            let mut state = self.state.lock();
            if state.active.remove(&id).is_none() {
                // Forcibly reclaimed while the probes ran.
                state.stats.destroyed += 1;
                drop(state);
                self.lifecycle.destroy(resource);
                return Err(PoolError::NotOwned);
            }
            if broken {
                state.stats.broken += 1;
            }
            state.stats.record_use_time(checked_out_at.elapsed());
            if !state.running {
                poolable = false;
            }
            let room = match self.config.max_idle {
                Some(max_idle) => state.idle.len() < max_idle,
                None => true,
            };
            let to_destroy = if poolable && room {
                state
                    .idle
                    .push_back(PooledEntry::restore(id, resource, created_at));
                None
            } else {
                state.stats.destroyed += 1;
                Some(resource)
            };
            self.available.notify_one();
            to_destroy
        };

        match to_destroy {
            Some(resource) => {
                self.lifecycle.destroy(resource);
                debug!(entry = %id, "destroyed returned resource");
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        // Idle scan, stalest first; the scan stops at the first entry that
        // stays, since the deque is ordered by staleness.
        loop {
            let candidate = {
                let mut state = self.state.lock();
                if !state.running {
                    return summary;
                }
                let Some(front) = state.idle.front() else {
                    break;
                };
                let expired = self
                    .config
                    .max_idle_time
                    .is_some_and(|limit| front.idle_time() > limit)
                    || self
                        .config
                        .max_life_time
                        .is_some_and(|limit| front.live_time() > limit);
                if expired {
                    state.stats.destroyed += 1;
                    state.idle.pop_front().map(|entry| (entry, true))
                } else if self.config.test_on_idle {
                    state.idle.pop_front().map(|entry| (entry, false))
                } else {
                    None
                }
            };
            match candidate {
                None => break,
                Some((entry, true)) => {
                    debug!(entry = %entry.id, "evicting expired idle resource");
                    self.lifecycle.destroy(entry.resource);
                    summary.evicted += 1;
                }
                Some((mut entry, false)) => {
                    let healthy = self.lifecycle.activate(&mut entry.resource)
                        && self.lifecycle.validate(&mut entry.resource)
                        && self.lifecycle.deactivate(&mut entry.resource);
                    if healthy {
                        self.state.lock().idle.push_front(entry);
                        break;
                    }
                    {
                        let mut state = self.state.lock();
                        state.stats.broken += 1;
                        state.stats.destroyed += 1;
                    }
                    debug!(entry = %entry.id, "evicting idle resource that failed its probe");
                    self.lifecycle.destroy(entry.resource);
                    summary.evicted += 1;
                }
            }
        }

        summary.reclaimed = self.reclaim_overdue();
        summary.refilled = self.refill();
        summary
    }

    /// Free the slots of checkouts held past the idle deadline.
    ///
    /// A fail-safe against callers that never release. The resource itself is
    /// destroyed when the forgotten lease finally drops.
    fn reclaim_overdue(&self) -> usize {
        let Some(max_hold) = self.config.max_idle_time else {
            return 0;
        };
        let mut state = self.state.lock();
        let overdue: Vec<Ulid> = state
            .active
            .iter()
            .filter(|(_, active)| active.held_for() > max_hold)
            .map(|(id, _)| *id)
            .collect();
        let reclaimed = overdue.len();
        for id in overdue {
            if let Some(active) = state.active.remove(&id) {
                let held_ms = active.held_for().as_millis() as u64;
                match &active.checkout_trace {
                    Some(trace) => warn!(
                        entry = %id,
                        held_ms,
                        "reclaiming resource held past its deadline; checkout origin:\n{trace}"
                    ),
                    None => warn!(
                        entry = %id,
                        held_ms,
                        "reclaiming resource held past its deadline (owner tracking disabled)"
                    ),
                }
                self.available.notify_one();
            }
        }
        reclaimed
    }

    fn refill(&self) -> usize {
        let mut refilled = 0;
        loop {
            {
                let state = self.state.lock();
                if !state.running || state.idle.len() >= self.config.min_idle {
                    break;
                }
            }
            match self.lifecycle.create() {
                Ok(resource) => {
                    let mut state = self.state.lock();
                    if !state.running {
                        drop(state);
                        self.lifecycle.destroy(resource);
                        break;
                    }
                    state.stats.created += 1;
                    state.idle.push_back(PooledEntry::new(resource));
                    self.available.notify_one();
                    refilled += 1;
                }
                Err(error) => {
                    warn!(error = %error, "could not refill idle set; deferring to the next sweep");
                    break;
                }
            }
        }
        refilled
    }

    fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.stats.destroyed += state.idle.len() as u64;
            let drained: Vec<PooledEntry<L::Resource>> = state.idle.drain(..).collect();
            self.available.notify_all();
            drained
        };
        for entry in drained {
            self.lifecycle.destroy(entry.resource);
        }
        debug!("pool closed");
    }

    fn warn_if_thread_holds_resource(&self, state: &PoolState<L::Resource>) {
        let current = thread::current().id();
        let held = state
            .active
            .iter()
            .find(|(_, active)| active.owner == Some(current));
        if let Some((id, active)) = held {
            let acquire_site = Backtrace::force_capture();
            match &active.checkout_trace {
                Some(trace) => warn!(
                    entry = %id,
                    "thread already holds a resource from this pool; earlier checkout:\n{trace}\nnew acquire:\n{acquire_site}"
                ),
                None => warn!(
                    entry = %id,
                    "thread already holds a resource from this pool; new acquire:\n{acquire_site}"
                ),
            }
        }
    }

    fn exhausted(&self, state: &PoolState<L::Resource>) -> PoolError {
        PoolError::Exhausted {
            active: state.active.len(),
            idle: state.idle.len(),
            waiting: state.waiting,
        }
    }
}

impl<L: ResourceLifecycle> Drop for PoolCore<L> {
    fn drop(&mut self) {
        for entry in self.state.get_mut().idle.drain(..) {
            self.lifecycle.destroy(entry.resource);
        }
    }
}
