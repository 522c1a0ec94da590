//! Bookkeeping wrappers around pooled resource instances.

use std::backtrace::Backtrace;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use ulid::Ulid;

/// An idle resource together with its pool metadata.
///
/// An entry sits in the idle deque while unclaimed. During checkout the
/// resource travels with the caller's lease and only an [`ActiveEntry`] stays
/// behind, so the sweeper can spot checkouts held past their deadline.
pub(crate) struct PooledEntry<T> {
    pub id: Ulid,
    pub resource: T,
    pub created_at: Instant,
    pub last_touched: Instant,
}

impl<T> PooledEntry<T> {
    pub fn new(resource: T) -> Self {
        let now = Instant::now();
        Self {
            id: Ulid::new(),
            resource,
            created_at: now,
            last_touched: now,
        }
    }

    /// Rebuild an entry for a resource coming back from checkout.
    pub fn restore(id: Ulid, resource: T, created_at: Instant) -> Self {
        Self {
            id,
            resource,
            created_at,
            last_touched: Instant::now(),
        }
    }

    /// Time since construction.
    pub fn live_time(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the entry was last checked out or returned.
    pub fn idle_time(&self) -> Duration {
        self.last_touched.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }
}

/// Metadata for a checked-out entry. The resource itself is with the caller.
pub(crate) struct ActiveEntry {
    pub created_at: Instant,
    pub checked_out_at: Instant,
    /// Set while checked out if owner tracking is enabled.
    pub owner: Option<ThreadId>,
    /// Captured at checkout if owner tracking is enabled; reported when a
    /// leak or double checkout is detected.
    pub checkout_trace: Option<Backtrace>,
}

impl ActiveEntry {
    pub fn checkout(created_at: Instant, track_owner: bool) -> Self {
        Self {
            created_at,
            checked_out_at: Instant::now(),
            owner: track_owner.then(|| thread::current().id()),
            checkout_trace: track_owner.then(Backtrace::force_capture),
        }
    }

    /// How long the current checkout has been outstanding.
    pub fn held_for(&self) -> Duration {
        self.checked_out_at.elapsed()
    }
}
