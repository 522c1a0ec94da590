//! Pool statistics.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of completed checkouts the use-time window remembers.
const USE_TIME_WINDOW: usize = 128;

/// Mutable counters maintained inside the pool lock.
#[derive(Debug, Default)]
pub(crate) struct StatsState {
    pub broken: u64,
    pub created: u64,
    pub destroyed: u64,
    use_times: VecDeque<Duration>,
    use_time_min: Option<Duration>,
    use_time_max: Option<Duration>,
}

impl StatsState {
    /// Record how long a completed checkout held its resource.
    pub fn record_use_time(&mut self, elapsed: Duration) {
        if self.use_times.len() == USE_TIME_WINDOW {
            self.use_times.pop_front();
        }
        self.use_times.push_back(elapsed);
        self.use_time_min = Some(match self.use_time_min {
            Some(min) => min.min(elapsed),
            None => elapsed,
        });
        self.use_time_max = Some(match self.use_time_max {
            Some(max) => max.max(elapsed),
            None => elapsed,
        });
    }

    pub fn snapshot(&self, idle: usize, active: usize, waiting: usize) -> PoolStats {
        let mean = if self.use_times.is_empty() {
            None
        } else {
            let total: Duration = self.use_times.iter().sum();
            Some(total.as_secs_f64() * 1000.0 / self.use_times.len() as f64)
        };
        PoolStats {
            idle,
            active,
            waiting,
            broken: self.broken,
            created: self.created,
            destroyed: self.destroyed,
            use_time_min_ms: self.use_time_min.map(|d| d.as_millis() as u64),
            use_time_max_ms: self.use_time_max.map(|d| d.as_millis() as u64),
            use_time_mean_ms: mean,
            taken_at: Utc::now(),
        }
    }
}

/// Point-in-time statistics snapshot, serializable for monitoring export.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Entries currently in the idle set.
    pub idle: usize,
    /// Entries currently checked out.
    pub active: usize,
    /// Callers blocked waiting for a resource.
    pub waiting: usize,
    /// Entries that failed validation, activation, or deactivation.
    pub broken: u64,
    /// Resources constructed over the pool's lifetime.
    pub created: u64,
    /// Resources destroyed over the pool's lifetime.
    pub destroyed: u64,
    /// Shortest completed checkout observed.
    pub use_time_min_ms: Option<u64>,
    /// Longest completed checkout observed.
    pub use_time_max_ms: Option<u64>,
    /// Mean checkout duration over the rolling window.
    pub use_time_mean_ms: Option<f64>,
    /// When this snapshot was taken.
    pub taken_at: DateTime<Utc>,
}
