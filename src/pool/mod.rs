//! Generic thread-safe resource pooling.
//!
//! The pool lends out expensive-to-construct resources (database connections,
//! sockets, parsers) and reclaims them when the caller is done. It is the only
//! component that talks to the [`ResourceLifecycle`] capability: resources are
//! created and destroyed nowhere else.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ResourcePool                          │
//! │   (idle/active bookkeeping, blocking acquire, statistics)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  Resource   │       │ PoolConfig  │       │ CancelToken │
//!  │  Lifecycle  │       │ (exhaustion │       │ (interrupt  │
//!  │ (capability)│       │   policy)   │       │   waits)    │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tidepool::pool::{PoolConfig, ResourcePool};
//!
//! let config = PoolConfig::new()
//!     .min_idle(2)
//!     .max_active(Some(16));
//!
//! let pool = ResourcePool::new(config, MyLifecycle::default())?;
//!
//! let lease = pool.acquire()?;
//! lease.do_work()?;
//! pool.release(lease)?; // or just drop the lease
//!
//! // Periodically, from whatever scheduler the application owns:
//! pool.sweep();
//! ```

mod cancel;
mod config;
mod entry;
mod error;
mod lifecycle;
mod resource_pool;
mod stats;

pub use cancel::CancelToken;
pub use config::{ExhaustedAction, PoolConfig};
pub use error::{PoolError, PoolResult};
pub use lifecycle::{LifecycleError, ResourceLifecycle};
pub use resource_pool::{Lease, ResourcePool, SweepSummary};
pub use stats::PoolStats;
