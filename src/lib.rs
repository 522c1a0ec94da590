//! Tidepool - resource pooling with transaction-scoped checkout.
//!
//! This crate provides two building blocks for working with expensive,
//! connection-like resources:
//!
//! - A generic, thread-safe [`pool::ResourcePool`] that creates, lends,
//!   reclaims, validates, and destroys resources under a configurable
//!   exhaustion policy.
//! - A [`transaction::TransactionScope`] that ties resource checkout to one
//!   logical unit of work, reuses a single write resource consistently, and
//!   replays compensating actions in reverse on rollback.
//!
//! # Example
//!
//! ```
//! use tidepool::pool::{LifecycleError, PoolConfig, ResourceLifecycle, ResourcePool};
//!
//! struct Counters;
//!
//! impl ResourceLifecycle for Counters {
//!     type Resource = u32;
//!
//!     fn create(&self) -> Result<u32, LifecycleError> {
//!         Ok(42)
//!     }
//! }
//!
//! let pool = ResourcePool::new(PoolConfig::default(), Counters).unwrap();
//! let lease = pool.acquire().unwrap();
//! assert_eq!(*lease, 42);
//! drop(lease); // returned to the pool
//! assert_eq!(pool.num_idle(), 1);
//! ```

pub mod pool;
pub mod transaction;
