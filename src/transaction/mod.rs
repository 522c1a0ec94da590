//! Transaction-scoped connection management.
//!
//! A scope ties resource checkout to one logical unit of work (a request, a
//! job). Once a unit of work obtains a write resource, every later request in
//! the same scope sees that same physical resource, so the unit of work keeps
//! a single consistent view. Rollback replays a log of compensating actions
//! in reverse, covering side effects the write resource cannot undo itself.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ScopeManager                          │
//! │   (owns the provider, one active scope per unit of work)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │ Connection  │       │Compensation │
//!  │    Scope    │       │  Provider   │       │     Log     │
//!  │ (rw reuse)  │       │ (capability)│       │(reverse undo│
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tidepool::transaction::{PooledProvider, ScopeManager, ScopeOptions};
//!
//! let manager = ScopeManager::new(PooledProvider::shared(pool));
//!
//! manager.with_scope(ScopeOptions::new(), |scope| {
//!     let conn = scope.acquire_write()?;
//!     conn.apply(change)?;
//!     scope.add_compensation(RemoveUpload::new(path))?;
//!     Ok(())
//! })?;
//! ```

mod compensation;
mod error;
mod manager;
mod provider;
mod scope;

pub use compensation::{CompensationFailure, CompensationLog, UndoError, UndoableAction};
pub use error::{ProviderError, ScopeError, ScopeResult};
pub use manager::{ScopeManager, ScopeMetadata};
pub use provider::{
    ConnectionProvider, PooledProvider, PooledProviderError, TransactionalResource,
};
pub use scope::{ScopeOptions, TransactionScope};
