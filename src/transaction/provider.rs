//! Connection provider capabilities consumed by transaction scopes.

use std::error::Error;

use thiserror::Error as ThisError;
use tracing::warn;

use crate::pool::{Lease, PoolError, ResourceLifecycle, ResourcePool};

/// A resource that can take part in a transaction.
///
/// Implemented by concrete connection types so a [`PooledProvider`] can drive
/// their commit/rollback and auto-commit switching.
pub trait TransactionalResource {
    type Error: Error + Send + Sync + 'static;

    /// Whether the resource currently commits each operation on its own.
    fn auto_commit(&self) -> bool;

    fn set_auto_commit(&mut self, enabled: bool) -> Result<(), Self::Error>;

    fn commit(&mut self) -> Result<(), Self::Error>;

    fn rollback(&mut self) -> Result<(), Self::Error>;
}

/// Source of read and write connections for a transaction scope.
///
/// A provider may wrap an in-process [`ResourcePool`], a remote connection
/// broker, or anything else that can lend connection-like resources. The
/// scope never creates or destroys resources itself; it only borrows them
/// here and hands them back.
pub trait ConnectionProvider {
    type Conn;
    type Error: Error + Send + Sync + 'static;

    fn get_read(&self) -> Result<Self::Conn, Self::Error>;

    fn get_write(&self) -> Result<Self::Conn, Self::Error>;

    fn release_read(&self, conn: Self::Conn);

    fn release_write(&self, conn: Self::Conn);

    fn commit(&self, conn: &mut Self::Conn) -> Result<(), Self::Error>;

    fn rollback(&self, conn: &mut Self::Conn) -> Result<(), Self::Error>;

    fn auto_commit(&self, conn: &Self::Conn) -> Result<bool, Self::Error>;

    fn set_auto_commit(&self, conn: &mut Self::Conn, enabled: bool) -> Result<(), Self::Error>;
}

/// Error from a pool-backed provider: either the pool refused to lend, or the
/// resource itself failed a transactional operation.
#[derive(Debug, ThisError)]
pub enum PooledProviderError<E: Error + Send + Sync + 'static> {
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("resource error: {0}")]
    Resource(E),
}

/// A [`ConnectionProvider`] backed by in-process resource pools.
///
/// Read and write connections may come from two differently tuned pools or
/// from one shared pool (see [`shared`](Self::shared)).
pub struct PooledProvider<L: ResourceLifecycle> {
    read_pool: ResourcePool<L>,
    write_pool: ResourcePool<L>,
}

impl<L: ResourceLifecycle> PooledProvider<L> {
    pub fn new(read_pool: ResourcePool<L>, write_pool: ResourcePool<L>) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    /// Use one pool for both read and write connections.
    pub fn shared(pool: ResourcePool<L>) -> Self {
        Self {
            read_pool: pool.clone(),
            write_pool: pool,
        }
    }

    pub fn read_pool(&self) -> &ResourcePool<L> {
        &self.read_pool
    }

    pub fn write_pool(&self) -> &ResourcePool<L> {
        &self.write_pool
    }
}

impl<L> ConnectionProvider for PooledProvider<L>
where
    L: ResourceLifecycle,
    L::Resource: TransactionalResource,
{
    type Conn = Lease<L>;
    type Error = PooledProviderError<<L::Resource as TransactionalResource>::Error>;

    fn get_read(&self) -> Result<Self::Conn, Self::Error> {
        Ok(self.read_pool.acquire()?)
    }

    fn get_write(&self) -> Result<Self::Conn, Self::Error> {
        Ok(self.write_pool.acquire()?)
    }

    fn release_read(&self, conn: Self::Conn) {
        if let Err(error) = self.read_pool.release(conn) {
            warn!(error = %error, "read connection could not be returned");
        }
    }

    fn release_write(&self, conn: Self::Conn) {
        if let Err(error) = self.write_pool.release(conn) {
            warn!(error = %error, "write connection could not be returned");
        }
    }

    fn commit(&self, conn: &mut Self::Conn) -> Result<(), Self::Error> {
        conn.commit().map_err(PooledProviderError::Resource)
    }

    fn rollback(&self, conn: &mut Self::Conn) -> Result<(), Self::Error> {
        conn.rollback().map_err(PooledProviderError::Resource)
    }

    fn auto_commit(&self, conn: &Self::Conn) -> Result<bool, Self::Error> {
        Ok(conn.auto_commit())
    }

    fn set_auto_commit(&self, conn: &mut Self::Conn, enabled: bool) -> Result<(), Self::Error> {
        conn.set_auto_commit(enabled)
            .map_err(PooledProviderError::Resource)
    }
}
