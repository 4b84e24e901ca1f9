//! High-level database handle.

use crate::{DatabasePool, DatabaseResult, PoolConfig, PoolState};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;

/// Cloneable handle over the connection pool.
///
/// `with_tx` is the "N writes, all-or-nothing" primitive: the closure
/// runs inside one immediate transaction, and any error rolls the
/// whole unit back. The standalone functions in [`crate::queries`] all
/// take `&Connection`, so they compose freely inside it.
#[derive(Clone)]
pub struct Database {
    pool: Arc<DatabasePool>,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path, config: PoolConfig) -> DatabaseResult<Self> {
        let pool = DatabasePool::open(path, config)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Run a closure against a pooled connection.
    pub fn with_conn<T, F>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> DatabaseResult<T>,
    {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Run a closure inside a single atomic transaction.
    ///
    /// The transaction takes the write lock up front (immediate
    /// behavior), commits on Ok, and rolls back on Err. Nothing the
    /// closure wrote survives an error.
    pub fn with_tx<T, F>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> DatabaseResult<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Get pool statistics for monitoring.
    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        self.pool.path()
    }

    /// Check that the store is reachable.
    pub fn health_check(&self) -> DatabaseResult<()> {
        self.pool.health_check()
    }
}
