//! SQLite-backed persistence layer.
//!
//! Single point of truth for the coordinator's bookkeeping. The store opens
//! a pooled connection in WAL journal mode so long-running reads don't block
//! the sweep loops, initializes the schema idempotently, and offers a
//! transaction wrapper with one internal retry on transient lock contention.

use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::Result;
use crate::schema;

/// Default connection pool size for on-disk stores.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Handle to the durable store shared by every component.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at `path` with WAL journaling enabled.
    /// The `-wal` journal file lives alongside the database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        Self::connect(options, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open an in-memory store. Restricted to a single connection so every
    /// caller sees the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction owned by the pool.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Run `f` inside a transaction, committing on success.
    ///
    /// Transient contention (locked/busy database, pool timeout) gets one
    /// internal retry before the error propagates. Constraint violations are
    /// fatal and propagate unchanged.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> Fn(&'t mut Transaction<'static, Sqlite>) -> BoxFuture<'t, Result<T>>,
    {
        match self.run_tx(&f).await {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "transient store error, retrying transaction once");
                self.run_tx(&f).await
            }
            other => other,
        }
    }

    async fn run_tx<T, F>(&self, f: &F) -> Result<T>
    where
        F: for<'t> Fn(&'t mut Transaction<'static, Sqlite>) -> BoxFuture<'t, Result<T>>,
    {
        let mut tx = self.pool.begin().await?;
        let value = f(&mut tx).await?;
        tx.commit().await?;
        Ok(value)
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
