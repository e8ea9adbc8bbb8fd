//! Explicit transaction handle
//!
//! A `StoreTransaction` owns the connection lock for its whole lifetime, so
//! no other operation interleaves with it. `commit` consumes the handle;
//! every other exit path (error, early return, cancellation, panic unwinding)
//! drops it, which rolls the transaction back.

use rusqlite::Connection;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use super::Store;
use crate::context::QueryContext;
use crate::error::{Error, Result};

/// How the transaction acquires the database lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Take the write lock up front; concurrent writers serialize at `begin`
    Immediate,
    /// Take locks lazily; used for read-only work
    Deferred,
}

impl TransactionMode {
    fn begin_sql(&self) -> &'static str {
        match self {
            TransactionMode::Immediate => "BEGIN IMMEDIATE",
            TransactionMode::Deferred => "BEGIN DEFERRED",
        }
    }
}

/// An open transaction on the store
pub struct StoreTransaction {
    store: Store,
    ctx: QueryContext,
    guard: Option<OwnedMutexGuard<Connection>>,
}

impl StoreTransaction {
    pub(crate) async fn begin(
        store: &Store,
        ctx: &QueryContext,
        mode: TransactionMode,
    ) -> Result<Self> {
        let guard = store.acquire(ctx).await?;
        let mut tx = Self {
            store: store.clone(),
            ctx: ctx.clone(),
            guard: Some(guard),
        };
        let sql = mode.begin_sql();
        tx.run(move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await?;
        debug!(?mode, "Transaction started");
        Ok(tx)
    }

    /// Run blocking work against the transaction's connection
    ///
    /// Fails with `Error::Cancelled` if the context is cancelled before or
    /// during the call; the transaction stays open so the caller's drop
    /// rolls it back.
    pub async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.guard.take().ok_or(Error::TransactionFinished)?;
        if let Err(e) = self.ctx.check() {
            self.guard = Some(guard);
            return Err(e);
        }

        let (guard, result) = self
            .store
            .run_blocking(&self.ctx, guard, move |conn| f(conn))
            .await?;
        self.guard = Some(guard);
        result
    }

    /// Commit; a cancelled context rolls back instead
    pub async fn commit(mut self) -> Result<()> {
        self.ctx.check()?;
        self.run(|conn| {
            conn.execute_batch("COMMIT")?;
            Ok(())
        })
        .await?;
        self.guard.take();
        debug!("Transaction committed");
        Ok(())
    }

    /// Roll back explicitly
    pub async fn rollback(mut self) -> Result<()> {
        let guard = self.guard.take().ok_or(Error::TransactionFinished)?;
        tokio::task::spawn_blocking(move || rollback_if_open(&guard)).await??;
        debug!("Transaction rolled back");
        Ok(())
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let rollback = move || {
            if let Err(e) = rollback_if_open(&guard) {
                warn!(error = %e, "Rollback of abandoned transaction failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(rollback);
            }
            Err(_) => rollback(),
        }
    }
}

pub(crate) fn rollback_if_open(conn: &Connection) -> Result<()> {
    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK")?;
    }
    Ok(())
}
