//! SQLite-backed store handle
//!
//! One connection guarded by an async mutex. Every statement runs on the
//! blocking pool; a cancelled `QueryContext` interrupts the running
//! statement through the connection's interrupt handle.
//!
//! Connections are prepared with:
//! - `busy_timeout` from configuration
//! - write-ahead logging for file-backed databases
//! - the `rarray()` table-valued function for bound id lists
//! - a `regexp(pattern, text)` scalar so `name REGEXP ?` works
//! - the schema in [`schema`]

pub mod batch;
pub mod predicates;
pub mod schema;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, InterruptHandle};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::context::QueryContext;
use crate::error::{Error, Result};

pub use batch::BatchInserter;
pub use predicates::Predicates;
pub use transaction::{StoreTransaction, TransactionMode};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared handle to the backing database
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database described by `config`
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let config = config.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&config)).await??;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = open_connection(&StorageConfig::in_memory())?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    /// Begin a write transaction (`BEGIN IMMEDIATE`)
    pub async fn begin_transaction(&self, ctx: &QueryContext) -> Result<StoreTransaction> {
        StoreTransaction::begin(self, ctx, TransactionMode::Immediate).await
    }

    /// Begin a transaction with an explicit mode
    pub async fn begin_transaction_with(
        &self,
        ctx: &QueryContext,
        mode: TransactionMode,
    ) -> Result<StoreTransaction> {
        StoreTransaction::begin(self, ctx, mode).await
    }

    /// Run blocking work against the connection outside any transaction
    pub async fn with_conn<T, F>(&self, ctx: &QueryContext, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.acquire(ctx).await?;
        let (_guard, result) = self.run_blocking(ctx, guard, f).await?;
        result
    }

    /// Run read-only work inside one deferred transaction, so every
    /// statement sees the same snapshot
    pub async fn read<T, F>(&self, ctx: &QueryContext, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(ctx, move |conn| {
            let tx = conn.transaction()?;
            let value = f(&*tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Lock the connection, giving up if the context is cancelled first
    pub(crate) async fn acquire(&self, ctx: &QueryContext) -> Result<OwnedMutexGuard<Connection>> {
        ctx.check()?;
        let guard = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            guard = self.conn.clone().lock_owned() => guard,
        };
        if !guard.is_autocommit() {
            // A previous holder unwound without closing its transaction
            warn!("Rolling back stale transaction");
            transaction::rollback_if_open(&guard)?;
        }
        Ok(guard)
    }

    /// Run `f` on the blocking pool, interrupting it if `ctx` is cancelled
    ///
    /// Hands the guard back so a transaction can keep the lock across calls.
    pub(crate) async fn run_blocking<T, F>(
        &self,
        ctx: &QueryContext,
        guard: OwnedMutexGuard<Connection>,
        f: F,
    ) -> Result<(OwnedMutexGuard<Connection>, Result<T>)>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut task = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let result = f(&mut guard);
            (guard, result)
        });

        // A finished task wins over a late cancellation so a completed
        // COMMIT is never reported as cancelled.
        let joined = tokio::select! {
            biased;
            joined = &mut task => joined,
            _ = ctx.cancelled() => {
                self.interrupt.interrupt();
                task.await
            }
        };

        let (guard, result) = joined?;
        let result = match result {
            Err(e) if e.is_interrupt() && ctx.is_cancelled() => Err(Error::Cancelled),
            other => other,
        };
        Ok((guard, result))
    }
}

fn open_connection(config: &StorageConfig) -> Result<Connection> {
    let conn = if config.is_in_memory() {
        Connection::open_in_memory()?
    } else {
        Connection::open(&config.database_path)?
    };

    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    if config.wal && !config.is_in_memory() {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(mode = %mode, "Write-ahead logging unavailable");
        }
    }

    rusqlite::vtab::array::load_module(&conn)?;
    register_regexp(&conn)?;
    schema::init_schema(&conn)?;

    info!(
        path = %config.database_path.display(),
        busy_timeout_ms = config.busy_timeout_ms,
        "Opened insights store"
    );
    Ok(conn)
}

/// Register `regexp(pattern, text)`, the function behind `text REGEXP pattern`
///
/// The compiled pattern is cached per statement. A NULL text yields NULL.
fn register_regexp(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let text = ctx
                .get_raw(1)
                .as_str_or_null()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(text.map(|t| regex.is_match(t)))
        },
    )?;
    Ok(())
}
