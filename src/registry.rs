//! Repository name registry
//!
//! Maps repository names to small integer ids so samples reference a name
//! without repeating it. Entries are created lazily on the first write that
//! mentions a name and are never updated: a renamed repository gets a new
//! entry, and older samples keep pointing at the old one.
//!
//! Ids are not cached across calls. A cached id could outlive the
//! transaction that created it if that transaction rolls back.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Lookups retried after an insert lost a race to a concurrent writer
const MAX_LOOKUP_ATTEMPTS: usize = 3;

/// Resolve a repository name to its id, inserting it if absent
///
/// Idempotent: every call with the same name returns the same id.
pub fn resolve(conn: &Connection, name: &str) -> Result<i64> {
    let inserted = conn
        .prepare_cached("INSERT INTO repo_names(name) VALUES (?1) ON CONFLICT(name) DO NOTHING")?
        .execute([name])?;
    if inserted == 1 {
        let id = conn.last_insert_rowid();
        debug!(name, id, "Registered repository name");
        metrics::record_repo_name(true);
        return Ok(id);
    }

    for attempt in 1..=MAX_LOOKUP_ATTEMPTS {
        if let Some(id) = lookup(conn, name)? {
            metrics::record_repo_name(false);
            return Ok(id);
        }
        warn!(name, attempt, "Repository name vanished after conflicting insert");
    }

    Err(Error::CorruptedRow(format!(
        "repository name {:?} could not be resolved",
        name
    )))
}

/// Id of a name, if registered
pub fn lookup(conn: &Connection, name: &str) -> Result<Option<i64>> {
    Ok(conn
        .prepare_cached("SELECT id FROM repo_names WHERE name = ?1")?
        .query_row([name], |row| row.get(0))
        .optional()?)
}

/// Name registered under an id
pub fn name_for(conn: &Connection, id: i64) -> Result<Option<String>> {
    Ok(conn
        .prepare_cached("SELECT name FROM repo_names WHERE id = ?1")?
        .query_row([id], |row| row.get(0))
        .optional()?)
}

/// Resolves each distinct name once within a single write batch
#[derive(Debug, Default)]
pub struct BatchResolver {
    resolved: HashMap<String, i64>,
}

impl BatchResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a name, reusing ids already resolved in this batch
    pub fn resolve(&mut self, conn: &Connection, name: &str) -> Result<i64> {
        if let Some(id) = self.resolved.get(name) {
            return Ok(*id);
        }
        let id = resolve(conn, name)?;
        self.resolved.insert(name.to_string(), id);
        Ok(id)
    }

    /// Number of distinct names resolved
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// Whether nothing was resolved
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}
