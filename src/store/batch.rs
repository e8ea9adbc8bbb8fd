//! Multi-row batch inserts
//!
//! Rows are buffered and written as one `INSERT ... VALUES (...), (...)`
//! statement per chunk. A chunk never binds more parameters than SQLite
//! accepts in one statement.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::error::{Error, Result};

/// Maximum bind parameters per statement (`SQLITE_MAX_VARIABLE_NUMBER`)
pub const MAX_SQLITE_PARAMETERS: usize = 32_766;

/// Buffers rows for one table and flushes them in parameter-bounded chunks
pub struct BatchInserter<'conn> {
    conn: &'conn Connection,
    table: &'static str,
    columns: &'static [&'static str],
    on_conflict: Option<&'static str>,
    max_rows: usize,
    pending: Vec<Value>,
    written: usize,
}

impl<'conn> BatchInserter<'conn> {
    /// Create an inserter for plain appends
    pub fn new(
        conn: &'conn Connection,
        table: &'static str,
        columns: &'static [&'static str],
    ) -> Self {
        Self::with_max_parameters(conn, table, columns, MAX_SQLITE_PARAMETERS)
    }

    /// Create an inserter with a conflict clause, e.g. `ON CONFLICT DO NOTHING`
    pub fn with_conflict(
        conn: &'conn Connection,
        table: &'static str,
        columns: &'static [&'static str],
        on_conflict: &'static str,
    ) -> Self {
        let mut inserter = Self::new(conn, table, columns);
        inserter.on_conflict = Some(on_conflict);
        inserter
    }

    /// Create an inserter with a custom parameter budget per statement
    pub fn with_max_parameters(
        conn: &'conn Connection,
        table: &'static str,
        columns: &'static [&'static str],
        max_parameters: usize,
    ) -> Self {
        let max_rows = (max_parameters / columns.len().max(1)).max(1);
        Self {
            conn,
            table,
            columns,
            on_conflict: None,
            max_rows,
            pending: Vec::new(),
            written: 0,
        }
    }

    /// Buffer one row, flushing when the chunk is full
    pub fn insert(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Configuration(format!(
                "{} expects {} values per row, got {}",
                self.table,
                self.columns.len(),
                row.len()
            )));
        }
        self.pending.extend(row);
        if self.pending_rows() >= self.max_rows {
            self.flush()?;
        }
        Ok(())
    }

    /// Write every buffered row; returns rows affected by this flush
    pub fn flush(&mut self) -> Result<usize> {
        let rows = self.pending_rows();
        if rows == 0 {
            return Ok(0);
        }

        let sql = self.statement(rows);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let affected = stmt.execute(params_from_iter(self.pending.iter()))?;
        self.pending.clear();
        self.written += affected;

        debug!(table = self.table, rows, affected, "Flushed insert batch");
        Ok(affected)
    }

    /// Rows affected across every flush so far
    pub fn written(&self) -> usize {
        self.written
    }

    fn pending_rows(&self) -> usize {
        self.pending.len() / self.columns.len().max(1)
    }

    fn statement(&self, rows: usize) -> String {
        let placeholders = vec!["?"; self.columns.len()].join(", ");
        let tuple = format!("({})", placeholders);
        let values = vec![tuple.as_str(); rows].join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            self.columns.join(", "),
            values
        );
        if let Some(clause) = self.on_conflict {
            sql.push(' ');
            sql.push_str(clause);
        }
        sql
    }
}
