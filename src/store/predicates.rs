//! WHERE-clause builder with numbered bind parameters
//!
//! Clauses reference parameters as `?N`, numbered in bind order, so a clause
//! may be spliced anywhere in the statement text (a JOIN as well as the
//! WHERE) without reordering the parameter list.

use std::rc::Rc;

use rusqlite::types::{ToSql, Value};
use rusqlite::ParamsFromIter;

use crate::types::{to_micros, RepoId, TimeBounds};

/// Accumulates predicates and their parameters
#[derive(Default)]
pub struct Predicates {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Predicates {
    /// Start with no predicates
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value, returning its placeholder
    pub fn bind<T: ToSql + 'static>(&mut self, value: T) -> String {
        self.params.push(Box::new(value));
        format!("?{}", self.params.len())
    }

    /// Bind a list of repository ids for use with `rarray(?N)`
    pub fn bind_ids(&mut self, ids: &[RepoId]) -> String {
        let values: Vec<Value> = ids.iter().map(|id| Value::Integer(i64::from(*id))).collect();
        self.bind(Rc::new(values))
    }

    /// Add a predicate
    pub fn push(&mut self, clause: impl Into<String>) {
        self.clauses.push(clause.into());
    }

    /// Add inclusive/exclusive time bounds on a microsecond column
    pub fn time_bounds(&mut self, column: &str, bounds: &TimeBounds) {
        if let Some(from) = bounds.from {
            let p = self.bind(to_micros(from));
            self.push(format!("{} >= {}", column, p));
        }
        if let Some(to) = bounds.to {
            let p = self.bind(to_micros(to));
            self.push(format!("{} <= {}", column, p));
        }
        if let Some(after) = bounds.after {
            let p = self.bind(to_micros(after));
            self.push(format!("{} > {}", column, p));
        }
    }

    /// Predicates joined with AND, or an always-true clause
    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            self.clauses.join("\n  AND ")
        }
    }

    /// Parameters in bind order
    pub fn params(&self) -> ParamsFromIter<std::slice::Iter<'_, Box<dyn ToSql>>> {
        rusqlite::params_from_iter(self.params.iter())
    }

    /// Number of bound parameters
    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}
