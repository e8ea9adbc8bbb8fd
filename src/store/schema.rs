//! Persisted schema
//!
//! All timestamps are INTEGER microseconds since the Unix epoch (UTC).
//! `repo_name_id` and `original_repo_name_id` reference `repo_names.id`; the
//! original id is kept when a repository is later renamed.

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

/// Durable samples
pub const RECORDED_TABLE: &str = "series_points";
/// Ephemeral samples
pub const SNAPSHOT_TABLE: &str = "series_points_snapshots";
/// Archived durable samples
pub const ARCHIVED_POINTS_TABLE: &str = "archived_series_points";
/// Expected sampling instants
pub const RECORDING_TIMES_TABLE: &str = "insight_series_recording_times";
/// Archived expected sampling instants
pub const ARCHIVED_RECORDING_TIMES_TABLE: &str = "archived_insight_series_recording_times";
/// Repository name registry
pub const REPO_NAMES_TABLE: &str = "repo_names";
/// Incomplete sample markers
pub const INCOMPLETE_POINTS_TABLE: &str = "insight_series_incomplete_points";

/// Columns written for every sample, in insert order
pub const SAMPLE_COLUMNS: &[&str] = &[
    "series_id",
    "time",
    "value",
    "repo_id",
    "repo_name_id",
    "original_repo_name_id",
    "capture",
];

/// Both live tiers read as one relation
pub const LIVE_POINTS_UNION: &str = "(SELECT series_id, time, value, repo_id, repo_name_id, original_repo_name_id, capture FROM series_points \
     UNION ALL \
     SELECT series_id, time, value, repo_id, repo_name_id, original_repo_name_id, capture FROM series_points_snapshots)";

/// SQL expression flooring a microsecond column to whole seconds
///
/// `%` truncates toward zero, so the remainder is normalized before
/// subtracting to floor instants before the epoch as well.
pub fn truncated_to_second(column: &str) -> String {
    format!(
        "({col} - ((({col} % 1000000) + 1000000) % 1000000))",
        col = column
    )
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repo_names(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE CHECK (name <> '')
);

CREATE TABLE IF NOT EXISTS series_points(
  series_id TEXT NOT NULL,
  time INTEGER NOT NULL,
  value REAL NOT NULL,
  repo_id INTEGER,
  repo_name_id INTEGER REFERENCES repo_names(id),
  original_repo_name_id INTEGER REFERENCES repo_names(id),
  capture TEXT
);
CREATE INDEX IF NOT EXISTS series_points_series_id_time_idx ON series_points(series_id, time);
CREATE INDEX IF NOT EXISTS series_points_repo_id_idx ON series_points(repo_id);

CREATE TABLE IF NOT EXISTS series_points_snapshots(
  series_id TEXT NOT NULL,
  time INTEGER NOT NULL,
  value REAL NOT NULL,
  repo_id INTEGER,
  repo_name_id INTEGER REFERENCES repo_names(id),
  original_repo_name_id INTEGER REFERENCES repo_names(id),
  capture TEXT
);
CREATE INDEX IF NOT EXISTS series_points_snapshots_series_id_time_idx ON series_points_snapshots(series_id, time);

CREATE TABLE IF NOT EXISTS archived_series_points(
  series_id TEXT NOT NULL,
  time INTEGER NOT NULL,
  value REAL NOT NULL,
  repo_id INTEGER,
  repo_name_id INTEGER REFERENCES repo_names(id),
  original_repo_name_id INTEGER REFERENCES repo_names(id),
  capture TEXT
);
CREATE INDEX IF NOT EXISTS archived_series_points_series_id_time_idx ON archived_series_points(series_id, time);

CREATE TABLE IF NOT EXISTS insight_series_recording_times(
  insight_series_id INTEGER NOT NULL,
  recording_time INTEGER NOT NULL,
  snapshot INTEGER NOT NULL DEFAULT 0,
  UNIQUE(insight_series_id, recording_time, snapshot)
);

CREATE TABLE IF NOT EXISTS archived_insight_series_recording_times(
  insight_series_id INTEGER NOT NULL,
  recording_time INTEGER NOT NULL,
  snapshot INTEGER NOT NULL DEFAULT 0,
  UNIQUE(insight_series_id, recording_time, snapshot)
);

CREATE TABLE IF NOT EXISTS insight_series_incomplete_points(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  series_id INTEGER NOT NULL,
  repo_id INTEGER,
  reason TEXT NOT NULL,
  time INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS insight_series_incomplete_points_unique_idx
  ON insight_series_incomplete_points(series_id, reason, time, COALESCE(repo_id, -1));
"#;

/// Create every table and index that does not exist yet
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    debug!("Insights schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }

    #[test]
    fn test_truncation_expression_floors() {
        let conn = Connection::open_in_memory().unwrap();
        let sql = format!(
            "SELECT {} FROM (SELECT ?1 AS t)",
            truncated_to_second("t")
        );
        for (input, expected) in [
            (1_500_000_i64, 1_000_000_i64),
            (2_000_000, 2_000_000),
            (-1, -1_000_000),
            (-1_000_000, -1_000_000),
        ] {
            let got: i64 = conn.query_row(&sql, [input], |row| row.get(0)).unwrap();
            assert_eq!(got, expected, "input {}", input);
            assert_eq!(got, crate::types::truncate_micros_to_second(input));
        }
    }

    #[test]
    fn test_recording_times_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let insert = "INSERT INTO insight_series_recording_times(insight_series_id, recording_time, snapshot) \
                      VALUES (1, 1000000, 0) ON CONFLICT DO NOTHING";
        conn.execute(insert, []).unwrap();
        assert_eq!(conn.execute(insert, []).unwrap(), 0);
    }
}
