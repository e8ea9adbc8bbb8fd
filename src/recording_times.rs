//! Recording-time ledger
//!
//! Recording times are the instants at which a series is expected to have a
//! sample. `(series, instant, snapshot)` is unique; re-inserting an existing
//! tuple is a no-op.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::Result;
use crate::store::schema::{
    truncated_to_second, ARCHIVED_RECORDING_TIMES_TABLE, RECORDING_TIMES_TABLE,
};
use crate::store::{BatchInserter, Predicates};
use crate::types::{from_micros, to_micros, SeriesRecordingTimes, TimeBounds};

const RECORDING_TIME_COLUMNS: &[&str] = &["insight_series_id", "recording_time", "snapshot"];

/// Bulk-insert recording times, skipping tuples that already exist
///
/// Returns the number of rows actually inserted.
pub fn insert_recording_times(conn: &Connection, series: &[SeriesRecordingTimes]) -> Result<usize> {
    let mut inserter = BatchInserter::with_conflict(
        conn,
        RECORDING_TIMES_TABLE,
        RECORDING_TIME_COLUMNS,
        "ON CONFLICT DO NOTHING",
    );
    let mut submitted = 0;
    for entry in series {
        for recording_time in &entry.recording_times {
            inserter.insert(vec![
                Value::Integer(entry.insight_series_id),
                Value::Integer(to_micros(recording_time.timestamp)),
                Value::Integer(i64::from(recording_time.snapshot)),
            ])?;
            submitted += 1;
        }
    }
    inserter.flush()?;

    debug!(
        submitted,
        inserted = inserter.written(),
        "Recorded series recording times"
    );
    Ok(inserter.written())
}

/// Distinct recording instants of a series, floored to seconds, ascending
///
/// Bounds apply to the stored instant. Durable and snapshot recording times
/// at the same instant collapse into one.
pub fn recording_times(
    conn: &Connection,
    insight_series_id: i64,
    bounds: &TimeBounds,
) -> Result<Vec<DateTime<Utc>>> {
    let mut preds = Predicates::new();
    let id = preds.bind(insight_series_id);
    preds.push(format!("insight_series_id = {}", id));
    preds.time_bounds("recording_time", bounds);

    let sql = format!(
        "SELECT DISTINCT {} AS instant FROM {} WHERE {} ORDER BY instant ASC",
        truncated_to_second("recording_time"),
        RECORDING_TIMES_TABLE,
        preds.where_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    let micros = stmt
        .query_map(preds.params(), |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    micros.into_iter().map(from_micros).collect()
}

/// The n-th most recent recording time (0 is the newest), if there is one
pub fn offset_n_recording_time(
    conn: &Connection,
    insight_series_id: i64,
    n: usize,
    exclude_snapshot: bool,
) -> Result<Option<DateTime<Utc>>> {
    let mut sql = format!(
        "SELECT recording_time FROM {} WHERE insight_series_id = ?1",
        RECORDING_TIMES_TABLE
    );
    if exclude_snapshot {
        sql.push_str(" AND snapshot = 0");
    }
    sql.push_str(" ORDER BY recording_time DESC LIMIT 1 OFFSET ?2");

    let micros: Option<i64> = conn
        .query_row(&sql, rusqlite::params![insight_series_id, n as i64], |row| {
            row.get(0)
        })
        .optional()?;
    micros.map(from_micros).transpose()
}

/// Delete every recording time of a series, archived ones included
pub fn delete_all(conn: &Connection, insight_series_id: i64) -> Result<usize> {
    let mut deleted = 0;
    for table in [RECORDING_TIMES_TABLE, ARCHIVED_RECORDING_TIMES_TABLE] {
        deleted += conn.execute(
            &format!("DELETE FROM {} WHERE insight_series_id = ?1", table),
            [insight_series_id],
        )?;
    }
    Ok(deleted)
}

/// Delete only the snapshot recording times of a series
pub fn delete_snapshots(conn: &Connection, insight_series_id: i64) -> Result<usize> {
    Ok(conn.execute(
        &format!(
            "DELETE FROM {} WHERE insight_series_id = ?1 AND snapshot = 1",
            RECORDING_TIMES_TABLE
        ),
        [insight_series_id],
    )?)
}
