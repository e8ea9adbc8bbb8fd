//! Full-history export and archival
//!
//! Export walks recording times and attaches the samples stored at each one,
//! reading archived rows first and live rows (both tiers) after, so a series
//! reads as one history no matter how much of it was archived. Archival
//! moves old durable rows out of the live tables.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::store::schema::{
    ARCHIVED_POINTS_TABLE, ARCHIVED_RECORDING_TIMES_TABLE, LIVE_POINTS_UNION, RECORDED_TABLE,
    RECORDING_TIMES_TABLE, REPO_NAMES_TABLE,
};
use crate::store::Predicates;
use crate::types::{from_micros, to_micros, RepoId, SeriesRef};

/// Export request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOpts {
    /// Series to export
    pub series: SeriesRef,
    /// Keep rows whose repository name matches any of these patterns
    #[serde(default)]
    pub include_repo_regex: Vec<String>,
    /// Drop rows whose repository name matches any of these patterns
    #[serde(default)]
    pub exclude_repo_regex: Vec<String>,
}

impl ExportOpts {
    /// Export a whole series
    pub fn new(series: SeriesRef) -> Self {
        Self {
            series,
            include_repo_regex: Vec::new(),
            exclude_repo_regex: Vec::new(),
        }
    }
}

/// One exported row: a recording time and the sample stored at it, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPointForExport {
    /// Stable series id
    pub series_id: String,
    /// Recording time
    pub recording_time: DateTime<Utc>,
    /// Repository name, if the sample has one
    pub repo_name: Option<String>,
    /// Repository id, if the sample has one
    pub repo_id: Option<RepoId>,
    /// Sample value; 0 when nothing was stored at the recording time
    pub value: f64,
    /// Capture value
    pub capture: Option<String>,
}

/// Rows moved by one archival
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    /// Durable samples moved
    pub points: usize,
    /// Durable recording times moved
    pub recording_times: usize,
}

fn export_from(
    conn: &Connection,
    opts: &ExportOpts,
    recording_times_table: &str,
    points_relation: &str,
    out: &mut Vec<SeriesPointForExport>,
) -> Result<()> {
    let mut preds = Predicates::new();
    let id = preds.bind(opts.series.id);
    let series_id = preds.bind(opts.series.series_id.clone());

    let includes: Vec<String> = opts
        .include_repo_regex
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| format!("rn.name REGEXP {}", preds.bind(p.clone())))
        .collect();
    if !includes.is_empty() {
        preds.push(format!("({})", includes.join(" OR ")));
    }
    for pattern in opts.exclude_repo_regex.iter().filter(|p| !p.is_empty()) {
        let p = preds.bind(pattern.clone());
        preds.push(format!("NOT (rn.name REGEXP {})", p));
    }

    let sql = format!(
        "SELECT isrt.recording_time, rn.name, sp.repo_id, COALESCE(sp.value, 0) AS value, sp.capture\n\
         FROM (SELECT DISTINCT recording_time FROM {rt} WHERE insight_series_id = {id}) AS isrt\n\
         LEFT JOIN {points} AS sp ON sp.series_id = {series_id} AND sp.time = isrt.recording_time\n\
         LEFT JOIN {names} rn ON sp.repo_name_id = rn.id\n\
         WHERE {preds}\n\
         ORDER BY isrt.recording_time, sp.capture, sp.repo_id",
        rt = recording_times_table,
        id = id,
        points = points_relation,
        series_id = series_id,
        names = REPO_NAMES_TABLE,
        preds = preds.where_clause(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(preds.params(), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<RepoId>>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (time, repo_name, repo_id, value, capture) in rows {
        out.push(SeriesPointForExport {
            series_id: opts.series.series_id.clone(),
            recording_time: from_micros(time)?,
            repo_name,
            repo_id,
            value,
            capture,
        });
    }
    Ok(())
}

/// Every recorded value of a series, archived history first
pub fn export_series(conn: &Connection, opts: &ExportOpts) -> Result<Vec<SeriesPointForExport>> {
    let mut out = Vec::new();
    export_from(
        conn,
        opts,
        ARCHIVED_RECORDING_TIMES_TABLE,
        ARCHIVED_POINTS_TABLE,
        &mut out,
    )?;
    let archived = out.len();
    export_from(conn, opts, RECORDING_TIMES_TABLE, LIVE_POINTS_UNION, &mut out)?;
    debug!(
        series_id = %opts.series.series_id,
        archived,
        live = out.len() - archived,
        "Exported series"
    );
    Ok(out)
}

/// Drop rows the deny-list hides
///
/// With a non-empty deny-list, rows without a repository are hidden as well:
/// only actors with no exclusions at all may see them.
pub fn filter_export_rows(
    denied: &[RepoId],
    mut rows: Vec<SeriesPointForExport>,
) -> Vec<SeriesPointForExport> {
    if denied.is_empty() {
        return rows;
    }
    let denied: HashSet<RepoId> = denied.iter().copied().collect();
    rows.retain(|row| matches!(row.repo_id, Some(id) if !denied.contains(&id)));
    rows
}

/// Move durable samples and durable recording times older than `before`
/// into the archive tables
///
/// Must run inside a transaction.
pub fn archive_series(
    conn: &Connection,
    series: &SeriesRef,
    before: DateTime<Utc>,
) -> Result<ArchiveSummary> {
    let cutoff = to_micros(before);
    let columns = "series_id, time, value, repo_id, repo_name_id, original_repo_name_id, capture";

    let points = conn.execute(
        &format!(
            "INSERT INTO {archive} ({cols}) SELECT {cols} FROM {live} WHERE series_id = ?1 AND time < ?2",
            archive = ARCHIVED_POINTS_TABLE,
            cols = columns,
            live = RECORDED_TABLE
        ),
        rusqlite::params![series.series_id, cutoff],
    )?;
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE series_id = ?1 AND time < ?2",
            RECORDED_TABLE
        ),
        rusqlite::params![series.series_id, cutoff],
    )?;

    let recording_times = conn.execute(
        &format!(
            "INSERT INTO {archive} (insight_series_id, recording_time, snapshot) \
             SELECT insight_series_id, recording_time, snapshot FROM {live} \
             WHERE insight_series_id = ?1 AND recording_time < ?2 AND snapshot = 0 \
             ON CONFLICT DO NOTHING",
            archive = ARCHIVED_RECORDING_TIMES_TABLE,
            live = RECORDING_TIMES_TABLE
        ),
        rusqlite::params![series.id, cutoff],
    )?;
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE insight_series_id = ?1 AND recording_time < ?2 AND snapshot = 0",
            RECORDING_TIMES_TABLE
        ),
        rusqlite::params![series.id, cutoff],
    )?;

    debug!(
        series_id = %series.series_id,
        points,
        recording_times,
        "Archived series history"
    );
    Ok(ArchiveSummary {
        points,
        recording_times,
    })
}
