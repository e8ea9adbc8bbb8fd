//! Sample ledger: the write path and bulk deletes
//!
//! Samples are plain appends. Nothing is deduplicated at write time; the
//! aggregation's per-repository maximum absorbs duplicate writes. Stored
//! samples are never updated, only deleted in bulk per series.

use rusqlite::types::Value;
use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result, ValidationError};
use crate::registry::BatchResolver;
use crate::store::schema::{
    ARCHIVED_POINTS_TABLE, INCOMPLETE_POINTS_TABLE, RECORDED_TABLE, SAMPLE_COLUMNS,
    SNAPSHOT_TABLE,
};
use crate::store::{BatchInserter, Predicates};
use crate::types::{
    from_micros, to_micros, AddIncompleteDatapoint, CountDataOpts, IncompleteDatapoint,
    IncompleteReason, RepoId, Sample, Tier,
};

/// Rows written by one batch, per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Durable samples written
    pub recorded: usize,
    /// Ephemeral samples written
    pub snapshot: usize,
    /// Distinct repository names resolved
    pub repo_names: usize,
}

impl WriteSummary {
    /// Samples written across both tiers
    pub fn total(&self) -> usize {
        self.recorded + self.snapshot
    }
}

/// Validate a whole batch before anything is written
pub fn validate_samples(samples: &[Sample]) -> std::result::Result<(), ValidationError> {
    samples.iter().try_for_each(Sample::validate)
}

/// Append samples to their tiers
///
/// Must run inside a transaction: a failure part way leaves earlier inserts
/// for the caller's rollback to discard.
pub fn insert_samples(conn: &Connection, samples: &[Sample]) -> Result<WriteSummary> {
    let mut resolver = BatchResolver::new();
    let mut recorded = BatchInserter::new(conn, Tier::Recorded.table(), SAMPLE_COLUMNS);
    let mut snapshot = BatchInserter::new(conn, Tier::Snapshot.table(), SAMPLE_COLUMNS);

    for sample in samples {
        let repo_name_id = match sample.repo_name.as_deref() {
            Some(name) => Value::Integer(resolver.resolve(conn, name)?),
            None => Value::Null,
        };
        let row = vec![
            Value::Text(sample.series_id.clone()),
            Value::Integer(to_micros(sample.time)),
            Value::Real(sample.value),
            sample
                .repo_id
                .map_or(Value::Null, |id| Value::Integer(i64::from(id))),
            repo_name_id.clone(),
            repo_name_id,
            sample.capture.clone().map_or(Value::Null, Value::Text),
        ];
        match sample.tier {
            Tier::Recorded => recorded.insert(row)?,
            Tier::Snapshot => snapshot.insert(row)?,
        }
    }
    recorded.flush()?;
    snapshot.flush()?;

    Ok(WriteSummary {
        recorded: recorded.written(),
        snapshot: snapshot.written(),
        repo_names: resolver.len(),
    })
}

/// Delete every sample of a series: both live tiers and the archive
pub fn delete_series_samples(conn: &Connection, series_id: &str) -> Result<usize> {
    let mut deleted = 0;
    for table in [RECORDED_TABLE, SNAPSHOT_TABLE, ARCHIVED_POINTS_TABLE] {
        deleted += conn.execute(
            &format!("DELETE FROM {} WHERE series_id = ?1", table),
            [series_id],
        )?;
    }
    debug!(series_id, deleted, "Deleted series samples");
    Ok(deleted)
}

/// Delete the ephemeral samples of a series
pub fn delete_snapshot_samples(conn: &Connection, series_id: &str) -> Result<usize> {
    let deleted = conn.execute(
        &format!("DELETE FROM {} WHERE series_id = ?1", Tier::Snapshot.table()),
        [series_id],
    )?;
    debug!(series_id, deleted, "Pruned snapshot samples");
    Ok(deleted)
}

/// Count raw durable samples
pub fn count_data(conn: &Connection, opts: &CountDataOpts) -> Result<usize> {
    let mut preds = Predicates::new();
    preds.time_bounds("time", &opts.bounds);
    if let Some(series_id) = &opts.series_id {
        let p = preds.bind(series_id.clone());
        preds.push(format!("series_id = {}", p));
    }
    if let Some(repo_id) = opts.repo_id {
        let p = preds.bind(repo_id);
        preds.push(format!("repo_id = {}", p));
    }

    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {}",
        RECORDED_TABLE,
        preds.where_clause()
    );
    let count: i64 = conn.query_row(&sql, preds.params(), |row| row.get(0))?;
    Ok(count as usize)
}

/// Record an incomplete marker; re-adding the same marker is a no-op
pub fn add_incomplete_datapoint(conn: &Connection, input: &AddIncompleteDatapoint) -> Result<()> {
    if input.series_id <= 0 {
        return Err(ValidationError::InvalidSeriesId(input.series_id).into());
    }
    conn.execute(
        &format!(
            "INSERT INTO {} (series_id, repo_id, reason, time) VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
            INCOMPLETE_POINTS_TABLE
        ),
        rusqlite::params![
            input.series_id,
            input.repo_id,
            input.reason.as_str(),
            to_micros(input.time)
        ],
    )?;
    Ok(())
}

/// Incomplete markers of a series grouped per `(reason, time)`
pub fn load_incomplete_datapoints(
    conn: &Connection,
    series_id: i64,
) -> Result<Vec<IncompleteDatapoint>> {
    if series_id <= 0 {
        return Err(ValidationError::InvalidSeriesId(series_id).into());
    }
    let sql = format!(
        "SELECT reason, time, json_group_array(repo_id) FROM {} \
         WHERE series_id = ?1 GROUP BY reason, time ORDER BY time, reason",
        INCOMPLETE_POINTS_TABLE
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([series_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(reason, time, repo_ids)| {
            let reason = IncompleteReason::parse(&reason).ok_or_else(|| {
                Error::CorruptedRow(format!("unknown incomplete reason {:?}", reason))
            })?;
            let ids: Vec<Option<RepoId>> = serde_json::from_str(&repo_ids)
                .map_err(|e| Error::CorruptedRow(format!("incomplete repo ids: {}", e)))?;
            let mut repo_ids: Vec<RepoId> = ids.into_iter().flatten().collect();
            repo_ids.sort_unstable();
            Ok(IncompleteDatapoint {
                reason,
                time: from_micros(time)?,
                repo_ids,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::init_schema;
    use chrono::{DateTime, TimeZone, Utc};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_insert_routes_tiers_and_shares_name_ids() {
        let conn = conn();
        let samples = vec![
            Sample::new("s1", at(1), 1.0).with_repository(3, "repo-a"),
            Sample::new("s1", at(2), 2.0)
                .with_repository(3, "repo-a")
                .in_tier(Tier::Snapshot),
            Sample::new("s1", at(3), 3.0).with_capture("x"),
        ];
        let summary = insert_samples(&conn, &samples).unwrap();
        assert_eq!(summary.recorded, 2);
        assert_eq!(summary.snapshot, 1);
        assert_eq!(summary.repo_names, 1);

        for (tier, expected) in [(Tier::Recorded, 2i64), (Tier::Snapshot, 1)] {
            let rows: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", tier.table()), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(rows, expected, "{}", tier.as_str());
        }

        let (name_id, original_id): (i64, i64) = conn
            .query_row(
                "SELECT repo_name_id, original_repo_name_id FROM series_points_snapshots",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name_id, original_id);
    }

    #[test]
    fn test_validate_rejects_whole_batch() {
        let mut bad = Sample::new("s1", at(1), 1.0);
        bad.repo_id = Some(1);
        let samples = vec![Sample::new("s1", at(1), 1.0), bad];
        assert!(validate_samples(&samples).is_err());
    }

    #[test]
    fn test_count_data_reads_durable_tier_only() {
        let conn = conn();
        insert_samples(
            &conn,
            &[
                Sample::new("s1", at(10), 1.0).with_repository(1, "a"),
                Sample::new("s1", at(20), 1.0).with_repository(2, "b"),
                Sample::new("s1", at(30), 1.0).in_tier(Tier::Snapshot),
                Sample::new("s2", at(10), 1.0),
            ],
        )
        .unwrap();

        assert_eq!(count_data(&conn, &CountDataOpts::default()).unwrap(), 3);
        let opts = CountDataOpts {
            series_id: Some("s1".into()),
            repo_id: Some(2),
            ..Default::default()
        };
        assert_eq!(count_data(&conn, &opts).unwrap(), 1);
    }

    #[test]
    fn test_delete_series_leaves_other_series() {
        let conn = conn();
        insert_samples(
            &conn,
            &[
                Sample::new("s1", at(10), 1.0),
                Sample::new("s1", at(20), 1.0).in_tier(Tier::Snapshot),
                Sample::new("s2", at(10), 1.0),
            ],
        )
        .unwrap();
        assert_eq!(delete_series_samples(&conn, "s1").unwrap(), 2);
        assert_eq!(count_data(&conn, &CountDataOpts::default()).unwrap(), 1);
    }

    #[test]
    fn test_incomplete_datapoints_grouped() {
        let conn = conn();
        for repo_id in [Some(5), Some(2), None, Some(5)] {
            add_incomplete_datapoint(
                &conn,
                &AddIncompleteDatapoint {
                    series_id: 1,
                    repo_id,
                    reason: IncompleteReason::Timeout,
                    time: at(100),
                },
            )
            .unwrap();
        }
        add_incomplete_datapoint(
            &conn,
            &AddIncompleteDatapoint {
                series_id: 1,
                repo_id: None,
                reason: IncompleteReason::Generic,
                time: at(50),
            },
        )
        .unwrap();

        let points = load_incomplete_datapoints(&conn, 1).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].reason, IncompleteReason::Generic);
        assert!(points[0].repo_ids.is_empty());
        assert_eq!(points[1].reason, IncompleteReason::Timeout);
        assert_eq!(points[1].repo_ids, vec![2, 5]);

        assert!(load_incomplete_datapoints(&conn, 0).is_err());
    }
}
