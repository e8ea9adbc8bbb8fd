//! Push-down aggregation: one SQL statement does all the work
//!
//! The inner query takes the per-repository maximum per truncated instant,
//! which absorbs duplicate writes; the outer query sums those maxima. The
//! deny-list is a bound array joined against the union, so forbidden rows
//! never reach either aggregate.

use rusqlite::Connection;

use super::filters::RowFilter;
use super::{AggregationStrategy, StrategyKind};
use crate::error::Result;
use crate::store::schema::{truncated_to_second, LIVE_POINTS_UNION};
use crate::types::{from_micros, RepoId, SeriesPoint, SeriesPointsOpts};

/// Aggregates inside the store
#[derive(Debug, Clone, Copy, Default)]
pub struct PushDownAggregator;

impl PushDownAggregator {
    /// Render the statement and its parameters
    pub(crate) fn build(opts: &SeriesPointsOpts, denied: &[RepoId]) -> (String, RowFilter) {
        let mut filter = RowFilter::new(opts);
        let mut joins = filter.joins.clone();
        if !denied.is_empty() {
            let p = filter.preds.bind_ids(denied);
            joins.push_str(&format!(
                " LEFT JOIN (SELECT DISTINCT value AS excluded_repo FROM rarray({})) AS perm \
                 ON sp.repo_id = perm.excluded_repo",
                p
            ));
            filter.preds.push("perm.excluded_repo IS NULL");
        }

        let mut sql = format!(
            "SELECT sub.series_id, sub.interval_time, SUM(sub.value) AS value, sub.capture FROM (\n\
             SELECT sp.series_id, {trunc} AS interval_time, sp.repo_id, MAX(sp.value) AS value, sp.capture\n\
             FROM {union} AS sp{joins}\n\
             WHERE {preds}\n\
             GROUP BY sp.series_id, interval_time, sp.repo_id, sp.capture\n\
             ) AS sub\n\
             GROUP BY sub.series_id, sub.interval_time, sub.capture\n\
             ORDER BY sub.series_id, sub.interval_time, sub.capture",
            trunc = truncated_to_second("sp.time"),
            union = LIVE_POINTS_UNION,
            joins = joins,
            preds = filter.preds.where_clause(),
        );
        if opts.limit > 0 {
            sql.push_str(&format!("\nLIMIT {}", opts.limit));
        }
        (sql, filter)
    }
}

impl AggregationStrategy for PushDownAggregator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PushDown
    }

    fn aggregate(
        &self,
        conn: &Connection,
        opts: &SeriesPointsOpts,
        denied: &[RepoId],
    ) -> Result<Vec<SeriesPoint>> {
        let (sql, filter) = Self::build(opts, denied);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(filter.preds.params(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(series_id, time, value, capture)| {
                Ok(SeriesPoint {
                    series_id,
                    time: from_micros(time)?,
                    value,
                    capture,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_list_becomes_join() {
        let opts = SeriesPointsOpts::for_series("s1").with_limit(5);
        let (sql, filter) = PushDownAggregator::build(&opts, &[1, 2]);
        assert!(sql.contains("LEFT JOIN (SELECT DISTINCT value AS excluded_repo FROM rarray(?2))"));
        assert!(sql.contains("perm.excluded_repo IS NULL"));
        assert!(sql.ends_with("LIMIT 5"));
        assert_eq!(filter.preds.param_count(), 2);
    }

    #[test]
    fn test_no_deny_list_no_join() {
        let (sql, _) = PushDownAggregator::build(&SeriesPointsOpts::default(), &[]);
        assert!(!sql.contains("excluded_repo"));
        assert!(!sql.contains("LIMIT"));
    }
}
