//! In-process aggregation: one scan, one request-scoped map
//!
//! Raw rows of both tiers are streamed once. Each row is dropped if its
//! repository is in the deny set, otherwise folded into a bucket keyed by
//! `(series, truncated instant, capture)` that tracks the running maximum
//! per repository. Cost is independent of the deny-list size beyond
//! building the bitmap.
//!
//! The maxima are summed only once the scan is over, in repository order
//! (unattributed first) with Neumaier compensation. SQLite's `SUM` sees the
//! same values in the same order and compensates the same way, so both
//! strategies produce bit-identical values.

use std::collections::HashMap;

use rusqlite::Connection;
use tracing::trace;

use super::bitmap::DenyBitmap;
use super::filters::RowFilter;
use super::{AggregationStrategy, StrategyKind};
use crate::error::Result;
use crate::store::schema::LIVE_POINTS_UNION;
use crate::types::{
    from_micros, sort_points, truncate_micros_to_second, RepoId, SeriesPoint, SeriesPointsOpts,
};

/// Aggregates in the calling process
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessAggregator;

type BucketKey = (String, i64, Option<String>);

/// Per-repository maxima for one output point
#[derive(Debug, Default)]
struct Bucket {
    maxima: HashMap<Option<RepoId>, f64>,
}

impl Bucket {
    fn observe(&mut self, repo_id: Option<RepoId>, value: f64) {
        self.maxima
            .entry(repo_id)
            .and_modify(|max| {
                if value > *max {
                    *max = value;
                }
            })
            .or_insert(value);
    }

    /// Sum of the maxima, unattributed first then ascending repository id
    fn total(&self) -> f64 {
        let mut maxima: Vec<(Option<RepoId>, f64)> =
            self.maxima.iter().map(|(repo, max)| (*repo, *max)).collect();
        maxima.sort_unstable_by_key(|(repo, _)| *repo);
        neumaier_sum(maxima.into_iter().map(|(_, max)| max))
    }
}

/// Kahan-Babuska-Neumaier summation, step for step as SQLite's `SUM`
fn neumaier_sum(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0_f64;
    let mut err = 0.0_f64;
    for value in values {
        let t = sum + value;
        if sum.abs() > value.abs() {
            err += (sum - t) + value;
        } else {
            err += (value - t) + sum;
        }
        sum = t;
    }
    sum + err
}

impl InProcessAggregator {
    pub(crate) fn build(opts: &SeriesPointsOpts) -> (String, RowFilter) {
        let filter = RowFilter::new(opts);
        let sql = format!(
            "SELECT sp.series_id, sp.time, sp.value, sp.repo_id, sp.capture\n\
             FROM {union} AS sp{joins}\n\
             WHERE {preds}",
            union = LIVE_POINTS_UNION,
            joins = filter.joins,
            preds = filter.preds.where_clause(),
        );
        (sql, filter)
    }
}

impl AggregationStrategy for InProcessAggregator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::InProcess
    }

    fn aggregate(
        &self,
        conn: &Connection,
        opts: &SeriesPointsOpts,
        denied: &[RepoId],
    ) -> Result<Vec<SeriesPoint>> {
        let deny = DenyBitmap::from_ids(denied.iter().copied());
        let (sql, filter) = Self::build(opts);

        let mut buckets: HashMap<BucketKey, Bucket> = HashMap::new();
        let mut scanned = 0usize;
        let mut skipped = 0usize;

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(filter.preds.params())?;
        while let Some(row) = rows.next()? {
            scanned += 1;
            let repo_id: Option<RepoId> = row.get(3)?;
            if repo_id.map_or(false, |id| deny.contains(id)) {
                skipped += 1;
                continue;
            }
            let series_id: String = row.get(0)?;
            let time = truncate_micros_to_second(row.get::<_, i64>(1)?);
            let value: f64 = row.get(2)?;
            let capture: Option<String> = row.get(4)?;

            buckets
                .entry((series_id, time, capture))
                .or_default()
                .observe(repo_id, value);
        }
        trace!(scanned, skipped, buckets = buckets.len(), "In-process scan complete");

        let mut points = buckets
            .into_iter()
            .map(|((series_id, time, capture), bucket)| {
                Ok(SeriesPoint {
                    series_id,
                    time: from_micros(time)?,
                    value: bucket.total(),
                    capture,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        sort_points(&mut points);
        if opts.limit > 0 {
            points.truncate(opts.limit);
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::aggregation::PushDownAggregator;
    use crate::ledger::insert_samples;
    use crate::store::schema::init_schema;
    use crate::types::Sample;

    #[test]
    fn test_bucket_keeps_max_per_repo_and_sums() {
        let mut bucket = Bucket::default();
        bucket.observe(Some(1), 2.0);
        bucket.observe(Some(1), 5.0);
        bucket.observe(Some(1), 3.0);
        bucket.observe(Some(2), 1.0);
        bucket.observe(None, 4.0);
        bucket.observe(None, 0.5);
        assert_eq!(bucket.total(), 10.0);
    }

    #[test]
    fn test_neumaier_sum_recovers_lost_low_bits() {
        assert_eq!([1e16, 1.0, -1e16].iter().sum::<f64>(), 0.0);
        assert_eq!(neumaier_sum([1e16, 1.0, -1e16]), 1.0);
        assert_eq!(neumaier_sum(std::iter::empty()), 0.0);
    }

    #[test]
    fn test_large_fractional_sums_match_push_down_exactly() {
        let conn = Connection::open_in_memory().unwrap();
        rusqlite::vtab::array::load_module(&conn).unwrap();
        init_schema(&conn).unwrap();

        let at = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
        let values = [
            15_074_673.1,
            3_204_118.7,
            98_765_432.3,
            12_345_678.9,
            7.3,
            55_555_555.5,
            41_000_000.1,
            66_666_666.6,
            23_456_789.2,
            81_234_567.8,
            9_999_999.9,
            1_000_000.4,
        ];
        let samples: Vec<Sample> = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                // raise each repository's maximum several times
                let repo = (i % 5) as RepoId;
                let sample = Sample::new("s1", at, *value);
                if repo == 0 {
                    sample
                } else {
                    sample.with_repository(repo, format!("github.com/org/repo-{}", repo))
                }
            })
            .collect();
        insert_samples(&conn, &samples).unwrap();

        let opts = SeriesPointsOpts::for_series("s1");
        let push_down = PushDownAggregator.aggregate(&conn, &opts, &[]).unwrap();
        let in_process = InProcessAggregator.aggregate(&conn, &opts, &[]).unwrap();
        assert_eq!(push_down.len(), 1);
        assert_eq!(push_down, in_process);
        assert_eq!(push_down[0].value.to_bits(), in_process[0].value.to_bits());
    }

    #[test]
    fn test_scan_has_no_deny_predicate() {
        let (sql, filter) = InProcessAggregator::build(&SeriesPointsOpts::for_series("s1"));
        assert!(!sql.contains("excluded_repo"));
        assert_eq!(filter.preds.param_count(), 1);
    }
}
