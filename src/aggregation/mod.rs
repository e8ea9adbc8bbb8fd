//! Aggregation query engine
//!
//! Turns raw samples into one value per `(series, instant, capture)`:
//!
//! 1. read the union of both tiers, filtered by series, repository,
//!    allow-list, time bounds and repository name patterns
//! 2. floor each instant to whole seconds
//! 3. drop rows whose repository is denied (rows without a repository are
//!    never dropped by the deny-list)
//! 4. take the maximum per `(series, repository, instant, capture)`
//! 5. sum the maxima per `(series, instant, capture)`
//! 6. order by `(series, instant, capture)`, absent capture first, then
//!    apply the limit
//!
//! Two strategies implement these steps and must agree on every input:
//! [`PushDownAggregator`] hands the whole pipeline to SQLite, while
//! [`InProcessAggregator`] scans rows once and aggregates in memory with a
//! [`DenyBitmap`] for the deny test. The push-down deny join grows with the
//! deny-list, so large deny-lists favor the in-process strategy.

mod bitmap;
mod filters;
mod in_process;
mod push_down;

use std::fmt;

use rusqlite::Connection;

use crate::config::AggregationMode;
use crate::error::Result;
use crate::types::{RepoId, SeriesPoint, SeriesPointsOpts};

pub use bitmap::DenyBitmap;
pub use in_process::InProcessAggregator;
pub use push_down::PushDownAggregator;

/// One way of computing aggregated series points
pub trait AggregationStrategy: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> StrategyKind;

    /// Aggregate rows matching `opts`, ignoring repositories in `denied`
    ///
    /// `denied` is the merged deny-list; it may contain duplicates.
    fn aggregate(
        &self,
        conn: &Connection,
        opts: &SeriesPointsOpts,
        denied: &[RepoId],
    ) -> Result<Vec<SeriesPoint>>;
}

/// Strategy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// [`PushDownAggregator`]
    PushDown,
    /// [`InProcessAggregator`]
    InProcess,
}

impl StrategyKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::PushDown => "push_down",
            StrategyKind::InProcess => "in_process",
        }
    }

    /// The strategy implementation
    pub fn strategy(&self) -> &'static dyn AggregationStrategy {
        static PUSH_DOWN: PushDownAggregator = PushDownAggregator;
        static IN_PROCESS: InProcessAggregator = InProcessAggregator;
        match self {
            StrategyKind::PushDown => &PUSH_DOWN,
            StrategyKind::InProcess => &IN_PROCESS,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a strategy for a query with a deny-list of `deny_len` ids
pub fn select_strategy(mode: AggregationMode, threshold: usize, deny_len: usize) -> StrategyKind {
    match mode {
        AggregationMode::PushDown => StrategyKind::PushDown,
        AggregationMode::InProcess => StrategyKind::InProcess,
        AggregationMode::Auto if deny_len >= threshold => StrategyKind::InProcess,
        AggregationMode::Auto => StrategyKind::PushDown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::init_schema;
    use crate::types::{Sample, Tier};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        rusqlite::vtab::array::load_module(&conn).unwrap();
        init_schema(&conn).unwrap();
        crate::ledger::insert_samples(
            &conn,
            &[
                // Duplicate writes for repo 1 within the same second
                Sample::new("s1", at(10), 2.0).with_repository(1, "r1"),
                Sample::new("s1", at(10) + Duration::milliseconds(300), 5.0)
                    .with_repository(1, "r1"),
                Sample::new("s1", at(10), 1.0)
                    .with_repository(2, "r2")
                    .in_tier(Tier::Snapshot),
                Sample::new("s1", at(10), 4.0).with_repository(3, "r3"),
                Sample::new("s1", at(10), 0.5).with_capture("x").with_repository(1, "r1"),
                Sample::new("s1", at(20), 7.0),
                Sample::new("s2", at(10), 100.0).with_repository(1, "r1"),
            ],
        )
        .unwrap();
        conn
    }

    fn run(kind: StrategyKind, opts: &SeriesPointsOpts, denied: &[RepoId]) -> Vec<(i64, Option<String>, f64)> {
        let conn = seeded();
        kind.strategy()
            .aggregate(&conn, opts, denied)
            .unwrap()
            .into_iter()
            .map(|p| (p.time.timestamp(), p.capture, p.value))
            .collect()
    }

    #[test]
    fn test_max_then_sum_both_strategies() {
        let opts = SeriesPointsOpts::for_series("s1");
        let expected = vec![
            (10, None, 10.0),
            (10, Some("x".to_string()), 0.5),
            (20, None, 7.0),
        ];
        assert_eq!(run(StrategyKind::PushDown, &opts, &[]), expected);
        assert_eq!(run(StrategyKind::InProcess, &opts, &[]), expected);
    }

    #[test]
    fn test_denied_repository_contributes_nothing() {
        let opts = SeriesPointsOpts::for_series("s1");
        let expected = vec![(10, None, 5.0), (20, None, 7.0)];
        assert_eq!(run(StrategyKind::PushDown, &opts, &[1, 1]), expected);
        assert_eq!(run(StrategyKind::InProcess, &opts, &[1, 1]), expected);
    }

    #[test]
    fn test_limit_applies_after_ordering() {
        let opts = SeriesPointsOpts::for_series("s1").with_limit(2);
        for kind in [StrategyKind::PushDown, StrategyKind::InProcess] {
            let got = run(kind, &opts, &[]);
            assert_eq!(got.len(), 2, "{}", kind);
            assert_eq!(got[1].1.as_deref(), Some("x"));
        }
    }

    #[test]
    fn test_select_strategy() {
        assert_eq!(
            select_strategy(AggregationMode::Auto, 10, 9),
            StrategyKind::PushDown
        );
        assert_eq!(
            select_strategy(AggregationMode::Auto, 10, 10),
            StrategyKind::InProcess
        );
        assert_eq!(
            select_strategy(AggregationMode::PushDown, 0, 1_000_000),
            StrategyKind::PushDown
        );
        assert_eq!(
            select_strategy(AggregationMode::InProcess, 10, 0),
            StrategyKind::InProcess
        );
    }
}
