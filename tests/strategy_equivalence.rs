//! Property tests for the aggregation strategies
//!
//! Both strategies must agree bit for bit with each other and with a
//! straightforward model of "max per repository, then sum" on arbitrary
//! inputs.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, TimeZone, Utc};
use insights_tsdb::aggregation::{AggregationStrategy, InProcessAggregator, PushDownAggregator};
use insights_tsdb::ledger::insert_samples;
use insights_tsdb::store::schema::init_schema;
use insights_tsdb::{RepoId, Sample, SeriesPoint, SeriesPointsOpts, Tier, TimeBounds};
use proptest::prelude::*;
use rusqlite::Connection;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
}

fn conn_with(samples: &[Sample]) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    rusqlite::vtab::array::load_module(&conn).unwrap();
    init_schema(&conn).unwrap();
    insert_samples(&conn, samples).unwrap();
    conn
}

/// Values are tenths up to 1e8, so sums round and the summation order matters
fn sample_strategy() -> impl Strategy<Value = Sample> {
    (
        prop::sample::select(vec!["a", "b"]),
        0i64..5_000,
        0i64..1_000_000_000,
        prop::option::of(1i32..6),
        prop::option::of(prop::sample::select(vec!["x", "y"])),
        any::<bool>(),
    )
        .prop_map(|(series, offset_ms, tenths, repo, capture, snapshot)| {
            let mut sample = Sample::new(
                series,
                base() + Duration::milliseconds(offset_ms),
                tenths as f64 / 10.0,
            );
            if let Some(id) = repo {
                sample = sample.with_repository(id, format!("github.com/org/repo-{}", id));
            }
            if let Some(capture) = capture {
                sample = sample.with_capture(capture);
            }
            if snapshot {
                sample = sample.in_tier(Tier::Snapshot);
            }
            sample
        })
}

fn bounds_strategy() -> impl Strategy<Value = TimeBounds> {
    (
        prop::option::of(0i64..5_000),
        prop::option::of(0i64..5_000),
        prop::option::of(0i64..5_000),
    )
        .prop_map(|(from, to, after)| TimeBounds {
            from: from.map(|ms| base() + Duration::milliseconds(ms)),
            to: to.map(|ms| base() + Duration::milliseconds(ms)),
            after: after.map(|ms| base() + Duration::milliseconds(ms)),
        })
}

/// Compensated sum in the same order and with the same steps as SQLite's `SUM`
fn compensated_sum(values: impl IntoIterator<Item = f64>) -> f64 {
    let (mut sum, mut err) = (0.0_f64, 0.0_f64);
    for value in values {
        let t = sum + value;
        err += if sum.abs() > value.abs() {
            (sum - t) + value
        } else {
            (value - t) + sum
        };
        sum = t;
    }
    sum + err
}

/// Reference aggregation over the raw samples
fn model(samples: &[Sample], opts: &SeriesPointsOpts, denied: &[RepoId]) -> Vec<SeriesPoint> {
    let denied: HashSet<RepoId> = denied.iter().copied().collect();
    let mut maxima: BTreeMap<(String, i64, Option<String>), BTreeMap<Option<RepoId>, f64>> =
        BTreeMap::new();

    for sample in samples {
        if opts.series_id.as_deref().map_or(false, |id| id != sample.series_id) {
            continue;
        }
        if !opts.bounds.contains(sample.time) {
            continue;
        }
        if sample.repo_id.map_or(false, |id| denied.contains(&id)) {
            continue;
        }
        let key = (
            sample.series_id.clone(),
            sample.time.timestamp(),
            sample.capture.clone(),
        );
        let max = maxima
            .entry(key)
            .or_default()
            .entry(sample.repo_id)
            .or_insert(f64::NEG_INFINITY);
        *max = max.max(sample.value);
    }

    let mut points: Vec<SeriesPoint> = maxima
        .into_iter()
        .map(|((series_id, secs, capture), per_repo)| SeriesPoint {
            series_id,
            time: Utc.timestamp_opt(secs, 0).unwrap(),
            value: compensated_sum(per_repo.into_values()),
            capture,
        })
        .collect();
    insights_tsdb::types::sort_points(&mut points);
    if opts.limit > 0 {
        points.truncate(opts.limit);
    }
    points
}

fn assert_same(left: &[SeriesPoint], right: &[SeriesPoint]) -> Result<(), TestCaseError> {
    prop_assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(right.iter()) {
        prop_assert_eq!(&l.series_id, &r.series_id);
        prop_assert_eq!(l.time, r.time);
        prop_assert_eq!(&l.capture, &r.capture);
        prop_assert_eq!(l.value.to_bits(), r.value.to_bits(), "{} != {}", l, r);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Push-down and in-process aggregation agree with each other and the model
    #[test]
    fn strategies_are_equivalent(
        samples in prop::collection::vec(sample_strategy(), 0..80),
        denied in prop::collection::vec(1i32..7, 0..6),
        series in prop::option::of(prop::sample::select(vec!["a", "b"])),
        bounds in bounds_strategy(),
        limit in 0usize..6,
    ) {
        let conn = conn_with(&samples);
        let opts = SeriesPointsOpts {
            series_id: series.map(str::to_string),
            bounds,
            limit,
            ..Default::default()
        };

        let push_down = PushDownAggregator.aggregate(&conn, &opts, &denied).unwrap();
        let in_process = InProcessAggregator.aggregate(&conn, &opts, &denied).unwrap();
        let expected = model(&samples, &opts, &denied);

        assert_same(&push_down, &in_process)?;
        assert_same(&push_down, &expected)?;
    }

    /// Writing the same batch again never changes the aggregate
    #[test]
    fn duplicate_writes_are_idempotent(
        samples in prop::collection::vec(sample_strategy(), 1..40),
    ) {
        let conn = conn_with(&samples);
        let opts = SeriesPointsOpts::default();
        let before = PushDownAggregator.aggregate(&conn, &opts, &[]).unwrap();

        insert_samples(&conn, &samples).unwrap();
        let after_push_down = PushDownAggregator.aggregate(&conn, &opts, &[]).unwrap();
        let after_in_process = InProcessAggregator.aggregate(&conn, &opts, &[]).unwrap();

        assert_same(&before, &after_push_down)?;
        assert_same(&before, &after_in_process)?;
    }

    /// Denied repositories contribute nothing: the result equals aggregating
    /// a data set that never contained them
    #[test]
    fn denied_repositories_contribute_nothing(
        samples in prop::collection::vec(sample_strategy(), 0..60),
        denied in prop::collection::vec(1i32..6, 1..5),
    ) {
        let conn = conn_with(&samples);
        let opts = SeriesPointsOpts::default();

        let kept: Vec<Sample> = samples
            .iter()
            .filter(|s| s.repo_id.map_or(true, |id| !denied.contains(&id)))
            .cloned()
            .collect();
        let reduced = conn_with(&kept);
        let expected = PushDownAggregator.aggregate(&reduced, &opts, &[]).unwrap();

        for strategy in [
            &PushDownAggregator as &dyn AggregationStrategy,
            &InProcessAggregator,
        ] {
            let got = strategy.aggregate(&conn, &opts, &denied).unwrap();
            assert_same(&got, &expected)?;
        }
    }

    /// Excluding every repository leaves only repository-less samples
    #[test]
    fn full_exclusion_keeps_unattributed_samples(
        samples in prop::collection::vec(sample_strategy(), 0..60),
    ) {
        let conn = conn_with(&samples);
        let everyone: Vec<RepoId> = (1..6).collect();
        let opts = SeriesPointsOpts::default();

        let got = InProcessAggregator.aggregate(&conn, &opts, &everyone).unwrap();
        let unattributed: Vec<Sample> = samples.iter().filter(|s| s.repo_id.is_none()).cloned().collect();
        assert_same(&got, &model(&unattributed, &opts, &[]))?;
    }
}
