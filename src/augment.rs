//! Zero-value augmentation
//!
//! A series is expected to have one value per recording time and capture.
//! Where the aggregated result has no point for such a pair, a zero point is
//! synthesized so charts see a uniform sample density.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;
use crate::metrics;
use crate::recording_times;
use crate::types::{sort_points, SeriesPoint, SeriesPointsOpts};

/// Fill every missing `(recording time, capture)` pair with a zero point
///
/// Captures come from `points` (an absent capture counts as one), so an
/// empty result stays empty. Real points are kept whether or not they fall
/// on a recording time. Returns the points sorted and the number of zeros
/// added.
pub fn coalesce_zero_values(
    series_id: &str,
    mut points: Vec<SeriesPoint>,
    recording_times: &[DateTime<Utc>],
) -> (Vec<SeriesPoint>, usize) {
    let captures: BTreeSet<Option<String>> = points.iter().map(|p| p.capture.clone()).collect();
    let present: HashSet<(DateTime<Utc>, Option<String>)> = points
        .iter()
        .map(|p| (p.time, p.capture.clone()))
        .collect();

    let mut synthesized = 0;
    for time in recording_times {
        for capture in &captures {
            if present.contains(&(*time, capture.clone())) {
                continue;
            }
            points.push(SeriesPoint {
                series_id: series_id.to_string(),
                time: *time,
                value: 0.0,
                capture: capture.clone(),
            });
            synthesized += 1;
        }
    }

    sort_points(&mut points);
    (points, synthesized)
}

/// Augment an aggregated result if `opts` asks for it
///
/// Requires the stable series id, the internal id and the augmentation flag;
/// otherwise `points` is returned unchanged. Recording times are read with
/// the query's own bounds. A series without recording times is left as is.
pub fn augment_series_points(
    conn: &Connection,
    opts: &SeriesPointsOpts,
    points: Vec<SeriesPoint>,
) -> Result<Vec<SeriesPoint>> {
    let (Some(series_id), Some(id), true) = (&opts.series_id, opts.id, opts.supports_augmentation)
    else {
        return Ok(points);
    };

    let times = recording_times::recording_times(conn, id, &opts.bounds)?;
    if times.is_empty() {
        return Ok(points);
    }

    let (mut points, synthesized) = coalesce_zero_values(series_id, points, &times);
    if opts.limit > 0 {
        points.truncate(opts.limit);
    }
    metrics::record_augmented(synthesized);
    debug!(
        series_id = %series_id,
        recording_times = times.len(),
        synthesized,
        "Augmented series points"
    );
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn point(secs: i64, capture: Option<&str>, value: f64) -> SeriesPoint {
        SeriesPoint {
            series_id: "s".into(),
            time: at(secs),
            value,
            capture: capture.map(str::to_string),
        }
    }

    #[test]
    fn test_fills_missing_capture_at_instant() {
        // Points {20, a}, {24, a}, {24, b}; recording times 20 and 24.
        // {20, b} is missing.
        let points = vec![
            point(20, Some("a"), 1.0),
            point(24, Some("a"), 2.0),
            point(24, Some("b"), 3.0),
        ];
        let (out, synthesized) = coalesce_zero_values("s", points, &[at(20), at(24)]);
        assert_eq!(synthesized, 1);
        assert_eq!(
            out,
            vec![
                point(20, Some("a"), 1.0),
                point(20, Some("b"), 0.0),
                point(24, Some("a"), 2.0),
                point(24, Some("b"), 3.0),
            ]
        );
    }

    #[test]
    fn test_completeness_n_times_c_captures() {
        let points = vec![point(5, None, 1.0), point(5, Some("x"), 1.0), point(5, Some("y"), 1.0)];
        let times: Vec<_> = (0..4).map(|i| at(i * 10)).collect();
        let (out, _) = coalesce_zero_values("s", points, &times);

        // Four recording times times three captures, plus the off-grid originals
        assert_eq!(out.len(), 4 * 3 + 3);
        for time in &times {
            for capture in [None, Some("x"), Some("y")] {
                assert!(out
                    .iter()
                    .any(|p| p.time == *time && p.capture.as_deref() == capture));
            }
        }
    }

    #[test]
    fn test_no_points_means_nothing_to_fill() {
        let (out, synthesized) = coalesce_zero_values("s", Vec::new(), &[at(1), at(2)]);
        assert!(out.is_empty());
        assert_eq!(synthesized, 0);
    }

    #[test]
    fn test_disabled_returns_input() {
        let conn = Connection::open_in_memory().unwrap();
        let points = vec![point(1, None, 1.0)];
        let opts = SeriesPointsOpts::for_series("s");
        assert_eq!(
            augment_series_points(&conn, &opts, points.clone()).unwrap(),
            points
        );
    }
}
