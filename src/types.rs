//! Core data types used throughout the insights store
//!
//! # Key Types
//!
//! - **`Sample`**: one recorded value for a series at an instant, optionally
//!   tied to a repository and a capture value
//! - **`Tier`**: which table a sample is written to (durable or ephemeral)
//! - **`SeriesPoint`**: an aggregated value per `(series, time, capture)`
//! - **`RecordingTime`**: an instant at which a series is expected to have data
//! - **`SeriesPointsOpts`**: the filter set for aggregate queries
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use insights_tsdb::types::{Sample, SeriesPointsOpts, Tier};
//!
//! let at = Utc.with_ymd_and_hms(2021, 9, 10, 10, 0, 0).unwrap();
//! let sample = Sample::new("s1", at, 1.5)
//!     .with_repository(3, "github.com/gorilla/mux")
//!     .in_tier(Tier::Snapshot);
//! assert!(sample.validate().is_ok());
//!
//! let opts = SeriesPointsOpts::for_series("s1").with_limit(10);
//! assert_eq!(opts.limit, 10);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result, ValidationError};

/// Repository identifier as assigned by the host system
pub type RepoId = i32;

/// Microseconds in one second
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Convert a timestamp to the stored representation (microseconds since epoch)
pub fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

/// Convert a stored timestamp back into a `DateTime<Utc>`
pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| Error::CorruptedRow(format!("timestamp {} out of range", micros)))
}

/// Floor a stored timestamp to whole seconds
///
/// Matches the SQL expression used by the push-down aggregation, including
/// for instants before the epoch.
pub fn truncate_micros_to_second(micros: i64) -> i64 {
    micros.div_euclid(MICROS_PER_SECOND) * MICROS_PER_SECOND
}

// ============================================================================
// Write-side types
// ============================================================================

/// Storage tier a sample is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Durable, long-retention samples
    Recorded,
    /// Ephemeral samples, pruned wholesale per series
    Snapshot,
}

impl Tier {
    /// Live table holding samples of this tier
    pub fn table(&self) -> &'static str {
        match self {
            Tier::Recorded => crate::store::schema::RECORDED_TABLE,
            Tier::Snapshot => crate::store::schema::SNAPSHOT_TABLE,
        }
    }

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Recorded => "recorded",
            Tier::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single sample to be written to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Stable series identifier
    pub series_id: String,
    /// Instant the value was observed (UTC)
    pub time: DateTime<Utc>,
    /// Observed value
    pub value: f64,
    /// Repository the value was observed in, if any
    pub repo_id: Option<RepoId>,
    /// Repository name; present iff `repo_id` is
    pub repo_name: Option<String>,
    /// Capture sub-key, if the series is partitioned
    pub capture: Option<String>,
    /// Target tier
    pub tier: Tier,
}

impl Sample {
    /// Create a durable sample without repository or capture
    pub fn new(series_id: impl Into<String>, time: DateTime<Utc>, value: f64) -> Self {
        Self {
            series_id: series_id.into(),
            time,
            value,
            repo_id: None,
            repo_name: None,
            capture: None,
            tier: Tier::Recorded,
        }
    }

    /// Attach a repository
    pub fn with_repository(mut self, repo_id: RepoId, repo_name: impl Into<String>) -> Self {
        self.repo_id = Some(repo_id);
        self.repo_name = Some(repo_name.into());
        self
    }

    /// Attach a capture value
    pub fn with_capture(mut self, capture: impl Into<String>) -> Self {
        self.capture = Some(capture.into());
        self
    }

    /// Select the tier
    pub fn in_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Check the sample invariants
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.series_id.is_empty() {
            return Err(ValidationError::EmptySeriesId);
        }
        if self.repo_id.is_some() != self.repo_name.is_some() {
            return Err(ValidationError::MismatchedRepository {
                series_id: self.series_id.clone(),
            });
        }
        if matches!(self.repo_name.as_deref(), Some("")) {
            return Err(ValidationError::EmptyRepositoryName {
                series_id: self.series_id.clone(),
            });
        }
        if !self.value.is_finite() {
            return Err(ValidationError::NonFiniteValue {
                series_id: self.series_id.clone(),
                value: self.value,
            });
        }
        Ok(())
    }
}

/// Stable and internal identifiers of one series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesRef {
    /// Stable string identifier used by samples
    pub series_id: String,
    /// Internal numeric identifier used by recording times
    pub id: i64,
}

impl SeriesRef {
    /// Create a series reference
    pub fn new(series_id: impl Into<String>, id: i64) -> Self {
        Self {
            series_id: series_id.into(),
            id,
        }
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.series_id.is_empty() {
            return Err(ValidationError::EmptySeriesId);
        }
        if self.id <= 0 {
            return Err(ValidationError::InvalidSeriesId(self.id));
        }
        Ok(())
    }
}

// ============================================================================
// Recording times
// ============================================================================

/// An instant at which a series is expected to have a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordingTime {
    /// The expected instant (UTC)
    pub timestamp: DateTime<Utc>,
    /// Whether the expectation belongs to the ephemeral tier
    pub snapshot: bool,
}

impl RecordingTime {
    /// Durable expectation
    pub fn recorded(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            snapshot: false,
        }
    }

    /// Ephemeral expectation
    pub fn snapshot(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            snapshot: true,
        }
    }
}

/// Recording times of one series
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecordingTimes {
    /// Internal series ID
    pub insight_series_id: i64,
    /// Expected instants
    pub recording_times: Vec<RecordingTime>,
}

impl SeriesRecordingTimes {
    /// Create an empty set for a series
    pub fn new(insight_series_id: i64) -> Self {
        Self {
            insight_series_id,
            recording_times: Vec::new(),
        }
    }

    /// Append an instant
    pub fn push(mut self, recording_time: RecordingTime) -> Self {
        self.recording_times.push(recording_time);
        self
    }
}

// ============================================================================
// Read-side types
// ============================================================================

/// Inclusive `from`/`to` and exclusive `after` bounds, all optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    /// Lower bound, inclusive
    pub from: Option<DateTime<Utc>>,
    /// Upper bound, inclusive
    pub to: Option<DateTime<Utc>>,
    /// Lower bound, exclusive
    pub after: Option<DateTime<Utc>>,
}

impl TimeBounds {
    /// Whether an instant satisfies every bound that is set
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| time >= from)
            && self.to.map_or(true, |to| time <= to)
            && self.after.map_or(true, |after| time > after)
    }
}

/// An aggregated value per series, instant and capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Stable series identifier
    pub series_id: String,
    /// Instant, truncated to whole seconds (UTC)
    pub time: DateTime<Utc>,
    /// Sum across authorized repositories of per-repository maxima
    pub value: f64,
    /// Capture value, if any
    pub capture: Option<String>,
}

impl SeriesPoint {
    /// Sort key: time first, absent capture before any capture
    pub fn sort_key(&self) -> (&str, DateTime<Utc>, Option<&str>) {
        (self.series_id.as_str(), self.time, self.capture.as_deref())
    }
}

impl fmt::Display for SeriesPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.capture {
            Some(capture) => write!(
                f,
                "SeriesPoint{{Time: {}, Capture: {:?}, Value: {}}}",
                self.time.to_rfc3339(),
                capture,
                self.value
            ),
            None => write!(
                f,
                "SeriesPoint{{Time: {}, Value: {}}}",
                self.time.to_rfc3339(),
                self.value
            ),
        }
    }
}

/// Sort points by `(series, time, capture)`
pub fn sort_points(points: &mut [SeriesPoint]) {
    points.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Options for aggregate queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesPointsOpts {
    /// Stable series ID to query, if set
    pub series_id: Option<String>,
    /// Internal series ID; required for augmentation
    pub id: Option<i64>,
    /// Restrict to a single repository, if set
    pub repo_id: Option<RepoId>,
    /// Repositories to exclude (merged with the permission filter)
    pub excluded: Vec<RepoId>,
    /// Repositories to restrict to, if non-empty
    pub included: Vec<RepoId>,
    /// Keep rows whose repository name matches any of these patterns
    pub include_repo_regex: Vec<String>,
    /// Drop rows whose repository name matches any of these patterns
    pub exclude_repo_regex: Vec<String>,
    /// Time bounds
    pub bounds: TimeBounds,
    /// Fill expected-but-missing instants with zeros
    pub supports_augmentation: bool,
    /// Maximum number of aggregated points, 0 for no limit
    pub limit: usize,
}

impl SeriesPointsOpts {
    /// Options selecting one series by its stable ID
    pub fn for_series(series_id: impl Into<String>) -> Self {
        Self {
            series_id: Some(series_id.into()),
            ..Default::default()
        }
    }

    /// Options selecting one series and enabling augmentation
    pub fn augmented(series: &SeriesRef) -> Self {
        Self {
            series_id: Some(series.series_id.clone()),
            id: Some(series.id),
            supports_augmentation: true,
            ..Default::default()
        }
    }

    /// Set the internal ID
    pub fn with_internal_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the time bounds
    pub fn with_bounds(mut self, bounds: TimeBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Add excluded repositories
    pub fn excluding(mut self, repos: impl IntoIterator<Item = RepoId>) -> Self {
        self.excluded.extend(repos);
        self
    }

    /// Add included repositories
    pub fn including(mut self, repos: impl IntoIterator<Item = RepoId>) -> Self {
        self.included.extend(repos);
        self
    }

    /// Set the result limit
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Compile-check the repository name patterns
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        for pattern in self
            .include_repo_regex
            .iter()
            .chain(self.exclude_repo_regex.iter())
            .filter(|p| !p.is_empty())
        {
            regex::Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        }
        if let Some(id) = self.id {
            if id <= 0 {
                return Err(ValidationError::InvalidSeriesId(id));
            }
        }
        Ok(())
    }
}

/// Options for counting raw durable samples
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDataOpts {
    /// Time bounds (`after` is honored too)
    pub bounds: TimeBounds,
    /// Restrict to one series
    pub series_id: Option<String>,
    /// Restrict to one repository
    pub repo_id: Option<RepoId>,
}

// ============================================================================
// Incomplete datapoints
// ============================================================================

/// Why a sample at an instant is known to be incomplete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncompleteReason {
    /// The producing job timed out
    Timeout,
    /// Unclassified failure
    Generic,
    /// The producing job hit its error limit
    ExceedsErrorLimit,
}

impl IncompleteReason {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            IncompleteReason::Timeout => "timeout",
            IncompleteReason::Generic => "generic",
            IncompleteReason::ExceedsErrorLimit => "exceeds-error-limit",
        }
    }

    /// Parse the stored representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(IncompleteReason::Timeout),
            "generic" => Some(IncompleteReason::Generic),
            "exceeds-error-limit" => Some(IncompleteReason::ExceedsErrorLimit),
            _ => None,
        }
    }
}

/// Incomplete markers of one series aggregated per `(reason, time)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteDatapoint {
    /// Reason shared by the grouped markers
    pub reason: IncompleteReason,
    /// Instant shared by the grouped markers
    pub time: DateTime<Utc>,
    /// Repositories flagged, sorted; markers without repository are omitted
    pub repo_ids: Vec<RepoId>,
}

/// Input for recording an incomplete marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddIncompleteDatapoint {
    /// Internal series ID
    pub series_id: i64,
    /// Repository, if the marker is repository specific
    pub repo_id: Option<RepoId>,
    /// Reason
    pub reason: IncompleteReason,
    /// Instant
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_sample_requires_name_and_id_together() {
        let mut sample = Sample::new("s", at(0), 1.0);
        sample.repo_id = Some(3);
        assert_eq!(
            sample.validate(),
            Err(ValidationError::MismatchedRepository {
                series_id: "s".into()
            })
        );

        let mut sample = Sample::new("s", at(0), 1.0);
        sample.repo_name = Some("repo".into());
        assert!(sample.validate().is_err());

        assert!(Sample::new("s", at(0), 1.0)
            .with_repository(3, "repo")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_sample_rejects_nan_and_empty_names() {
        assert!(matches!(
            Sample::new("s", at(0), f64::NAN).validate(),
            Err(ValidationError::NonFiniteValue { .. })
        ));
        assert!(matches!(
            Sample::new("s", at(0), 1.0).with_repository(1, "").validate(),
            Err(ValidationError::EmptyRepositoryName { .. })
        ));
        assert_eq!(
            Sample::new("", at(0), 1.0).validate(),
            Err(ValidationError::EmptySeriesId)
        );
    }

    #[test]
    fn test_truncation_floors_negative_instants() {
        assert_eq!(truncate_micros_to_second(1_500_000), 1_000_000);
        assert_eq!(truncate_micros_to_second(-1), -1_000_000);
        assert_eq!(truncate_micros_to_second(-1_000_000), -1_000_000);
        assert_eq!(truncate_micros_to_second(0), 0);
    }

    #[test]
    fn test_time_bounds() {
        let bounds = TimeBounds {
            from: Some(at(10)),
            to: Some(at(20)),
            after: None,
        };
        assert!(bounds.contains(at(10)));
        assert!(bounds.contains(at(20)));
        assert!(!bounds.contains(at(21)));

        let after = TimeBounds {
            after: Some(at(10)),
            ..Default::default()
        };
        assert!(!after.contains(at(10)));
        assert!(after.contains(at(11)));
    }

    #[test]
    fn test_opts_rejects_bad_pattern() {
        let mut opts = SeriesPointsOpts::for_series("s");
        opts.include_repo_regex = vec!["(unclosed".into()];
        assert!(matches!(
            opts.validate(),
            Err(ValidationError::InvalidPattern { .. })
        ));

        // Empty patterns are ignored
        opts.include_repo_regex = vec![String::new()];
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_point_display() {
        let point = SeriesPoint {
            series_id: "s".into(),
            time: at(0),
            value: 1.5,
            capture: Some("a".into()),
        };
        assert_eq!(
            point.to_string(),
            "SeriesPoint{Time: 1970-01-01T00:00:00+00:00, Capture: \"a\", Value: 1.5}"
        );
    }

    #[test]
    fn test_incomplete_reason_round_trip() {
        for reason in [
            IncompleteReason::Timeout,
            IncompleteReason::Generic,
            IncompleteReason::ExceedsErrorLimit,
        ] {
            assert_eq!(IncompleteReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(IncompleteReason::parse("nope"), None);
    }
}
