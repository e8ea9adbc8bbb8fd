//! The insights store facade
//!
//! Wires the sample ledger, registry, recording-time ledger, permission
//! filter, aggregation strategies and augmentation together behind async
//! methods. Every method takes a [`QueryContext`]; cancelling its token
//! aborts the call and rolls back any open transaction.

pub mod builder;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::aggregation::{select_strategy, StrategyKind};
use crate::augment::augment_series_points;
use crate::config::Config;
use crate::context::QueryContext;
use crate::error::{Result, ValidationError};
use crate::export::{self, ArchiveSummary, ExportOpts, SeriesPointForExport};
use crate::ledger::{self, WriteSummary};
use crate::metrics;
use crate::permissions::{merge_deny_lists, PermissionFilter};
use crate::recording_times;
use crate::registry;
use crate::store::Store;
use crate::types::{
    AddIncompleteDatapoint, CountDataOpts, IncompleteDatapoint, RepoId, Sample, SeriesPoint,
    SeriesPointsOpts, SeriesRecordingTimes, SeriesRef, TimeBounds,
};

pub use builder::InsightsStoreBuilder;

/// Rows removed by a delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    /// Samples removed
    pub samples: usize,
    /// Recording times removed
    pub recording_times: usize,
}

/// Time-series store for code insights
pub struct InsightsStore {
    store: Store,
    permissions: Arc<dyn PermissionFilter>,
    config: Config,
}

impl InsightsStore {
    /// Start building a store
    pub fn builder() -> InsightsStoreBuilder {
        InsightsStoreBuilder::new()
    }

    /// Backing store handle
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn observe<T>(operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            metrics::record_error(e, operation);
            debug!(operation, error = %e, "Operation failed");
        }
        result
    }

    /// The merged deny-list for this request
    async fn deny_list(&self, ctx: &QueryContext, caller: &[RepoId]) -> Result<Vec<RepoId>> {
        ctx.check()?;
        let denied = self.permissions.excluded_repository_ids(ctx).await?;
        Ok(merge_deny_lists(denied, caller))
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// Aggregated points for `opts`, using the configured strategy
    ///
    /// The permission filter's deny-list is merged with `opts.excluded`.
    /// With augmentation enabled, missing `(recording time, capture)` pairs
    /// are filled with zeros.
    pub async fn series_points(
        &self,
        ctx: &QueryContext,
        opts: SeriesPointsOpts,
    ) -> Result<Vec<SeriesPoint>> {
        self.series_points_using(ctx, opts, None).await
    }

    /// Aggregated points computed by a specific strategy
    pub async fn series_points_with(
        &self,
        ctx: &QueryContext,
        opts: SeriesPointsOpts,
        kind: StrategyKind,
    ) -> Result<Vec<SeriesPoint>> {
        self.series_points_using(ctx, opts, Some(kind)).await
    }

    async fn series_points_using(
        &self,
        ctx: &QueryContext,
        opts: SeriesPointsOpts,
        forced: Option<StrategyKind>,
    ) -> Result<Vec<SeriesPoint>> {
        let result: Result<Vec<SeriesPoint>> = async {
            opts.validate()?;
            let denied = self.deny_list(ctx, &opts.excluded).await?;
            let kind = forced.unwrap_or_else(|| {
                select_strategy(
                    self.config.query.aggregation,
                    self.config.query.in_process_deny_threshold,
                    denied.len(),
                )
            });

            let deny_len = denied.len();
            let start = Instant::now();
            let result = self
                .store
                .read(ctx, move |conn| {
                    let points = kind.strategy().aggregate(conn, &opts, &denied)?;
                    augment_series_points(conn, &opts, points)
                })
                .await;
            let elapsed = start.elapsed().as_secs_f64();
            metrics::record_query(kind.as_str(), deny_len, elapsed, result.is_ok());

            if let Ok(points) = &result {
                debug!(
                    strategy = %kind,
                    deny_len,
                    points = points.len(),
                    elapsed_ms = elapsed * 1000.0,
                    "Aggregated series points"
                );
            }
            result
        }
        .await;
        Self::observe("series_points", result)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Append samples atomically across both tiers
    ///
    /// The whole batch is validated first; one invalid sample rejects the
    /// batch before anything is written. An empty batch is a no-op.
    pub async fn record_series_points(
        &self,
        ctx: &QueryContext,
        samples: Vec<Sample>,
    ) -> Result<WriteSummary> {
        let result = self
            .record(ctx, samples, SeriesRecordingTimes::default())
            .await;
        Self::observe("record_series_points", result)
    }

    /// Append samples and their recording times in one transaction
    pub async fn record_series_points_and_recording_times(
        &self,
        ctx: &QueryContext,
        samples: Vec<Sample>,
        recording_times: SeriesRecordingTimes,
    ) -> Result<WriteSummary> {
        let result = self.record(ctx, samples, recording_times).await;
        Self::observe("record_series_points_and_recording_times", result)
    }

    async fn record(
        &self,
        ctx: &QueryContext,
        samples: Vec<Sample>,
        times: SeriesRecordingTimes,
    ) -> Result<WriteSummary> {
        ledger::validate_samples(&samples)?;
        if samples.is_empty() && times.recording_times.is_empty() {
            return Ok(WriteSummary::default());
        }

        let start = Instant::now();
        let submitted_times = times.recording_times.len();
        let mut tx = self.store.begin_transaction(ctx).await?;
        let summary = tx
            .run(move |conn| {
                let summary = ledger::insert_samples(conn, &samples)?;
                if !times.recording_times.is_empty() {
                    recording_times::insert_recording_times(conn, std::slice::from_ref(&times))?;
                }
                Ok(summary)
            })
            .await?;
        tx.commit().await?;

        metrics::record_write(
            summary.recorded,
            summary.snapshot,
            start.elapsed().as_secs_f64(),
        );
        metrics::record_recording_times(submitted_times);
        debug!(
            recorded = summary.recorded,
            snapshot = summary.snapshot,
            repo_names = summary.repo_names,
            recording_times = submitted_times,
            "Recorded series points"
        );
        Ok(summary)
    }

    // ========================================================================
    // Recording times
    // ========================================================================

    /// Insert recording times; existing tuples are left untouched
    ///
    /// Returns the number of newly inserted rows.
    pub async fn set_recording_times(
        &self,
        ctx: &QueryContext,
        series: Vec<SeriesRecordingTimes>,
    ) -> Result<usize> {
        let result: Result<usize> = async {
            let submitted: usize = series.iter().map(|s| s.recording_times.len()).sum();
            if submitted == 0 {
                return Ok(0);
            }
            let mut tx = self.store.begin_transaction(ctx).await?;
            let inserted = tx
                .run(move |conn| recording_times::insert_recording_times(conn, &series))
                .await?;
            tx.commit().await?;
            metrics::record_recording_times(submitted);
            Ok(inserted)
        }
        .await;
        Self::observe("set_recording_times", result)
    }

    /// Distinct recording instants of a series within `bounds`, ascending
    pub async fn recording_times(
        &self,
        ctx: &QueryContext,
        insight_series_id: i64,
        bounds: TimeBounds,
    ) -> Result<Vec<DateTime<Utc>>> {
        let result = self
            .store
            .read(ctx, move |conn| {
                recording_times::recording_times(conn, insight_series_id, &bounds)
            })
            .await;
        Self::observe("recording_times", result)
    }

    /// The n-th newest recording time, if the series has that many
    pub async fn offset_n_recording_time(
        &self,
        ctx: &QueryContext,
        insight_series_id: i64,
        n: usize,
        exclude_snapshot: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let result = self
            .store
            .read(ctx, move |conn| {
                recording_times::offset_n_recording_time(conn, insight_series_id, n, exclude_snapshot)
            })
            .await;
        Self::observe("offset_n_recording_time", result)
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Permanently delete a series: samples in every tier, archived history
    /// and all recording times
    pub async fn delete_series(
        &self,
        ctx: &QueryContext,
        series: &SeriesRef,
    ) -> Result<DeleteSummary> {
        let result: Result<DeleteSummary> = async {
            series.validate()?;
            let target = series.clone();
            let mut tx = self.store.begin_transaction(ctx).await?;
            let summary = tx
                .run(move |conn| {
                    Ok(DeleteSummary {
                        samples: ledger::delete_series_samples(conn, &target.series_id)?,
                        recording_times: recording_times::delete_all(conn, target.id)?,
                    })
                })
                .await?;
            tx.commit().await?;

            metrics::record_deleted("series", summary.samples);
            info!(
                series_id = %series.series_id,
                samples = summary.samples,
                recording_times = summary.recording_times,
                "Deleted series"
            );
            Ok(summary)
        }
        .await;
        Self::observe("delete_series", result)
    }

    /// Prune the ephemeral tier of a series
    ///
    /// Removes snapshot samples and snapshot recording times only.
    pub async fn delete_snapshots(
        &self,
        ctx: &QueryContext,
        series: &SeriesRef,
    ) -> Result<DeleteSummary> {
        let result: Result<DeleteSummary> = async {
            series.validate()?;
            let target = series.clone();
            let mut tx = self.store.begin_transaction(ctx).await?;
            let summary = tx
                .run(move |conn| {
                    Ok(DeleteSummary {
                        samples: ledger::delete_snapshot_samples(conn, &target.series_id)?,
                        recording_times: recording_times::delete_snapshots(conn, target.id)?,
                    })
                })
                .await?;
            tx.commit().await?;

            metrics::record_deleted("snapshots", summary.samples);
            info!(
                series_id = %series.series_id,
                samples = summary.samples,
                recording_times = summary.recording_times,
                "Pruned snapshots"
            );
            Ok(summary)
        }
        .await;
        Self::observe("delete_snapshots", result)
    }

    // ========================================================================
    // Counts and incomplete markers
    // ========================================================================

    /// Count raw durable samples
    pub async fn count_data(&self, ctx: &QueryContext, opts: CountDataOpts) -> Result<usize> {
        let result = self
            .store
            .read(ctx, move |conn| ledger::count_data(conn, &opts))
            .await;
        Self::observe("count_data", result)
    }

    /// Mark a sample as incomplete
    pub async fn add_incomplete_datapoint(
        &self,
        ctx: &QueryContext,
        input: AddIncompleteDatapoint,
    ) -> Result<()> {
        let result = self
            .store
            .with_conn(ctx, move |conn| ledger::add_incomplete_datapoint(conn, &input))
            .await;
        Self::observe("add_incomplete_datapoint", result)
    }

    /// Incomplete markers of a series grouped per `(reason, time)`
    pub async fn load_incomplete_datapoints(
        &self,
        ctx: &QueryContext,
        insight_series_id: i64,
    ) -> Result<Vec<IncompleteDatapoint>> {
        let result = self
            .store
            .read(ctx, move |conn| {
                ledger::load_incomplete_datapoints(conn, insight_series_id)
            })
            .await;
        Self::observe("load_incomplete_datapoints", result)
    }

    // ========================================================================
    // Export and archival
    // ========================================================================

    /// Every recorded value of a series, archived history first, with the
    /// deny-list applied
    pub async fn export_series(
        &self,
        ctx: &QueryContext,
        opts: ExportOpts,
    ) -> Result<Vec<SeriesPointForExport>> {
        let result: Result<Vec<SeriesPointForExport>> = async {
            opts.series.validate()?;
            let patterns = SeriesPointsOpts {
                include_repo_regex: opts.include_repo_regex.clone(),
                exclude_repo_regex: opts.exclude_repo_regex.clone(),
                ..Default::default()
            };
            patterns.validate()?;

            let denied = self.deny_list(ctx, &[]).await?;
            let rows = self
                .store
                .read(ctx, move |conn| export::export_series(conn, &opts))
                .await?;
            Ok(export::filter_export_rows(&denied, rows))
        }
        .await;
        Self::observe("export_series", result)
    }

    /// Move durable history older than `before` into the archive tables
    pub async fn archive_series(
        &self,
        ctx: &QueryContext,
        series: &SeriesRef,
        before: DateTime<Utc>,
    ) -> Result<ArchiveSummary> {
        let result: Result<ArchiveSummary> = async {
            series.validate()?;
            let target = series.clone();
            let mut tx = self.store.begin_transaction(ctx).await?;
            let summary = tx
                .run(move |conn| export::archive_series(conn, &target, before))
                .await?;
            tx.commit().await?;
            info!(
                series_id = %series.series_id,
                points = summary.points,
                recording_times = summary.recording_times,
                before = %before,
                "Archived series"
            );
            Ok(summary)
        }
        .await;
        Self::observe("archive_series", result)
    }

    // ========================================================================
    // Repository names
    // ========================================================================

    /// Resolve a repository name to its id, registering it if new
    pub async fn resolve_repo_name(&self, ctx: &QueryContext, name: &str) -> Result<i64> {
        let result: Result<i64> = async {
            if name.is_empty() {
                return Err(ValidationError::MissingField("repository name".to_string()).into());
            }
            let name = name.to_string();
            let mut tx = self.store.begin_transaction(ctx).await?;
            let id = tx.run(move |conn| registry::resolve(conn, &name)).await?;
            tx.commit().await?;
            Ok(id)
        }
        .await;
        Self::observe("resolve_repo_name", result)
    }

    /// Repository name registered under `id`
    pub async fn repo_name(&self, ctx: &QueryContext, id: i64) -> Result<Option<String>> {
        let result = self
            .store
            .read(ctx, move |conn| registry::name_for(conn, id))
            .await;
        Self::observe("repo_name", result)
    }
}
