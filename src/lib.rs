//! Insights TSDB - time-series store for code insights
//!
//! This library records per-repository samples for insight series and
//! answers permission-aware aggregate queries over them:
//! - Two storage tiers: durable recorded samples and prunable snapshots
//! - Repository name registry with stable ids
//! - Recording-time ledger for expected sample instants
//! - Per-request repository deny-lists from a pluggable permission filter
//! - Two equivalent aggregation strategies (push-down SQL and in-process)
//! - Zero-value augmentation of missing instants
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use insights_tsdb::{AllowAll, InsightsStore, QueryContext, Sample, SeriesPointsOpts, Store};
//!
//! # async fn run() -> insights_tsdb::Result<()> {
//! let store = InsightsStore::builder()
//!     .with_store(Store::open_in_memory()?)
//!     .with_permissions(AllowAll)
//!     .build()
//!     .await?;
//!
//! let ctx = QueryContext::background();
//! store
//!     .record_series_points(&ctx, vec![Sample::new("s1", Utc::now(), 1.0).with_repository(3, "repo")])
//!     .await?;
//! let points = store.series_points(&ctx, SeriesPointsOpts::for_series("s1")).await?;
//! assert_eq!(points.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod engine;
pub mod error;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// SQLite-backed store: schema, connection handling, transactions
pub mod store;

/// Repository name registry
pub mod registry;

/// Sample ledger: writes, deletes, counts and incomplete markers
pub mod ledger;

/// Recording-time ledger
pub mod recording_times;

/// Per-request repository deny-lists
pub mod permissions;

/// Aggregation strategies for series points
pub mod aggregation;

/// Zero-value augmentation of aggregated points
pub mod augment;

/// Full-history export and archival
pub mod export;

// Re-export main types
pub use aggregation::{select_strategy, AggregationStrategy, DenyBitmap, StrategyKind};
pub use config::{AggregationMode, Config};
pub use context::{Actor, QueryContext};
pub use engine::{DeleteSummary, InsightsStore, InsightsStoreBuilder};
pub use error::{Error, Result, ValidationError};
pub use export::{ArchiveSummary, ExportOpts, SeriesPointForExport};
pub use ledger::WriteSummary;
pub use permissions::{AllowAll, PermissionFilter, StaticDenyList};
pub use store::Store;
pub use types::{
    AddIncompleteDatapoint, CountDataOpts, IncompleteDatapoint, IncompleteReason, RecordingTime,
    RepoId, Sample, SeriesPoint, SeriesPointsOpts, SeriesRecordingTimes, SeriesRef, Tier,
    TimeBounds,
};
