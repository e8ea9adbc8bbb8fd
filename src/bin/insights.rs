//! Insights TSDB command line tool
//!
//! Operates on a store directly, without a server in front of it.
//!
//! # CLI Commands
//!
//! - `init` - Create the database and schema
//! - `check-config` - Validate configuration file
//! - `count` - Count raw durable samples
//! - `points` - Print aggregated series points as JSON
//! - `compare` - Run both aggregation strategies and diff the results
//! - `prune-snapshots` - Delete the snapshot tier of a series
//! - `metrics` - Print Prometheus metrics
//!
//! # Configuration
//!
//! The tool reads configuration from:
//! 1. `--config` (path to TOML file)
//! 2. `INSIGHTS_CONFIG` environment variable
//! 3. `./insights.toml` in current directory
//! 4. Default configuration
//!
//! Environment overrides (`INSIGHTS_DB_PATH`, ...) apply on top.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use insights_tsdb::{
    metrics, AllowAll, Config, CountDataOpts, InsightsStore, QueryContext, SeriesPointsOpts,
    SeriesRef, StrategyKind, TimeBounds,
};
use tracing::{debug, info};

/// Insights TSDB - time-series store for code insights
#[derive(Parser)]
#[command(name = "insights")]
#[command(version)]
#[command(about = "Time-series store for code insights", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides INSIGHTS_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override database path
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

/// Time window shared by query commands
#[derive(clap::Args)]
struct Window {
    /// Inclusive lower bound (RFC 3339)
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Inclusive upper bound (RFC 3339)
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Exclusive lower bound (RFC 3339)
    #[arg(long)]
    after: Option<DateTime<Utc>>,
}

impl Window {
    fn bounds(&self) -> TimeBounds {
        TimeBounds {
            from: self.from,
            to: self.to,
            after: self.after,
        }
    }
}

/// Aggregate query arguments
#[derive(clap::Args)]
struct PointsArgs {
    /// Stable series id
    #[arg(long)]
    series: String,

    /// Internal series id; enables augmentation together with --augment
    #[arg(long)]
    id: Option<i64>,

    /// Restrict to one repository
    #[arg(long)]
    repo: Option<i32>,

    /// Repository ids to exclude
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<i32>,

    /// Repository ids to restrict to
    #[arg(long, value_delimiter = ',')]
    include: Vec<i32>,

    /// Keep repositories whose name matches
    #[arg(long)]
    include_repo_regex: Vec<String>,

    /// Drop repositories whose name matches
    #[arg(long)]
    exclude_repo_regex: Vec<String>,

    /// Fill missing recording times with zeros
    #[arg(long)]
    augment: bool,

    /// Maximum number of points (0 for no limit)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    #[command(flatten)]
    window: Window,
}

impl PointsArgs {
    fn opts(&self) -> SeriesPointsOpts {
        SeriesPointsOpts {
            series_id: Some(self.series.clone()),
            id: self.id,
            repo_id: self.repo,
            excluded: self.exclude.clone(),
            included: self.include.clone(),
            include_repo_regex: self.include_repo_regex.clone(),
            exclude_repo_regex: self.exclude_repo_regex.clone(),
            bounds: self.window.bounds(),
            supports_augmentation: self.augment,
            limit: self.limit,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema
    Init,

    /// Validate configuration file
    CheckConfig,

    /// Count raw durable samples
    Count {
        /// Restrict to one series
        #[arg(long)]
        series: Option<String>,

        /// Restrict to one repository
        #[arg(long)]
        repo: Option<i32>,

        #[command(flatten)]
        window: Window,
    },

    /// Print aggregated series points as JSON
    Points {
        /// Force a strategy (push_down, in_process); defaults to the configured mode
        #[arg(long)]
        strategy: Option<String>,

        #[command(flatten)]
        args: PointsArgs,
    },

    /// Run both aggregation strategies and report differences
    Compare {
        #[command(flatten)]
        args: PointsArgs,
    },

    /// Delete the snapshot tier of a series
    PruneSnapshots {
        /// Stable series id
        #[arg(long)]
        series: String,

        /// Internal series id
        #[arg(long)]
        id: i64,
    },

    /// Print Prometheus metrics
    Metrics,
}

// =============================================================================
// Setup
// =============================================================================

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("INSIGHTS_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let local = Path::new("insights.toml");
            local.exists().then(|| local.to_path_buf())
        });

    let mut config = match path {
        Some(path) => Config::from_file_with_env(&path)?,
        None => Config::from_env()?,
    };
    if let Some(database) = &cli.database {
        config.storage.database_path = database.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &Config) -> Result<InsightsStore, Box<dyn std::error::Error>> {
    let store = InsightsStore::builder()
        .with_config(config.clone())
        .with_permissions(AllowAll)
        .build()
        .await?;
    debug!(database = ?config.storage.database_path, "Store opened");
    Ok(store)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

fn cmd_check_config(config: &Config) {
    println!("Configuration is valid!");
    println!();
    println!("Storage:");
    println!("  Database: {:?}", config.storage.database_path);
    println!("  Busy timeout: {} ms", config.storage.busy_timeout_ms);
    println!("  WAL: {}", config.storage.wal);
    println!();
    println!("Query:");
    println!("  Aggregation: {}", config.query.aggregation);
    println!(
        "  In-process deny threshold: {}",
        config.query.in_process_deny_threshold
    );
    println!();
    println!("Monitoring:");
    println!("  Metrics enabled: {}", config.monitoring.metrics_enabled);
    println!("  Log level: {}", config.monitoring.log_level);
}

async fn cmd_points(
    store: &InsightsStore,
    ctx: &QueryContext,
    strategy: Option<&str>,
    args: &PointsArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.opts();
    let points = match strategy {
        Some(name) => {
            let kind = match name {
                "push_down" | "push-down" => StrategyKind::PushDown,
                "in_process" | "in-process" => StrategyKind::InProcess,
                other => return Err(format!("unknown strategy: {}", other).into()),
            };
            store.series_points_with(ctx, opts, kind).await?
        },
        None => store.series_points(ctx, opts).await?,
    };
    print_json(&points)
}

async fn cmd_compare(
    store: &InsightsStore,
    ctx: &QueryContext,
    args: &PointsArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let push_down = store
        .series_points_with(ctx, args.opts(), StrategyKind::PushDown)
        .await?;
    let in_process = store
        .series_points_with(ctx, args.opts(), StrategyKind::InProcess)
        .await?;

    let mismatches: Vec<_> = push_down
        .iter()
        .zip(in_process.iter())
        .filter(|(a, b)| a != b)
        .map(|(a, b)| serde_json::json!({ "push_down": a, "in_process": b }))
        .collect();

    let report = serde_json::json!({
        "series_id": args.series,
        "push_down_points": push_down.len(),
        "in_process_points": in_process.len(),
        "equivalent": push_down.len() == in_process.len() && mismatches.is_empty(),
        "mismatches": mismatches,
    });
    print_json(&report)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Commands::CheckConfig = cli.command {
        cmd_check_config(&config);
        return Ok(());
    }

    init_tracing(&config);
    let ctx = QueryContext::background();

    match &cli.command {
        Commands::Init => {
            open_store(&config).await?;
            info!(database = ?config.storage.database_path, "Database initialized");
        },
        Commands::CheckConfig => {},
        Commands::Count {
            series,
            repo,
            window,
        } => {
            let store = open_store(&config).await?;
            let count = store
                .count_data(
                    &ctx,
                    CountDataOpts {
                        bounds: window.bounds(),
                        series_id: series.clone(),
                        repo_id: *repo,
                    },
                )
                .await?;
            print_json(&serde_json::json!({ "count": count }))?;
        },
        Commands::Points { strategy, args } => {
            let store = open_store(&config).await?;
            cmd_points(&store, &ctx, strategy.as_deref(), args).await?;
        },
        Commands::Compare { args } => {
            let store = open_store(&config).await?;
            cmd_compare(&store, &ctx, args).await?;
        },
        Commands::PruneSnapshots { series, id } => {
            let store = open_store(&config).await?;
            let summary = store
                .delete_snapshots(&ctx, &SeriesRef::new(series.clone(), *id))
                .await?;
            print_json(&serde_json::json!({
                "samples": summary.samples,
                "recording_times": summary.recording_times,
            }))?;
        },
        Commands::Metrics => {
            print!("{}", metrics::gather_metrics()?);
        },
    }

    Ok(())
}
