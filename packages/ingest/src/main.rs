#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the event import tool.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use eventsync_cli_utils::{IndicatifProgress, MultiProgress, batch_reporter, init_logger};
use eventsync_database::event_db::DuckDbSink;
use eventsync_database::paths::resolve_db_path;
use eventsync_ingest::split::split_range;
use eventsync_ingest::{IngestError, parallel_fetch, retry_failed_ranges, single_chunk_options};
use eventsync_ingest_models::{
    DEFAULT_MAX_CONCURRENT, FetchRequest, ParallelFetchOptions, ParallelFetchResult,
};
use eventsync_source::EventSource;
use eventsync_source::config::SourceConfig;
use eventsync_source::export::HttpExportSource;
use eventsync_source_models::FetchFilters;

#[derive(Parser)]
#[command(name = "eventsync", about = "Bulk event import into a local DuckDB store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import every event in a date range into a table
    Fetch(FetchArgs),
    /// List tables in the local store with their row counts
    Tables {
        /// Database file (defaults to `EVENTSYNC_DB` or `data/eventsync.duckdb`)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Drop a table from the local store
    Drop {
        /// Table to drop
        table: String,
        /// Database file (defaults to `EVENTSYNC_DB` or `data/eventsync.duckdb`)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[derive(Args)]
#[allow(clippy::struct_excessive_bools)]
struct FetchArgs {
    /// Destination table
    table: String,
    /// First day to import (YYYY-MM-DD, inclusive)
    #[arg(long)]
    from: NaiveDate,
    /// Last day to import (YYYY-MM-DD, inclusive)
    #[arg(long)]
    to: NaiveDate,
    /// Comma-separated event names to import (default: all)
    #[arg(long, value_delimiter = ',')]
    events: Vec<String>,
    /// Source-side filter expression
    #[arg(long = "where")]
    where_clause: Option<String>,
    /// Split the range into chunks fetched concurrently
    #[arg(long)]
    parallel: bool,
    /// Number of concurrently running chunk fetches (requires --parallel)
    #[arg(long)]
    workers: Option<usize>,
    /// Days per chunk (requires --parallel)
    #[arg(long)]
    chunk_days: Option<u32>,
    /// Maximum number of concurrent calls to the export API
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,
    /// Add to an existing table instead of requiring a new one
    #[arg(long)]
    append: bool,
    /// Re-run failed date ranges once after the main run
    #[arg(long)]
    retry_failed: bool,
    /// Database file (defaults to `EVENTSYNC_DB` or `data/eventsync.duckdb`)
    #[arg(long)]
    db: Option<PathBuf>,
    /// Source config file (TOML); `EVENTSYNC_*` variables override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the result as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

impl FetchArgs {
    fn request(&self) -> FetchRequest {
        let mut filters = FetchFilters::default().with_events(self.events.clone());
        if let Some(expression) = &self.where_clause {
            filters = filters.with_where(expression.clone());
        }
        FetchRequest::new(self.table.clone(), self.from, self.to).with_filters(filters)
    }

    fn options(&self, request: &FetchRequest) -> Result<ParallelFetchOptions, IngestError> {
        let base = ParallelFetchOptions::default()
            .with_max_concurrent(self.max_concurrent)
            .with_append(self.append);

        if !self.parallel {
            if self.workers.is_some() || self.chunk_days.is_some() {
                return Err(IngestError::validation(
                    "--workers and --chunk-days require --parallel",
                ));
            }
            return Ok(single_chunk_options(request, &base));
        }

        let mut options = base;
        if let Some(workers) = self.workers {
            options = options.with_max_workers(workers);
        }
        if let Some(chunk_days) = self.chunk_days {
            options = options.with_chunk_days(chunk_days);
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch(args) => {
            let result = fetch(&args, &multi).await?;
            print_result(&result, args.json)?;
            if result.has_failures() {
                std::process::exit(1);
            }
        }
        Commands::Tables { db } => {
            let sink = DuckDbSink::open(&resolve_db_path(db.as_deref()))?;
            let tables = sink.list_tables()?;
            if tables.is_empty() {
                println!("No tables.");
            } else {
                println!("{:<32} ROWS", "TABLE");
                println!("{}", "-".repeat(44));
                for (name, rows) in tables {
                    println!("{name:<32} {rows}");
                }
            }
        }
        Commands::Drop { table, db } => {
            let mut sink = DuckDbSink::open(&resolve_db_path(db.as_deref()))?;
            sink.drop_table(&table)?;
            println!("Dropped {table}");
        }
    }

    Ok(())
}

async fn fetch(
    args: &FetchArgs,
    multi: &MultiProgress,
) -> Result<ParallelFetchResult, Box<dyn std::error::Error>> {
    let request = args.request();
    let options = args.options(&request)?;
    let total_batches = split_range(request.from, request.to, options.chunk_days)?.len();

    let config = SourceConfig::load(args.config.as_deref())?;
    let source: Arc<dyn EventSource> = Arc::new(HttpExportSource::new(config)?);

    let db_path = resolve_db_path(args.db.as_deref());
    log::info!("Using database {}", db_path.display());
    let sink = DuckDbSink::open(&db_path)?;

    let bar = IndicatifProgress::steps_bar(
        multi,
        &format!("Fetching {}", request.table),
        total_batches as u64,
    );
    let (result, sink) = parallel_fetch(
        Arc::clone(&source),
        sink,
        &request,
        &options,
        Some(batch_reporter(Arc::clone(&bar))),
    )
    .await?;
    bar.finish(format!("{} rows", result.total_rows));

    if !args.retry_failed || !result.has_failures() {
        return Ok(result);
    }

    log::info!(
        "Retrying {} failed range(s) for {}",
        result.failed_batches,
        result.table
    );
    let bar = IndicatifProgress::steps_bar(multi, "Retrying", result.failed_batches as u64);
    let (merged, _sink) = retry_failed_ranges(
        source,
        sink,
        &result,
        &request.filters,
        &options,
        Some(batch_reporter(Arc::clone(&bar))),
    )
    .await?;
    bar.finish(format!("{} rows", merged.total_rows));

    Ok(merged)
}

fn print_result(result: &ParallelFetchResult, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("Table:      {}", result.table);
    println!("Rows:       {}", result.total_rows);
    println!(
        "Batches:    {} ok, {} failed",
        result.successful_batches, result.failed_batches
    );
    println!("Duration:   {:.1}s", result.duration_seconds);
    println!("Completed:  {}", result.completed_at.to_rfc3339());

    if result.has_failures() {
        println!("Failed ranges:");
        for (from, to) in &result.failed_date_ranges {
            println!("  {from} .. {to}");
        }
        if result.is_total_failure() {
            println!("Every batch failed; nothing was written.");
        } else {
            println!("Fetch the ranges above again with --append to fill the gaps.");
        }
    }

    Ok(())
}
