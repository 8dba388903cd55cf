use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use threadsheet_adapters::FetchWindow;
use threadsheet_core::parse_utc_offset;
use threadsheet_sync::{run_sync_once, SheetTarget, SyncConfig, SyncRequest, SyncRunSummary};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "threadsheet-cli")]
#[command(about = "Sync Threads post metrics into a Google Sheets worksheet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch posts for a date window and reconcile them into the worksheet.
    Sync(SyncArgs),
}

#[derive(Debug, clap::Args)]
struct SyncArgs {
    #[arg(long, env = "THREADS_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// OAuth bearer token with the spreadsheets scope.
    #[arg(long, env = "GOOGLE_SHEETS_TOKEN", hide_env_values = true)]
    sheets_token: String,

    #[arg(long, env = "SPREADSHEET_ID")]
    spreadsheet_id: String,

    #[arg(long, env = "WORKSHEET_NAME", default_value = "Sheet1")]
    worksheet: String,

    /// First day to fetch, YYYY-MM-DD.
    #[arg(long, value_parser = parse_date)]
    since: NaiveDate,

    #[arg(long, value_parser = parse_date)]
    until: Option<NaiveDate>,

    #[arg(long, default_value_t = 100)]
    limit: u32,

    /// YAML file overriding row height, widths, topics and highlight colors.
    #[arg(long)]
    presentation: Option<PathBuf>,

    /// Display offset for appended dates, e.g. +09:00.
    #[arg(long)]
    display_offset: Option<String>,

    #[arg(long)]
    skip_formatting: bool,

    /// Reconcile and report without writing to the worksheet.
    #[arg(long)]
    dry_run: bool,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        report_failure(&e);
        std::process::exit(1);
    }
}

/// The log subscriber writes to stderr, so this is the only place a failure is printed.
fn report_failure(err: &anyhow::Error) {
    error!("sync failed: {err:#}");
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => sync(args).await,
    }
}

async fn sync(args: SyncArgs) -> Result<()> {
    let mut config = SyncConfig::from_env().context("loading configuration")?;
    if let Some(path) = args.presentation {
        config.presentation_path = Some(path);
    }
    if let Some(raw) = args.display_offset.as_deref() {
        config.display.offset = parse_utc_offset(raw).context("parsing --display-offset")?;
    }

    let window = FetchWindow::new(args.since, args.until, args.limit)?;
    let target = SheetTarget {
        spreadsheet_id: args.spreadsheet_id,
        worksheet: args.worksheet,
        token: args.sheets_token,
    };
    let request = SyncRequest {
        access_token: args.access_token,
        window,
        dry_run: args.dry_run,
        apply_formatting: !args.skip_formatting,
    };

    info!(
        spreadsheet_id = %target.spreadsheet_id,
        worksheet = %target.worksheet,
        since = %window.since,
        until = ?window.until,
        "starting sync"
    );
    let summary = run_sync_once(&config, target, request).await?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serializing run summary")?
        );
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    let mode = if summary.dry_run { "dry run" } else { "sync" };
    println!(
        "{mode} complete: run_id={} fetched={} facades_filtered={} enriched={} updated={} appended={} header_written={} formatted={}",
        summary.run_id,
        summary.fetched_posts,
        summary.facades_filtered,
        summary.enriched,
        summary.updated_rows,
        summary.appended_rows,
        summary.header_written,
        summary.formatted,
    );
    if summary.skipped_without_id > 0 || summary.skipped_without_permalink > 0 {
        println!(
            "skipped: without_id={} without_permalink={}",
            summary.skipped_without_id, summary.skipped_without_permalink
        );
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,threadsheet_sync=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if use_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| anyhow::anyhow!("initializing tracing: {e}"))?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| anyhow::anyhow!("initializing tracing: {e}"))?;
    }
    Ok(())
}
