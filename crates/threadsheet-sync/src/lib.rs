//! Sync pipeline orchestration: fetch, enrich, reconcile, write, format.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use threadsheet_adapters::{FetchWindow, PostSource, ThreadsAdapter, DEFAULT_THREADS_API_BASE};
use threadsheet_core::{header_cells, parse_utc_offset, DisplaySettings};
use threadsheet_storage::{
    GoogleSheetStore, HttpClientConfig, HttpFetcher, SheetStore, DEFAULT_SHEETS_API_BASE,
};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

mod presentation;
mod reconcile;

pub use presentation::{
    build_format_requests, managed_rule_indices, FormatTarget, PresentationConfig, Rgb,
    TopicOption, ViewsHighlight,
};
pub use reconcile::{reconcile, ReconcileError, ReconcilePlan, RowUpdate};

pub const CRATE_NAME: &str = "threadsheet-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub threads_api_base: String,
    pub sheets_api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub display: DisplaySettings,
    pub presentation_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threads_api_base: DEFAULT_THREADS_API_BASE.to_string(),
            sheets_api_base: DEFAULT_SHEETS_API_BASE.to_string(),
            user_agent: "threadsheet/0.1".to_string(),
            http_timeout_secs: 20,
            display: DisplaySettings::default(),
            presentation_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let mut display = defaults.display;
        if let Some(raw) = lookup("THREADSHEET_DISPLAY_OFFSET") {
            display.offset = parse_utc_offset(&raw).context("parsing THREADSHEET_DISPLAY_OFFSET")?;
        }
        let http_timeout_secs = match lookup("THREADSHEET_HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing THREADSHEET_HTTP_TIMEOUT_SECS {raw:?}"))?;
                if secs == 0 {
                    bail!("THREADSHEET_HTTP_TIMEOUT_SECS must be at least 1");
                }
                secs
            }
            None => defaults.http_timeout_secs,
        };

        Ok(Self {
            threads_api_base: lookup("THREADS_API_BASE").unwrap_or(defaults.threads_api_base),
            sheets_api_base: lookup("SHEETS_API_BASE").unwrap_or(defaults.sheets_api_base),
            user_agent: lookup("THREADSHEET_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs,
            display,
            presentation_path: lookup("THREADSHEET_PRESENTATION").map(PathBuf::from),
        })
    }
}

/// Per-run inputs.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub access_token: String,
    pub window: FetchWindow,
    pub dry_run: bool,
    pub apply_formatting: bool,
}

/// Which worksheet to write and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct SheetTarget {
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub fetched_posts: usize,
    pub facades_filtered: usize,
    pub enriched: usize,
    pub skipped_without_id: usize,
    pub skipped_without_permalink: usize,
    pub header_written: bool,
    pub updated_rows: usize,
    pub appended_rows: usize,
    pub formatted: bool,
    pub dry_run: bool,
}

pub struct SyncPipeline {
    source: Box<dyn PostSource>,
    sheet: Box<dyn SheetStore>,
    display: DisplaySettings,
    presentation: PresentationConfig,
}

impl SyncPipeline {
    pub fn new(source: Box<dyn PostSource>, sheet: Box<dyn SheetStore>) -> Self {
        Self {
            source,
            sheet,
            display: DisplaySettings::default(),
            presentation: PresentationConfig::default(),
        }
    }

    pub fn with_display(mut self, display: DisplaySettings) -> Self {
        self.display = display;
        self
    }

    pub fn with_presentation(mut self, presentation: PresentationConfig) -> Self {
        self.presentation = presentation;
        self
    }

    pub async fn run_once(&self, request: &SyncRequest) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: &SyncRequest) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        let fetched = self
            .source
            .fetch_posts(&request.access_token, &request.window)
            .await
            .context("fetching posts")?;
        let fetched_posts = fetched.posts.len();
        let mut posts = fetched.posts;

        let enrich = self
            .source
            .enrich_posts(&mut posts, &request.access_token)
            .await
            .context("fetching post insights")?;

        let snapshot = self
            .sheet
            .read_snapshot()
            .await
            .context("reading worksheet")?;
        let plan = reconcile(&posts, &snapshot, &self.display).context("reconciling posts")?;
        info!(
            existing_rows = plan.existing_rows,
            updates = plan.updates.len(),
            appends = plan.appends.len(),
            write_header = plan.write_header,
            dry_run = request.dry_run,
            "reconcile plan ready"
        );

        let mut formatted = false;
        if !request.dry_run {
            self.apply_plan(&plan).await?;
            if request.apply_formatting {
                self.apply_formatting(&plan).await?;
                formatted = true;
            }
        }

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: self.source.source_id().to_string(),
            fetched_posts,
            facades_filtered: fetched.facades_filtered,
            enriched: enrich.enriched,
            skipped_without_id: enrich.skipped_without_id,
            skipped_without_permalink: plan.skipped_without_permalink,
            header_written: plan.write_header && !request.dry_run,
            updated_rows: plan.updates.len(),
            appended_rows: plan.appends.len(),
            formatted,
            dry_run: request.dry_run,
        })
    }

    async fn apply_plan(&self, plan: &ReconcilePlan) -> Result<()> {
        if plan.write_header {
            self.sheet
                .append_rows(&[header_cells()])
                .await
                .context("writing header row")?;
        }

        for update in &plan.updates {
            let range = update.range();
            self.sheet
                .update_range(&range, &update.metrics.to_cells())
                .await
                .with_context(|| format!("updating metrics in {range}"))?;
            debug!(row = update.row, permalink = %update.permalink, "updated metrics");
        }

        if !plan.appends.is_empty() {
            let rows = plan.appends.iter().map(|r| r.to_cells()).collect::<Vec<_>>();
            self.sheet
                .append_rows(&rows)
                .await
                .context("appending new rows")?;
        }
        Ok(())
    }

    async fn apply_formatting(&self, plan: &ReconcilePlan) -> Result<()> {
        let properties = self
            .sheet
            .properties()
            .await
            .context("reading worksheet properties")?;
        let target = FormatTarget {
            sheet_id: properties.sheet_id,
            first_new_row: plan.first_new_row(),
            total_rows: plan.total_rows(),
            managed_rule_indices: managed_rule_indices(&properties.conditional_rules),
        };
        let requests = build_format_requests(&self.presentation, &target);
        debug!(requests = requests.len(), sheet_id = target.sheet_id, "applying formatting");
        self.sheet
            .batch_update(requests)
            .await
            .context("applying worksheet formatting")
    }
}

/// Wires the Threads adapter and the Google Sheets store from config and runs once.
pub async fn run_sync_once(
    config: &SyncConfig,
    target: SheetTarget,
    request: SyncRequest,
) -> Result<SyncRunSummary> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let presentation = PresentationConfig::load(config.presentation_path.as_deref()).await?;

    let source = ThreadsAdapter::new(http.clone(), config.threads_api_base.clone());
    let sheet = GoogleSheetStore::new(
        http,
        config.sheets_api_base.clone(),
        target.spreadsheet_id,
        target.worksheet,
        target.token,
    );

    SyncPipeline::new(Box::new(source), Box::new(sheet))
        .with_display(config.display.clone())
        .with_presentation(presentation)
        .run_once(&request)
        .await
}
