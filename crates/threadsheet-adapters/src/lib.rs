//! Post source contracts + the Threads Graph API adapter.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use threadsheet_core::{MetricName, Metrics, Post};
use threadsheet_storage::{FetchError, HttpFetcher};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "threadsheet-adapters";

pub const DEFAULT_THREADS_API_BASE: &str = "https://graph.threads.net/v1.0";

pub const POST_FIELDS: [&str; 6] = [
    "id",
    "media_type",
    "permalink",
    "text",
    "timestamp",
    "is_quote_post",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Date window and page size for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub since: NaiveDate,
    pub until: Option<NaiveDate>,
    pub limit: u32,
}

impl FetchWindow {
    pub fn new(since: NaiveDate, until: Option<NaiveDate>, limit: u32) -> Result<Self, AdapterError> {
        if let Some(until) = until {
            if until < since {
                return Err(AdapterError::Message(format!(
                    "until {until} is before since {since}"
                )));
            }
        }
        if limit == 0 {
            return Err(AdapterError::Message("limit must be at least 1".to_string()));
        }
        Ok(Self { since, until, limit })
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("fields", POST_FIELDS.join(",")),
            ("since", self.since.format("%Y-%m-%d").to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(until) = self.until {
            query.push(("until", until.format("%Y-%m-%d").to_string()));
        }
        query
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPosts {
    pub posts: Vec<Post>,
    pub facades_filtered: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub enriched: usize,
    pub skipped_without_id: usize,
}

#[async_trait]
pub trait PostSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Posts in feed order with facade reposts removed.
    async fn fetch_posts(
        &self,
        access_token: &str,
        window: &FetchWindow,
    ) -> Result<FetchedPosts, AdapterError>;

    /// Attaches metrics to every post that has an identifier, one lookup per post.
    async fn enrich_posts(
        &self,
        posts: &mut [Post],
        access_token: &str,
    ) -> Result<EnrichReport, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct ThreadsPage {
    #[serde(default)]
    data: Vec<Post>,
}

#[derive(Debug, Default, Deserialize)]
struct InsightsResponse {
    #[serde(default)]
    data: Vec<InsightEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InsightEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub values: Vec<InsightValue>,
    #[serde(default)]
    pub total_value: Option<InsightValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InsightValue {
    #[serde(default)]
    pub value: Option<JsonValue>,
}

fn json_count(value: Option<&JsonValue>) -> u64 {
    match value {
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .unwrap_or(0),
        None => 0,
    }
}

/// Folds the insights association list into fixed counters.
///
/// Unknown names are ignored. An entry with an empty `values` list falls back
/// to `total_value`, then to zero.
pub fn metrics_from_insights(entries: &[InsightEntry]) -> Metrics {
    let mut metrics = Metrics::default();
    for entry in entries {
        let Some(name) = entry.name.as_deref().and_then(MetricName::from_api) else {
            continue;
        };
        let value = match entry.values.first() {
            Some(first) => json_count(first.value.as_ref()),
            None => json_count(entry.total_value.as_ref().and_then(|t| t.value.as_ref())),
        };
        metrics.set(name, value);
    }
    metrics
}

#[derive(Debug, Clone)]
pub struct ThreadsAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl ThreadsAdapter {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_insights(&self, media_id: &str, access_token: &str) -> Result<Metrics, AdapterError> {
        let url = format!("{}/{}/insights", self.base_url, media_id);
        let response: InsightsResponse = self
            .http
            .get_json(
                &url,
                &[
                    ("metric", MetricName::query_list()),
                    ("access_token", access_token.to_string()),
                ],
                None,
            )
            .await?;
        Ok(metrics_from_insights(&response.data))
    }
}

#[async_trait]
impl PostSource for ThreadsAdapter {
    fn source_id(&self) -> &'static str {
        "threads"
    }

    async fn fetch_posts(
        &self,
        access_token: &str,
        window: &FetchWindow,
    ) -> Result<FetchedPosts, AdapterError> {
        let url = format!("{}/me/threads", self.base_url);
        let mut query = window.query();
        query.push(("access_token", access_token.to_string()));

        let page: ThreadsPage = self.http.get_json(&url, &query, None).await?;
        let total = page.data.len();
        let posts: Vec<Post> = page
            .data
            .into_iter()
            .filter(|p| !p.is_repost_facade())
            .collect();
        let facades_filtered = total - posts.len();

        info!(
            since = %window.since,
            until = ?window.until,
            fetched = total,
            facades_filtered,
            "fetched posts"
        );
        Ok(FetchedPosts {
            posts,
            facades_filtered,
        })
    }

    async fn enrich_posts(
        &self,
        posts: &mut [Post],
        access_token: &str,
    ) -> Result<EnrichReport, AdapterError> {
        let mut report = EnrichReport::default();
        for post in posts.iter_mut() {
            let Some(media_id) = post
                .id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
            else {
                warn!(permalink = ?post.permalink, "post has no id; leaving metrics unset");
                report.skipped_without_id += 1;
                continue;
            };

            let metrics = self.fetch_insights(&media_id, access_token).await?;
            debug!(media_id = %media_id, views = metrics.views, likes = metrics.likes, "enriched post");
            post.metrics = Some(metrics);
            report.enriched += 1;
        }
        Ok(report)
    }
}
