//! Core domain model and sheet schema for threadsheet.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "threadsheet-core";

/// Number of header rows above the first data row in the worksheet.
pub const HEADER_ROWS: usize = 1;

pub const SHEET_HEADER: [&str; 11] = [
    "Idx",
    "Date",
    "Text",
    "Topic",
    "Views",
    "Likes",
    "Replies",
    "Reposts",
    "Quotes",
    "Shares",
    "Permalink",
];

pub const COLUMN_COUNT: usize = SHEET_HEADER.len();
pub const COL_IDX: usize = 0;
pub const COL_DATE: usize = 1;
pub const COL_TEXT: usize = 2;
pub const COL_TOPIC: usize = 3;
pub const COL_VIEWS: usize = 4;
pub const COL_PERMALINK: usize = 10;
/// First and last (inclusive) zero-based columns of the metrics span.
pub const METRICS_FIRST_COL: usize = 4;
pub const METRICS_LAST_COL: usize = 9;

pub const PERMALINK_HEADER: &str = SHEET_HEADER[COL_PERMALINK];

const DEFAULT_DISPLAY_OFFSET_SECS: i32 = 9 * 3600;
const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("post {permalink} has no timestamp")]
    Missing { permalink: String },
    #[error("post {permalink} has malformed timestamp {raw:?}")]
    Malformed { permalink: String, raw: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid utc offset {0:?}, expected +HH:MM")]
pub struct OffsetParseError(pub String);

/// Media kinds reported by the feed. Unknown kinds are kept as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    TextPost,
    Image,
    Video,
    CarouselAlbum,
    Audio,
    RepostFacade,
    Other,
}

impl MediaType {
    pub fn from_api(value: &str) -> Self {
        match value {
            "TEXT_POST" => Self::TextPost,
            "IMAGE" => Self::Image,
            "VIDEO" => Self::Video,
            "CAROUSEL_ALBUM" => Self::CarouselAlbum,
            "AUDIO" => Self::Audio,
            "REPOST_FACADE" => Self::RepostFacade,
            _ => Self::Other,
        }
    }
}

/// A post as delivered by the feed, optionally enriched with metrics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Post {
    pub id: Option<String>,
    pub media_type: Option<String>,
    pub permalink: Option<String>,
    pub text: Option<String>,
    /// Raw timestamp string; parsed lazily so a bad value fails reconciliation, not the fetch.
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_quote_post: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

impl Post {
    pub fn media_kind(&self) -> MediaType {
        self.media_type
            .as_deref()
            .map(MediaType::from_api)
            .unwrap_or(MediaType::Other)
    }

    pub fn is_repost_facade(&self) -> bool {
        self.media_kind() == MediaType::RepostFacade
    }

    /// Non-empty permalink, trimmed.
    pub fn permalink_key(&self) -> Option<&str> {
        self.permalink
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn published_at(&self) -> Result<DateTime<Utc>, TimestampError> {
        let permalink = self.permalink_key().unwrap_or("<no permalink>").to_string();
        let raw = self
            .timestamp
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TimestampError::Missing {
                permalink: permalink.clone(),
            })?;
        parse_api_timestamp(raw).ok_or_else(|| TimestampError::Malformed {
            permalink,
            raw: raw.to_string(),
        })
    }

    pub fn metrics_or_default(&self) -> Metrics {
        self.metrics.unwrap_or_default()
    }
}

/// Accepts RFC 3339 and the feed's `+0000` offset style.
pub fn parse_api_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Views,
    Likes,
    Replies,
    Reposts,
    Quotes,
    Shares,
}

impl MetricName {
    /// Column order of the metrics span.
    pub const ALL: [MetricName; 6] = [
        MetricName::Views,
        MetricName::Likes,
        MetricName::Replies,
        MetricName::Reposts,
        MetricName::Quotes,
        MetricName::Shares,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Views => "views",
            Self::Likes => "likes",
            Self::Replies => "replies",
            Self::Reposts => "reposts",
            Self::Quotes => "quotes",
            Self::Shares => "shares",
        }
    }

    pub fn from_api(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    /// Comma-joined list used in the insights query.
    pub fn query_list() -> String {
        Self::ALL
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Engagement counters attached to a post; absent counters are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub views: u64,
    pub likes: u64,
    pub replies: u64,
    pub reposts: u64,
    pub quotes: u64,
    pub shares: u64,
}

impl Metrics {
    pub fn get(&self, name: MetricName) -> u64 {
        match name {
            MetricName::Views => self.views,
            MetricName::Likes => self.likes,
            MetricName::Replies => self.replies,
            MetricName::Reposts => self.reposts,
            MetricName::Quotes => self.quotes,
            MetricName::Shares => self.shares,
        }
    }

    pub fn set(&mut self, name: MetricName, value: u64) {
        let slot = match name {
            MetricName::Views => &mut self.views,
            MetricName::Likes => &mut self.likes,
            MetricName::Replies => &mut self.replies,
            MetricName::Reposts => &mut self.reposts,
            MetricName::Quotes => &mut self.quotes,
            MetricName::Shares => &mut self.shares,
        };
        *slot = value;
    }

    pub fn to_cells(&self) -> Vec<CellValue> {
        MetricName::ALL
            .iter()
            .map(|m| CellValue::Int(self.get(*m)))
            .collect()
    }
}

/// A value written into a sheet cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Int(u64),
    Text(String),
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One data row of the worksheet in column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetRow {
    pub idx: u64,
    pub date: String,
    pub text: String,
    pub topic: String,
    pub metrics: Metrics,
    pub permalink: String,
}

impl SheetRow {
    pub fn to_cells(&self) -> Vec<CellValue> {
        let mut cells = Vec::with_capacity(COLUMN_COUNT);
        cells.push(CellValue::Int(self.idx));
        cells.push(self.date.clone().into());
        cells.push(self.text.clone().into());
        cells.push(self.topic.clone().into());
        cells.extend(self.metrics.to_cells());
        cells.push(self.permalink.clone().into());
        cells
    }
}

pub fn header_cells() -> Vec<CellValue> {
    SHEET_HEADER.iter().map(|h| CellValue::from(*h)).collect()
}

/// Zero-based column index to A1 letters (0 -> A, 26 -> AA).
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// A1 range covering the metrics span of a 1-based sheet row, e.g. `E2:J2`.
pub fn metrics_range(row: usize) -> String {
    format!(
        "{}{row}:{}{row}",
        column_letter(METRICS_FIRST_COL),
        column_letter(METRICS_LAST_COL)
    )
}

/// Display settings for appended rows. The offset is explicit configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySettings {
    pub offset: FixedOffset,
    pub date_format: String,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(DEFAULT_DISPLAY_OFFSET_SECS)
                .expect("default display offset is in range"),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

impl DisplaySettings {
    /// Leading apostrophe keeps USER_ENTERED writes from coercing the cell into a date.
    pub fn format_date(&self, at: DateTime<Utc>) -> String {
        format!(
            "'{}",
            at.with_timezone(&self.offset).format(&self.date_format)
        )
    }
}

pub fn parse_utc_offset(input: &str) -> Result<FixedOffset, OffsetParseError> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| OffsetParseError(input.to_string()));
    }
    trimmed
        .parse::<FixedOffset>()
        .map_err(|_| OffsetParseError(input.to_string()))
}
