//! Google Sheets v4 worksheet access.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use threadsheet_core::{CellValue, PERMALINK_HEADER};
use tracing::debug;

use crate::{FetchError, HttpFetcher};

pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

#[derive(Debug, Error)]
pub enum SheetError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("worksheet {title:?} not found in spreadsheet {spreadsheet_id}")]
    WorksheetNotFound {
        spreadsheet_id: String,
        title: String,
    },
}

/// A data row keyed by header names, like a spreadsheet "record".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetRecord {
    pub fields: BTreeMap<String, String>,
}

impl SheetRecord {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    pub fn permalink(&self) -> Option<&str> {
        self.get(PERMALINK_HEADER)
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// Full worksheet contents as read at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetSnapshot {
    pub header: Option<Vec<String>>,
    pub records: Vec<SheetRecord>,
}

impl SheetSnapshot {
    /// First row is the header; every following row becomes a record.
    ///
    /// A blank first row counts as "no header" only when nothing follows it.
    /// With data below, the header is kept as-is (blank) so callers see a
    /// header without the columns they need instead of an empty sheet.
    pub fn from_values(mut values: Vec<Vec<String>>) -> Self {
        let is_blank = |row: &Vec<String>| row.iter().all(|c| c.trim().is_empty());
        if values.iter().all(is_blank) {
            return Self::default();
        }
        let header = values.remove(0);

        let records = values
            .into_iter()
            .map(|row| {
                let fields = header
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| !name.trim().is_empty())
                    .map(|(i, name)| {
                        (
                            name.trim().to_string(),
                            row.get(i).cloned().unwrap_or_default(),
                        )
                    })
                    .collect();
                SheetRecord { fields }
            })
            .collect();

        Self {
            header: Some(header.into_iter().map(|h| h.trim().to_string()).collect()),
            records,
        }
    }

    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.header
            .as_ref()
            .is_some_and(|h| h.iter().any(|c| c == name))
    }

    pub fn data_row_count(&self) -> usize {
        self.records.len()
    }
}

/// Grid span of a conditional format rule; `None` means unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridRange {
    #[serde(default)]
    pub start_row_index: Option<usize>,
    #[serde(default)]
    pub end_row_index: Option<usize>,
    #[serde(default)]
    pub start_column_index: Option<usize>,
    #[serde(default)]
    pub end_column_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetProperties {
    pub sheet_id: i64,
    pub title: String,
    /// Ranges of each conditional format rule, in rule index order.
    pub conditional_rules: Vec<Vec<GridRange>>,
}

/// Worksheet operations the sync pipeline needs.
#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn read_snapshot(&self) -> Result<SheetSnapshot, SheetError>;

    /// Appends full rows below the last row, in order.
    async fn append_rows(&self, rows: &[Vec<CellValue>]) -> Result<(), SheetError>;

    /// Writes one row of values into a bounded A1 range such as `E2:J2`.
    async fn update_range(&self, a1_range: &str, values: &[CellValue]) -> Result<(), SheetError>;

    async fn properties(&self) -> Result<SheetProperties, SheetError>;

    async fn batch_update(&self, requests: Vec<JsonValue>) -> Result<(), SheetError>;
}

/// Worksheet-qualified A1 range, e.g. `'My Tab'!E2:J2`.
pub fn quoted_range(title: &str, a1: Option<&str>) -> String {
    let quoted = format!("'{}'", title.replace('\'', "''"));
    match a1 {
        Some(a1) => format!("{quoted}!{a1}"),
        None => quoted,
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetMeta {
    properties: SheetMetaProperties,
    #[serde(default)]
    conditional_formats: Vec<ConditionalFormatMeta>,
}

#[derive(Debug, Deserialize)]
struct ConditionalFormatMeta {
    #[serde(default)]
    ranges: Vec<GridRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetMetaProperties {
    sheet_id: i64,
    title: String,
}

fn cell_to_string(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct GoogleSheetStore {
    http: HttpFetcher,
    base_url: String,
    spreadsheet_id: String,
    worksheet: String,
    token: String,
}

impl GoogleSheetStore {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        worksheet: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            worksheet: worksheet.into(),
            token: token.into(),
        }
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    fn spreadsheet_url(&self) -> String {
        format!(
            "{}/v4/spreadsheets/{}",
            self.base_url,
            urlencoding::encode(&self.spreadsheet_id)
        )
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/values/{}",
            self.spreadsheet_url(),
            urlencoding::encode(range)
        )
    }
}

#[async_trait]
impl SheetStore for GoogleSheetStore {
    async fn read_snapshot(&self) -> Result<SheetSnapshot, SheetError> {
        let url = self.values_url(&quoted_range(&self.worksheet, None));
        let range: ValueRange = self
            .http
            .get_json(&url, &[("majorDimension", "ROWS".to_string())], Some(self.token.as_str()))
            .await?;
        let values = range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect();
        let snapshot = SheetSnapshot::from_values(values);
        debug!(
            worksheet = %self.worksheet,
            records = snapshot.data_row_count(),
            has_header = snapshot.has_header(),
            "read worksheet"
        );
        Ok(snapshot)
    }

    async fn append_rows(&self, rows: &[Vec<CellValue>]) -> Result<(), SheetError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}:append",
            self.values_url(&quoted_range(&self.worksheet, Some("A1")))
        );
        let body = serde_json::json!({
            "majorDimension": "ROWS",
            "values": rows,
        });
        let _: IgnoredAny = self
            .http
            .send_json(
                Method::POST,
                &url,
                &[
                    ("valueInputOption", "USER_ENTERED".to_string()),
                    ("insertDataOption", "INSERT_ROWS".to_string()),
                ],
                Some(self.token.as_str()),
                &body,
            )
            .await?;
        Ok(())
    }

    async fn update_range(&self, a1_range: &str, values: &[CellValue]) -> Result<(), SheetError> {
        let range = quoted_range(&self.worksheet, Some(a1_range));
        let url = self.values_url(&range);
        let body = serde_json::json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": [values],
        });
        let _: IgnoredAny = self
            .http
            .send_json(
                Method::PUT,
                &url,
                &[("valueInputOption", "USER_ENTERED".to_string())],
                Some(self.token.as_str()),
                &body,
            )
            .await?;
        Ok(())
    }

    async fn properties(&self) -> Result<SheetProperties, SheetError> {
        let meta: SpreadsheetMeta = self
            .http
            .get_json(
                &self.spreadsheet_url(),
                &[(
                    "fields",
                    "sheets(properties(sheetId,title),conditionalFormats)".to_string(),
                )],
                Some(self.token.as_str()),
            )
            .await?;
        meta.sheets
            .into_iter()
            .find(|s| s.properties.title == self.worksheet)
            .map(|s| SheetProperties {
                sheet_id: s.properties.sheet_id,
                title: s.properties.title,
                conditional_rules: s
                    .conditional_formats
                    .into_iter()
                    .map(|rule| rule.ranges)
                    .collect(),
            })
            .ok_or_else(|| SheetError::WorksheetNotFound {
                spreadsheet_id: self.spreadsheet_id.clone(),
                title: self.worksheet.clone(),
            })
    }

    async fn batch_update(&self, requests: Vec<JsonValue>) -> Result<(), SheetError> {
        if requests.is_empty() {
            return Ok(());
        }
        let url = format!("{}:batchUpdate", self.spreadsheet_url());
        let body = serde_json::json!({ "requests": requests });
        let _: IgnoredAny = self
            .http
            .send_json(Method::POST, &url, &[], Some(self.token.as_str()), &body)
            .await?;
        Ok(())
    }
}
