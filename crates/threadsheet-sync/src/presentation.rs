//! Worksheet formatting: static styles, Topic dropdown, conditional colors.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use threadsheet_core::{COL_PERMALINK, COL_TEXT, COL_TOPIC, COL_VIEWS, SHEET_HEADER};
use threadsheet_storage::GridRange;
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl Rgb {
    pub const fn new(red: f64, green: f64, blue: f64) -> Self {
        Self { red, green, blue }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicOption {
    pub label: String,
    pub color: Rgb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewsHighlight {
    /// Views strictly above this value get `high_color`.
    pub high_threshold: u64,
    pub high_color: Rgb,
    /// Views within `[mid_threshold, high_threshold]` get `mid_color`.
    pub mid_threshold: u64,
    pub mid_color: Rgb,
}

impl Default for ViewsHighlight {
    fn default() -> Self {
        Self {
            high_threshold: 10_000,
            high_color: Rgb::new(1.0, 0.7765, 0.7922),
            mid_threshold: 5_000,
            mid_color: Rgb::new(1.0, 0.8980, 0.9059),
        }
    }
}

/// Formatting constants. None of these carry behavior the reconciler relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    pub data_row_height: u32,
    /// Pixel widths keyed by header name.
    pub column_widths: BTreeMap<String, u32>,
    pub topic_options: Vec<TopicOption>,
    pub views: ViewsHighlight,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            data_row_height: 100,
            column_widths: BTreeMap::from([
                ("Text".to_string(), 360),
                ("Permalink".to_string(), 260),
            ]),
            topic_options: vec![
                TopicOption {
                    label: "AI".to_string(),
                    color: Rgb::new(1.0, 1.0, 0.8745),
                },
                TopicOption {
                    label: "Storytelling".to_string(),
                    color: Rgb::new(0.7843, 0.9294, 0.9686),
                },
            ],
            views: ViewsHighlight::default(),
        }
    }
}

impl PresentationConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing presentation config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file; `None` yields the built-in defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.column_widths.keys() {
            if column_index(name).is_none() {
                bail!("column_widths refers to unknown column {name:?}");
            }
        }
        if self.views.mid_threshold > self.views.high_threshold {
            bail!(
                "views.mid_threshold {} exceeds views.high_threshold {}",
                self.views.mid_threshold,
                self.views.high_threshold
            );
        }
        if self.topic_options.iter().any(|t| t.label.trim().is_empty()) {
            bail!("topic_options contains an empty label");
        }
        Ok(())
    }
}

fn column_index(name: &str) -> Option<usize> {
    SHEET_HEADER.iter().position(|h| *h == name)
}

/// Where formatting applies after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTarget {
    pub sheet_id: i64,
    /// 1-based row of the first row appended this run.
    pub first_new_row: usize,
    /// Rows in the worksheet including the header.
    pub total_rows: usize,
    /// Indices of existing conditional rules previously added by this formatter.
    /// Only these are deleted before the rules are re-added; other rules stay.
    pub managed_rule_indices: Vec<usize>,
}

/// Picks the existing rules that look like ours: every range covers exactly the
/// Views or Topic column, starting right below the header.
pub fn managed_rule_indices(rules: &[Vec<GridRange>]) -> Vec<usize> {
    rules
        .iter()
        .enumerate()
        .filter(|(_, ranges)| !ranges.is_empty() && ranges.iter().all(is_managed_range))
        .map(|(i, _)| i)
        .collect()
}

fn is_managed_range(range: &GridRange) -> bool {
    range.start_row_index == Some(1)
        && [COL_VIEWS, COL_TOPIC].into_iter().any(|col| {
            range.start_column_index == Some(col) && range.end_column_index == Some(col + 1)
        })
}

fn column_range(sheet_id: i64, col: usize, start_row: usize, end_row: Option<usize>) -> JsonValue {
    let mut range = json!({
        "sheetId": sheet_id,
        "startColumnIndex": col,
        "endColumnIndex": col + 1,
        "startRowIndex": start_row,
    });
    if let Some(end) = end_row {
        range["endRowIndex"] = json!(end);
    }
    range
}

fn conditional_rule(range: JsonValue, condition: JsonValue, color: Rgb, index: usize) -> JsonValue {
    json!({
        "addConditionalFormatRule": {
            "rule": {
                "ranges": [range],
                "booleanRule": {
                    "condition": condition,
                    "format": {"backgroundColor": color},
                },
            },
            "index": index,
        }
    })
}

/// Builds the `batchUpdate` request list for one worksheet.
pub fn build_format_requests(config: &PresentationConfig, target: &FormatTarget) -> Vec<JsonValue> {
    let sheet_id = target.sheet_id;
    let mut requests = Vec::new();

    // Highest index first so earlier deletions don't shift later ones.
    let mut stale = target.managed_rule_indices.clone();
    stale.sort_unstable_by(|a, b| b.cmp(a));
    stale.dedup();
    for index in stale {
        requests.push(json!({
            "deleteConditionalFormatRule": {"sheetId": sheet_id, "index": index}
        }));
    }

    requests.push(json!({
        "repeatCell": {
            "range": {"sheetId": sheet_id},
            "cell": {"userEnteredFormat": {
                "horizontalAlignment": "CENTER",
                "verticalAlignment": "MIDDLE",
            }},
            "fields": "userEnteredFormat(horizontalAlignment,verticalAlignment)",
        }
    }));

    for col in [COL_TEXT, COL_PERMALINK] {
        requests.push(json!({
            "repeatCell": {
                "range": column_range(sheet_id, col, 1, None),
                "cell": {"userEnteredFormat": {"horizontalAlignment": "LEFT"}},
                "fields": "userEnteredFormat.horizontalAlignment",
            }
        }));
    }

    if target.total_rows > 1 {
        requests.push(json!({
            "updateDimensionProperties": {
                "range": {
                    "sheetId": sheet_id,
                    "dimension": "ROWS",
                    "startIndex": 1,
                    "endIndex": target.total_rows,
                },
                "properties": {"pixelSize": config.data_row_height},
                "fields": "pixelSize",
            }
        }));
    }

    requests.push(json!({
        "repeatCell": {
            "range": {"sheetId": sheet_id, "startRowIndex": 0, "endRowIndex": 1},
            "cell": {"userEnteredFormat": {"textFormat": {"bold": true}}},
            "fields": "userEnteredFormat.textFormat.bold",
        }
    }));

    for (name, width) in &config.column_widths {
        let Some(col) = column_index(name) else {
            continue;
        };
        requests.push(json!({
            "updateDimensionProperties": {
                "range": {
                    "sheetId": sheet_id,
                    "dimension": "COLUMNS",
                    "startIndex": col,
                    "endIndex": col + 1,
                },
                "properties": {"pixelSize": width},
                "fields": "pixelSize",
            }
        }));
    }

    let first_new_index = target.first_new_row.saturating_sub(1);
    if !config.topic_options.is_empty() && first_new_index < target.total_rows {
        let values = config
            .topic_options
            .iter()
            .map(|t| json!({"userEnteredValue": t.label}))
            .collect::<Vec<_>>();
        requests.push(json!({
            "setDataValidation": {
                "range": column_range(sheet_id, COL_TOPIC, first_new_index, Some(target.total_rows)),
                "rule": {
                    "condition": {"type": "ONE_OF_LIST", "values": values},
                    "showCustomUi": true,
                    "strict": true,
                },
            }
        }));
    }

    let mut rule_index = 0;
    let views = &config.views;
    requests.push(conditional_rule(
        column_range(sheet_id, COL_VIEWS, 1, None),
        json!({
            "type": "NUMBER_GREATER",
            "values": [{"userEnteredValue": views.high_threshold.to_string()}],
        }),
        views.high_color,
        rule_index,
    ));
    rule_index += 1;
    requests.push(conditional_rule(
        column_range(sheet_id, COL_VIEWS, 1, None),
        json!({
            "type": "NUMBER_BETWEEN",
            "values": [
                {"userEnteredValue": views.mid_threshold.to_string()},
                {"userEnteredValue": views.high_threshold.to_string()},
            ],
        }),
        views.mid_color,
        rule_index,
    ));
    rule_index += 1;

    for topic in &config.topic_options {
        requests.push(conditional_rule(
            column_range(sheet_id, COL_TOPIC, 1, Some(target.total_rows.max(1))),
            json!({
                "type": "TEXT_EQ",
                "values": [{"userEnteredValue": topic.label}],
            }),
            topic.color,
            rule_index,
        ));
        rule_index += 1;
    }

    requests
}
