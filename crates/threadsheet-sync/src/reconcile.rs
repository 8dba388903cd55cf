//! Permalink-keyed reconciliation of fetched posts against worksheet rows.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use threadsheet_core::{
    metrics_range, DisplaySettings, Metrics, Post, SheetRow, TimestampError, HEADER_ROWS,
    PERMALINK_HEADER,
};
use threadsheet_storage::SheetSnapshot;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    #[error("worksheet header has no {column:?} column; refusing to reconcile")]
    MissingKeyColumn { column: &'static str },
}

/// Metrics-only write for an existing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowUpdate {
    /// 1-based sheet row.
    pub row: usize,
    pub permalink: String,
    pub metrics: Metrics,
}

impl RowUpdate {
    pub fn range(&self) -> String {
        metrics_range(self.row)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePlan {
    pub write_header: bool,
    pub existing_rows: usize,
    pub updates: Vec<RowUpdate>,
    pub appends: Vec<SheetRow>,
    pub skipped_without_permalink: usize,
}

impl ReconcilePlan {
    /// 1-based sheet row the first appended row lands on.
    pub fn first_new_row(&self) -> usize {
        HEADER_ROWS + self.existing_rows + 1
    }

    /// Rows in the worksheet once the plan is applied, header included.
    pub fn total_rows(&self) -> usize {
        HEADER_ROWS + self.existing_rows + self.appends.len()
    }

    pub fn is_noop(&self) -> bool {
        !self.write_header && self.updates.is_empty() && self.appends.is_empty()
    }
}

/// Decides update vs append for every post.
///
/// Posts are ordered by timestamp before indices are assigned, so new rows
/// are numbered chronologically no matter how the feed ordered them. Any post
/// with a missing or malformed timestamp fails the whole call.
pub fn reconcile(
    posts: &[Post],
    snapshot: &SheetSnapshot,
    display: &DisplaySettings,
) -> Result<ReconcilePlan, ReconcileError> {
    if snapshot.has_header() && !snapshot.has_column(PERMALINK_HEADER) {
        return Err(ReconcileError::MissingKeyColumn {
            column: PERMALINK_HEADER,
        });
    }

    let mut existing: HashMap<&str, usize> = HashMap::new();
    for (i, record) in snapshot.records.iter().enumerate() {
        if let Some(permalink) = record.permalink() {
            existing.entry(permalink).or_insert(HEADER_ROWS + i + 1);
        }
    }

    let mut dated = posts
        .iter()
        .map(|post| post.published_at().map(|at| (at, post)))
        .collect::<Result<Vec<_>, _>>()?;
    dated.sort_by_key(|(at, _)| *at);

    let mut plan = ReconcilePlan {
        write_header: !snapshot.has_header(),
        existing_rows: snapshot.data_row_count(),
        ..ReconcilePlan::default()
    };
    let mut next_idx = snapshot.data_row_count() as u64 + 1;
    let mut update_slots: HashMap<&str, usize> = HashMap::new();
    let mut append_slots: HashMap<&str, usize> = HashMap::new();

    for (at, post) in dated {
        let Some(permalink) = post.permalink_key() else {
            warn!(id = ?post.id, "post has no permalink; skipping");
            plan.skipped_without_permalink += 1;
            continue;
        };
        let metrics = post.metrics_or_default();

        if let Some(&row) = existing.get(permalink) {
            match update_slots.get(permalink) {
                Some(&slot) => plan.updates[slot].metrics = metrics,
                None => {
                    update_slots.insert(permalink, plan.updates.len());
                    plan.updates.push(RowUpdate {
                        row,
                        permalink: permalink.to_string(),
                        metrics,
                    });
                }
            }
            continue;
        }

        // Repeated new permalink in the same batch: keep the first row, latest metrics.
        if let Some(&slot) = append_slots.get(permalink) {
            plan.appends[slot].metrics = metrics;
            continue;
        }

        append_slots.insert(permalink, plan.appends.len());
        plan.appends.push(SheetRow {
            idx: next_idx,
            date: display.format_date(at),
            text: post.text.clone().unwrap_or_default(),
            topic: String::new(),
            metrics,
            permalink: permalink.to_string(),
        });
        next_idx += 1;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadsheet_core::{header_cells, CellValue, METRICS_FIRST_COL, METRICS_LAST_COL};

    fn post(permalink: &str, ts: &str, views: u64) -> Post {
        Post {
            id: Some(permalink.trim_start_matches("P").to_string()),
            media_type: Some("TEXT_POST".into()),
            permalink: Some(permalink.to_string()),
            text: Some(format!("text of {permalink}")),
            timestamp: Some(ts.to_string()),
            is_quote_post: false,
            metrics: Some(Metrics {
                views,
                ..Metrics::default()
            }),
        }
    }

    fn cell_text(cell: &CellValue) -> String {
        match cell {
            CellValue::Int(v) => v.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }

    fn sheet(rows: Vec<Vec<CellValue>>) -> SheetSnapshot {
        SheetSnapshot::from_values(
            rows.iter()
                .map(|r| r.iter().map(cell_text).collect())
                .collect(),
        )
    }

    fn existing_row(idx: u64, permalink: &str, topic: &str) -> Vec<CellValue> {
        SheetRow {
            idx,
            date: "2024-06-01 09:00".into(),
            text: "old text".into(),
            topic: topic.into(),
            metrics: Metrics::default(),
            permalink: permalink.into(),
        }
        .to_cells()
    }

    /// Worksheet contents after applying `plan` on top of `rows`.
    fn apply(mut rows: Vec<Vec<CellValue>>, plan: &ReconcilePlan) -> Vec<Vec<CellValue>> {
        if plan.write_header {
            rows.insert(0, header_cells());
        }
        for update in &plan.updates {
            let row = &mut rows[update.row - 1];
            row[METRICS_FIRST_COL..=METRICS_LAST_COL].clone_from_slice(&update.metrics.to_cells());
        }
        rows.extend(plan.appends.iter().map(SheetRow::to_cells));
        rows
    }

    #[test]
    fn existing_permalink_updates_and_new_permalink_appends() {
        let rows = vec![header_cells(), existing_row(1, "P1", "AI")];
        let posts = vec![
            post("P1", "2024-07-01T10:00:00+0000", 50),
            post("P2", "2024-07-02T10:00:00+0000", 10),
        ];

        let plan = reconcile(&posts, &sheet(rows), &DisplaySettings::default()).unwrap();

        assert!(!plan.write_header);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].row, 2);
        assert_eq!(plan.updates[0].range(), "E2:J2");
        assert_eq!(plan.updates[0].metrics.views, 50);
        assert_eq!(plan.appends.len(), 1);
        assert_eq!(plan.appends[0].idx, 2);
        assert_eq!(plan.appends[0].permalink, "P2");
        assert_eq!(plan.appends[0].metrics.views, 10);
        assert_eq!(plan.first_new_row(), 3);
        assert_eq!(plan.total_rows(), 3);
    }

    #[test]
    fn empty_sheet_writes_header_and_numbers_from_one() {
        let posts = vec![
            post("P2", "2024-07-02T10:00:00+0000", 1),
            post("P1", "2024-07-01T10:00:00+0000", 1),
        ];

        let plan = reconcile(&posts, &SheetSnapshot::default(), &DisplaySettings::default()).unwrap();

        assert!(plan.write_header);
        assert!(plan.updates.is_empty());
        let appended: Vec<_> = plan
            .appends
            .iter()
            .map(|r| (r.idx, r.permalink.as_str()))
            .collect();
        assert_eq!(appended, vec![(1, "P1"), (2, "P2")]);
        assert_eq!(plan.appends[0].date, "'2024-07-01 19:00");
        assert_eq!(plan.appends[0].topic, "");
        assert_eq!(plan.appends[0].text, "text of P1");
    }

    #[test]
    fn header_only_sheet_does_not_rewrite_header() {
        let plan = reconcile(
            &[post("P1", "2024-07-01T10:00:00+0000", 1)],
            &sheet(vec![header_cells()]),
            &DisplaySettings::default(),
        )
        .unwrap();
        assert!(!plan.write_header);
        assert_eq!(plan.appends[0].idx, 1);
        assert_eq!(plan.first_new_row(), 2);
    }

    #[test]
    fn appended_indices_follow_timestamps_not_input_order() {
        let rows = vec![
            header_cells(),
            existing_row(1, "A", ""),
            existing_row(2, "B", ""),
        ];
        let posts = vec![
            post("P3", "2024-07-03T00:00:00+0000", 0),
            post("P1", "2024-07-01T00:00:00+0000", 0),
            post("A", "2024-06-01T00:00:00+0000", 0),
            post("P2", "2024-07-02T00:00:00+00:00", 0),
        ];

        let plan = reconcile(&posts, &sheet(rows), &DisplaySettings::default()).unwrap();

        let appended: Vec<_> = plan
            .appends
            .iter()
            .map(|r| (r.idx, r.permalink.as_str()))
            .collect();
        assert_eq!(appended, vec![(3, "P1"), (4, "P2"), (5, "P3")]);
    }

    #[test]
    fn rerun_on_resulting_sheet_only_repeats_updates() {
        let rows = vec![header_cells(), existing_row(1, "P0", "Storytelling")];
        let posts = vec![
            post("P1", "2024-07-01T10:00:00+0000", 7),
            post("P0", "2024-06-01T10:00:00+0000", 99),
            post("P2", "2024-07-02T10:00:00+0000", 3),
        ];
        let display = DisplaySettings::default();

        let first = reconcile(&posts, &sheet(rows.clone()), &display).unwrap();
        let after = apply(rows, &first);
        let second = reconcile(&posts, &sheet(after.clone()), &display).unwrap();

        assert!(second.appends.is_empty());
        assert!(!second.write_header);
        assert_eq!(second.updates.len(), 3);
        let unchanged = apply(after.clone(), &second);
        assert_eq!(unchanged, after);
    }

    #[test]
    fn updates_never_touch_topic_text_or_date() {
        let rows = vec![header_cells(), existing_row(1, "P1", "AI")];
        let plan = reconcile(
            &[post("P1", "2024-07-01T10:00:00+0000", 500)],
            &sheet(rows.clone()),
            &DisplaySettings::default(),
        )
        .unwrap();
        let after = apply(rows, &plan);
        let row = &after[1];
        assert_eq!(row[1], CellValue::from("2024-06-01 09:00"));
        assert_eq!(row[2], CellValue::from("old text"));
        assert_eq!(row[3], CellValue::from("AI"));
        assert_eq!(row[4], CellValue::Int(500));
    }

    #[test]
    fn posts_without_metrics_report_zeroes() {
        let mut bare = post("P1", "2024-07-01T10:00:00+0000", 0);
        bare.metrics = None;
        let plan = reconcile(&[bare], &SheetSnapshot::default(), &DisplaySettings::default()).unwrap();
        assert_eq!(plan.appends[0].metrics, Metrics::default());
    }

    #[test]
    fn malformed_timestamp_fails_before_any_row_is_planned() {
        let mut broken = post("P2", "2024-07-01T10:00:00+0000", 0);
        broken.timestamp = Some("07/01/2024".into());
        let err = reconcile(
            &[post("P1", "2024-07-01T10:00:00+0000", 0), broken],
            &SheetSnapshot::default(),
            &DisplaySettings::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Timestamp(TimestampError::Malformed { .. })
        ));

        let mut missing = post("P3", "", 0);
        missing.timestamp = None;
        let err = reconcile(&[missing], &SheetSnapshot::default(), &DisplaySettings::default())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Timestamp(TimestampError::Missing { .. })));
    }

    #[test]
    fn repeated_permalinks_yield_one_write_each() {
        let rows = vec![header_cells(), existing_row(1, "P1", "")];
        let posts = vec![
            post("P1", "2024-07-01T10:00:00+0000", 5),
            post("P1", "2024-07-01T12:00:00+0000", 8),
            post("P2", "2024-07-02T10:00:00+0000", 1),
            post("P2", "2024-07-02T11:00:00+0000", 2),
        ];

        let plan = reconcile(&posts, &sheet(rows), &DisplaySettings::default()).unwrap();

        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].metrics.views, 8);
        assert_eq!(plan.appends.len(), 1);
        assert_eq!(plan.appends[0].idx, 2);
        assert_eq!(plan.appends[0].metrics.views, 2);
    }

    #[test]
    fn blank_header_over_existing_rows_is_rejected() {
        let rows = vec![vec![CellValue::from("")], existing_row(1, "P1", "")];
        let err = reconcile(
            &[post("P2", "2024-07-02T10:00:00+0000", 1)],
            &sheet(rows),
            &DisplaySettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingKeyColumn { .. }));
    }

    #[test]
    fn duplicate_sheet_rows_resolve_to_first_seen_position() {
        let rows = vec![
            header_cells(),
            existing_row(1, "P1", ""),
            existing_row(2, "P1", ""),
        ];
        let plan = reconcile(
            &[post("P1", "2024-07-01T10:00:00+0000", 1)],
            &sheet(rows),
            &DisplaySettings::default(),
        )
        .unwrap();
        assert_eq!(plan.updates[0].row, 2);
    }

    #[test]
    fn posts_without_permalink_are_skipped() {
        let mut anonymous = post("P1", "2024-07-01T10:00:00+0000", 1);
        anonymous.permalink = Some("   ".into());
        let plan = reconcile(
            &[anonymous, post("P2", "2024-07-02T10:00:00+0000", 1)],
            &SheetSnapshot::default(),
            &DisplaySettings::default(),
        )
        .unwrap();
        assert_eq!(plan.skipped_without_permalink, 1);
        assert_eq!(plan.appends.len(), 1);
        assert_eq!(plan.appends[0].idx, 1);
    }

    #[test]
    fn header_without_permalink_column_is_rejected() {
        let snapshot = sheet(vec![
            vec![CellValue::from("Idx"), CellValue::from("Link")],
            vec![CellValue::Int(1), CellValue::from("P1")],
        ]);
        let err = reconcile(
            &[post("P1", "2024-07-01T10:00:00+0000", 1)],
            &snapshot,
            &DisplaySettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingKeyColumn { .. }));
    }

    #[test]
    fn rows_without_permalink_still_count_toward_next_index() {
        let rows = vec![
            header_cells(),
            existing_row(1, "", ""),
            existing_row(2, "P1", ""),
        ];
        let plan = reconcile(
            &[post("P9", "2024-07-01T10:00:00+0000", 1)],
            &sheet(rows),
            &DisplaySettings::default(),
        )
        .unwrap();
        assert_eq!(plan.appends[0].idx, 3);
        assert_eq!(plan.first_new_row(), 4);
    }

    #[test]
    fn empty_input_is_a_noop_on_populated_sheet() {
        let rows = vec![header_cells(), existing_row(1, "P1", "")];
        let plan = reconcile(&[], &sheet(rows), &DisplaySettings::default()).unwrap();
        assert!(plan.is_noop());
    }
}
