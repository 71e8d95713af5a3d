//! Type coercion of raw review rows plus the data-quality diagnostics logged alongside.

use std::collections::HashSet;

use revu_core::{
    parse_lenient_int, parse_lenient_timestamp, review_uid, RawBatch, RawReview, Review, ReviewColumn,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanReport {
    pub missing_columns: Vec<String>,
    pub duplicate_uids: usize,
    /// Null fraction per input column, highest first, at most ten entries.
    pub missingness_top10: Vec<(String, f64)>,
    pub derived_uids: usize,
}

/// Coerce every row; bad values become `None` and never fail the batch.
pub fn clean(batch: &RawBatch) -> (Vec<Review>, CleanReport) {
    let missing_columns: Vec<String> = ReviewColumn::ALL
        .into_iter()
        .filter(|c| !batch.has_column(*c))
        .map(|c| c.as_str().to_string())
        .collect();
    info!(missing_cols = ?missing_columns, "schema check");

    let mut derived_uids = 0usize;
    let reviews: Vec<Review> = batch
        .rows
        .iter()
        .map(|raw| {
            let (review, derived) = clean_row(raw);
            if derived {
                derived_uids += 1;
            }
            review
        })
        .collect();

    let mut seen = HashSet::new();
    let duplicate_uids = reviews
        .iter()
        .filter(|r| !seen.insert(r.review_uid.as_str()))
        .count();
    info!(review_uid_duplicates = duplicate_uids, derived_uids, "duplicate check");

    let present: Vec<ReviewColumn> = ReviewColumn::ALL
        .into_iter()
        .filter(|c| batch.has_column(*c))
        .collect();
    let missingness_top10 = missingness(&reviews, &present, 10);
    info!(top10 = ?missingness_top10, "missingness top10");

    let report = CleanReport {
        missing_columns,
        duplicate_uids,
        missingness_top10,
        derived_uids,
    };
    (reviews, report)
}

fn clean_row(raw: &RawReview) -> (Review, bool) {
    let (uid, derived) = match raw.review_uid.as_deref().map(str::trim) {
        Some(uid) if !uid.is_empty() => (uid.to_string(), false),
        _ => (
            review_uid(
                raw.user_name.as_deref(),
                raw.review_date.as_deref(),
                raw.review_text.as_deref(),
            ),
            true,
        ),
    };

    let review = Review {
        review_uid: uid,
        user_name: raw.user_name.clone(),
        rating: raw.rating.as_deref().and_then(parse_lenient_int),
        review_text: raw
            .review_text
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string(),
        review_date: raw.review_date.as_deref().and_then(parse_lenient_timestamp),
        thumbs_up: raw.thumbs_up.as_deref().and_then(parse_lenient_int),
        app_version: raw.app_version.clone(),
        sort_mode: raw.sort_mode.clone(),
        scrape_time: raw.scrape_time.as_deref().and_then(parse_lenient_timestamp),
    };
    (review, derived)
}

/// Null fraction per column over cleaned rows, sorted descending (ties keep column order).
pub fn missingness(rows: &[Review], columns: &[ReviewColumn], top: usize) -> Vec<(String, f64)> {
    if rows.is_empty() {
        return columns
            .iter()
            .take(top)
            .map(|c| (c.as_str().to_string(), 0.0))
            .collect();
    }
    let total = rows.len() as f64;
    let mut fractions: Vec<(String, f64)> = columns
        .iter()
        .map(|column| {
            let nulls = rows.iter().filter(|r| r.is_null(*column)).count();
            (column.as_str().to_string(), nulls as f64 / total)
        })
        .collect();
    fractions.sort_by(|a, b| b.1.total_cmp(&a.1));
    fractions.truncate(top);
    fractions
}
