//! Core review data model, identity hashing and lenient field parsing for revu.

use std::fmt;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revu-core";

/// Rendering used for timestamps in CSV files, hash inputs and the database.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Stand-in for an absent field inside the identity hash input.
pub const NULL_TOKEN: &str = "None";

/// Stable review identity: SHA-256 hex over `"{author}_{date}_{text}"`.
pub fn review_uid(author: Option<&str>, date: Option<&str>, text: Option<&str>) -> String {
    let raw = format!(
        "{}_{}_{}",
        author.unwrap_or(NULL_TOKEN),
        date.unwrap_or(NULL_TOKEN),
        text.unwrap_or(NULL_TOKEN)
    );
    sha256_hex(raw.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Identity of one pipeline invocation: local start time plus a random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self::started_at(Local::now().naive_local())
    }

    pub fn started_at(started: NaiveDateTime) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}_{}", started.format("%Y%m%d_%H%M%S"), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marketplace {
    GooglePlay,
    AppStore,
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marketplace::GooglePlay => f.write_str("google_play"),
            Marketplace::AppStore => f.write_str("app_store"),
        }
    }
}

/// Traversal order requested from a marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Newest,
    MostRelevant,
    Rating,
    MostHelpful,
}

/// A named sort order; the name is stamped on every row it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortMode {
    pub name: String,
    pub order: SortOrder,
}

impl SortMode {
    pub fn new(name: impl Into<String>, order: SortOrder) -> Self {
        Self {
            name: name.into(),
            order,
        }
    }
}

/// Canonical review columns, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReviewColumn {
    ReviewUid,
    UserName,
    Rating,
    ReviewText,
    ReviewDate,
    ThumbsUp,
    AppVersion,
    SortMode,
    ScrapeTime,
}

impl ReviewColumn {
    pub const ALL: [ReviewColumn; 9] = [
        ReviewColumn::ReviewUid,
        ReviewColumn::UserName,
        ReviewColumn::Rating,
        ReviewColumn::ReviewText,
        ReviewColumn::ReviewDate,
        ReviewColumn::ThumbsUp,
        ReviewColumn::AppVersion,
        ReviewColumn::SortMode,
        ReviewColumn::ScrapeTime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewColumn::ReviewUid => "review_uid",
            ReviewColumn::UserName => "user_name",
            ReviewColumn::Rating => "rating",
            ReviewColumn::ReviewText => "review_text",
            ReviewColumn::ReviewDate => "review_date",
            ReviewColumn::ThumbsUp => "thumbs_up",
            ReviewColumn::AppVersion => "app_version",
            ReviewColumn::SortMode => "sort_mode",
            ReviewColumn::ScrapeTime => "scrape_time",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name.trim())
    }

    pub fn all_names() -> Vec<String> {
        Self::ALL.iter().map(|c| c.as_str().to_string()).collect()
    }
}

/// One review exactly as collected or read back from a raw CSV: every field is text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawReview {
    pub review_uid: Option<String>,
    pub user_name: Option<String>,
    pub rating: Option<String>,
    pub review_text: Option<String>,
    pub review_date: Option<String>,
    pub thumbs_up: Option<String>,
    pub app_version: Option<String>,
    pub sort_mode: Option<String>,
    pub scrape_time: Option<String>,
}

impl RawReview {
    pub fn get(&self, column: ReviewColumn) -> Option<&str> {
        let value = match column {
            ReviewColumn::ReviewUid => &self.review_uid,
            ReviewColumn::UserName => &self.user_name,
            ReviewColumn::Rating => &self.rating,
            ReviewColumn::ReviewText => &self.review_text,
            ReviewColumn::ReviewDate => &self.review_date,
            ReviewColumn::ThumbsUp => &self.thumbs_up,
            ReviewColumn::AppVersion => &self.app_version,
            ReviewColumn::SortMode => &self.sort_mode,
            ReviewColumn::ScrapeTime => &self.scrape_time,
        };
        value.as_deref()
    }

    pub fn set(&mut self, column: ReviewColumn, value: Option<String>) {
        let slot = match column {
            ReviewColumn::ReviewUid => &mut self.review_uid,
            ReviewColumn::UserName => &mut self.user_name,
            ReviewColumn::Rating => &mut self.rating,
            ReviewColumn::ReviewText => &mut self.review_text,
            ReviewColumn::ReviewDate => &mut self.review_date,
            ReviewColumn::ThumbsUp => &mut self.thumbs_up,
            ReviewColumn::AppVersion => &mut self.app_version,
            ReviewColumn::SortMode => &mut self.sort_mode,
            ReviewColumn::ScrapeTime => &mut self.scrape_time,
        };
        *slot = value;
    }
}

/// A batch of raw reviews plus the column names its source actually carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatch {
    /// Header names in input order.
    pub columns: Vec<String>,
    pub rows: Vec<RawReview>,
    /// Non-review input columns, one cell per row.
    pub extra: Vec<(String, Vec<Option<String>>)>,
}

impl RawBatch {
    /// Batch carrying the full canonical column set.
    pub fn canonical(rows: Vec<RawReview>) -> Self {
        Self {
            columns: ReviewColumn::all_names(),
            rows,
            extra: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: ReviewColumn) -> bool {
        self.columns.iter().any(|c| c.trim() == column.as_str())
    }

    /// Cell at `row` under header `name`, whether a review field or an extra column.
    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        match ReviewColumn::from_name(name) {
            Some(column) => self.rows.get(row).and_then(|r| r.get(column)),
            None => self
                .extra
                .iter()
                .find(|(n, _)| n == name)
                .and_then(|(_, cells)| cells.get(row))
                .and_then(|c| c.as_deref()),
        }
    }
}

/// Normalized review ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub review_uid: String,
    pub user_name: Option<String>,
    pub rating: Option<i64>,
    pub review_text: String,
    #[serde(with = "timestamp_opt", default)]
    pub review_date: Option<NaiveDateTime>,
    pub thumbs_up: Option<i64>,
    pub app_version: Option<String>,
    pub sort_mode: Option<String>,
    #[serde(with = "timestamp_opt", default)]
    pub scrape_time: Option<NaiveDateTime>,
}

impl Review {
    pub fn is_null(&self, column: ReviewColumn) -> bool {
        match column {
            ReviewColumn::ReviewUid | ReviewColumn::ReviewText => false,
            ReviewColumn::UserName => self.user_name.is_none(),
            ReviewColumn::Rating => self.rating.is_none(),
            ReviewColumn::ReviewDate => self.review_date.is_none(),
            ReviewColumn::ThumbsUp => self.thumbs_up.is_none(),
            ReviewColumn::AppVersion => self.app_version.is_none(),
            ReviewColumn::SortMode => self.sort_mode.is_none(),
            ReviewColumn::ScrapeTime => self.scrape_time.is_none(),
        }
    }
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Integer parse that accepts `"4"`, `" 4 "` and `"4.0"`; everything else is `None`.
pub fn parse_lenient_int(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    let value = parse_lenient_f64(trimmed)?;
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Finite float parse; `NaN`, infinities and garbage become `None`.
pub fn parse_lenient_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

const NAIVE_TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Timestamp parse over the shapes seen in marketplace payloads and CSV exports.
/// Offset-bearing values are converted to UTC.
pub fn parse_lenient_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.naive_utc());
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(value) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(value);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Serde adapter writing `Option<NaiveDateTime>` as [`TIMESTAMP_FORMAT`] and
/// reading it back leniently.
pub mod timestamp_opt {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&super::format_timestamp(v)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(super::parse_lenient_timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn review_uid_is_deterministic() {
        let a = review_uid(Some("Ana"), Some("2024-03-01 10:00:00"), Some("great app"));
        let b = review_uid(Some("Ana"), Some("2024-03-01 10:00:00"), Some("great app"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, sha256_hex("Ana_2024-03-01 10:00:00_great app".as_bytes()));
    }

    #[test]
    fn review_uid_maps_null_to_none_literal() {
        assert_eq!(
            review_uid(None, Some("2024-03-01 10:00:00"), None),
            sha256_hex(b"None_2024-03-01 10:00:00_None")
        );
        assert_ne!(
            review_uid(None, None, None),
            review_uid(Some(""), Some(""), Some(""))
        );
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn run_id_has_time_prefix_and_random_suffix() {
        let started = NaiveDate::from_ymd_opt(2026, 2, 24)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap();
        let a = RunId::started_at(started);
        let b = RunId::started_at(started);
        assert!(a.as_str().starts_with("20260224_123005_"));
        assert_eq!(a.as_str().len(), "20260224_123005_".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn lenient_int_parsing() {
        assert_eq!(parse_lenient_int("4"), Some(4));
        assert_eq!(parse_lenient_int(" 5.0 "), Some(5));
        assert_eq!(parse_lenient_int("4.5"), None);
        assert_eq!(parse_lenient_int("five"), None);
        assert_eq!(parse_lenient_int(""), None);
        assert_eq!(parse_lenient_int("nan"), None);
    }

    #[test]
    fn lenient_timestamp_parsing() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(parse_lenient_timestamp("2024-03-01 10:00:00"), Some(expected));
        assert_eq!(parse_lenient_timestamp("2024-03-01T10:00:00"), Some(expected));
        assert_eq!(parse_lenient_timestamp("2024-03-01T03:00:00-07:00"), Some(expected));
        assert_eq!(
            parse_lenient_timestamp("2024-03-01"),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_lenient_timestamp("yesterday"), None);
        assert_eq!(parse_lenient_timestamp("  "), None);
    }

    #[test]
    fn review_timestamps_serialize_in_table_format() {
        let review = Review {
            review_uid: "uid".into(),
            user_name: None,
            rating: Some(5),
            review_text: "ok".into(),
            review_date: parse_lenient_timestamp("2024-03-01 10:00:00"),
            thumbs_up: None,
            app_version: None,
            sort_mode: Some("newest".into()),
            scrape_time: None,
        };
        let json = serde_json::to_value(&review).unwrap();
        assert_eq!(json["review_date"], "2024-03-01 10:00:00");
        assert!(json["scrape_time"].is_null());
        let back: Review = serde_json::from_value(json).unwrap();
        assert_eq!(back, review);
    }

    #[test]
    fn batch_cells_resolve_review_and_extra_columns() {
        let batch = RawBatch {
            columns: vec!["title".into(), "rating".into()],
            rows: vec![RawReview {
                rating: Some("5".into()),
                ..Default::default()
            }],
            extra: vec![("title".into(), vec![Some("Nice".into())])],
        };
        assert_eq!(batch.cell(0, "title"), Some("Nice"));
        assert_eq!(batch.cell(0, "rating"), Some("5"));
        assert_eq!(batch.cell(0, "user_name"), None);
        assert_eq!(batch.cell(1, "title"), None);
    }

    #[test]
    fn column_names_round_trip() {
        for column in ReviewColumn::ALL {
            assert_eq!(ReviewColumn::from_name(column.as_str()), Some(column));
        }
        assert_eq!(ReviewColumn::from_name("app_id"), None);
    }
}
