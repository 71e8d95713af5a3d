//! Descriptive statistics over a processed review CSV, rendered as JSON, Markdown and a per-date CSV.

pub mod sentiment;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use askama::Template;
use chrono::{Local, NaiveDate, NaiveDateTime};
use regex::Regex;
use revu_core::{format_timestamp, parse_lenient_f64, parse_lenient_timestamp, ReviewColumn};
use revu_storage::{store_bytes, StorageError};
use serde::Serialize;
use tracing::info;

use crate::sentiment::SentimentLabel;

pub const CRATE_NAME: &str = "revu-report";

pub const DEFAULT_REPORT_DIR: &str = "reports/eda";

/// Derived per-row columns appended to the frame before profiling.
const FEATURE_COLUMNS: [&str; 4] = ["char_len", "word_len", "is_emoji_or_symbol_only", "is_very_short"];

const SYMBOL_ONLY_PATTERN: &str = r"^[\W_]+$";

/// A known column is either absent from the input file or present with one cell per row.
#[derive(Debug, Clone, PartialEq)]
pub enum Column<T> {
    Absent,
    Present(Vec<Option<T>>),
}

impl<T> Column<T> {
    pub fn null_count(&self) -> Option<usize> {
        match self {
            Column::Absent => None,
            Column::Present(values) => Some(values.iter().filter(|v| v.is_none()).count()),
        }
    }

    pub fn non_null(&self) -> impl Iterator<Item = &T> {
        let values: &[Option<T>] = match self {
            Column::Absent => &[],
            Column::Present(values) => values,
        };
        values.iter().flatten()
    }
}

/// Columnar view of a processed review file with typed cells.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewFrame {
    pub rows: usize,
    /// Header names in file order.
    pub header: Vec<String>,
    pub review_uid: Column<String>,
    pub user_name: Column<String>,
    pub rating: Column<f64>,
    /// Blank cells read as empty strings, never null.
    pub review_text: Column<String>,
    pub review_date: Column<NaiveDateTime>,
    pub thumbs_up: Column<f64>,
    pub app_version: Column<String>,
    pub sort_mode: Column<String>,
    pub scrape_time: Column<NaiveDateTime>,
    pub extra: Vec<(String, Vec<Option<String>>)>,
}

impl ReviewFrame {
    /// Build from raw string cells keyed by header name; cells that fail to parse become null.
    pub fn from_cells(header: Vec<String>, cells: Vec<Vec<Option<String>>>) -> Self {
        let rows = cells.len();
        let index = |name: &str| header.iter().position(|h| h == name);
        let column_of = |i: usize| -> Vec<Option<String>> {
            cells
                .iter()
                .map(|row| row.get(i).cloned().flatten())
                .collect()
        };
        let text = |column: ReviewColumn| -> Column<String> {
            match index(column.as_str()) {
                Some(i) => Column::Present(column_of(i)),
                None => Column::Absent,
            }
        };
        let number = |column: ReviewColumn| -> Column<f64> {
            match index(column.as_str()) {
                Some(i) => Column::Present(
                    column_of(i)
                        .iter()
                        .map(|v| v.as_deref().and_then(parse_lenient_f64))
                        .collect(),
                ),
                None => Column::Absent,
            }
        };
        let timestamp = |column: ReviewColumn| -> Column<NaiveDateTime> {
            match index(column.as_str()) {
                Some(i) => Column::Present(
                    column_of(i)
                        .iter()
                        .map(|v| v.as_deref().and_then(parse_lenient_timestamp))
                        .collect(),
                ),
                None => Column::Absent,
            }
        };

        let review_text = match index(ReviewColumn::ReviewText.as_str()) {
            Some(i) => Column::Present(
                column_of(i)
                    .into_iter()
                    .map(|v| Some(v.unwrap_or_default()))
                    .collect(),
            ),
            None => Column::Absent,
        };

        let extra = header
            .iter()
            .enumerate()
            .filter(|(_, name)| ReviewColumn::from_name(name).is_none())
            .map(|(i, name)| (name.clone(), column_of(i)))
            .collect();

        Self {
            rows,
            review_uid: text(ReviewColumn::ReviewUid),
            user_name: text(ReviewColumn::UserName),
            rating: number(ReviewColumn::Rating),
            review_text,
            review_date: timestamp(ReviewColumn::ReviewDate),
            thumbs_up: number(ReviewColumn::ThumbsUp),
            app_version: text(ReviewColumn::AppVersion),
            sort_mode: text(ReviewColumn::SortMode),
            scrape_time: timestamp(ReviewColumn::ScrapeTime),
            extra,
            header,
        }
    }

    fn null_count(&self, name: &str) -> Option<usize> {
        match ReviewColumn::from_name(name) {
            Some(ReviewColumn::ReviewUid) => self.review_uid.null_count(),
            Some(ReviewColumn::UserName) => self.user_name.null_count(),
            Some(ReviewColumn::Rating) => self.rating.null_count(),
            Some(ReviewColumn::ReviewText) => self.review_text.null_count(),
            Some(ReviewColumn::ReviewDate) => self.review_date.null_count(),
            Some(ReviewColumn::ThumbsUp) => self.thumbs_up.null_count(),
            Some(ReviewColumn::AppVersion) => self.app_version.null_count(),
            Some(ReviewColumn::SortMode) => self.sort_mode.null_count(),
            Some(ReviewColumn::ScrapeTime) => self.scrape_time.null_count(),
            None => self
                .extra
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, values)| values.iter().filter(|v| v.is_none()).count()),
        }
    }

    /// Review texts, one per row; an absent column reads as all-empty.
    pub fn texts(&self) -> Vec<&str> {
        match &self.review_text {
            Column::Absent => vec![""; self.rows],
            Column::Present(values) => values.iter().map(|v| v.as_deref().unwrap_or("")).collect(),
        }
    }
}

/// Load a processed review CSV. A missing file is fatal before anything is read.
pub fn load_processed_csv(path: impl AsRef<Path>) -> Result<ReviewFrame> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(StorageError::InputNotFound(path.to_path_buf()).into());
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let header: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut cells = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
        let row: Vec<Option<String>> = (0..header.len())
            .map(|i| record.get(i).filter(|c| !c.is_empty()).map(str::to_string))
            .collect();
        cells.push(row);
    }

    info!(path = %path.display(), rows = cells.len(), cols = header.len(), "loaded processed csv");
    Ok(ReviewFrame::from_cells(header, cells))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TextFeatures {
    pub char_len: usize,
    pub word_len: usize,
    pub symbol_only: bool,
    pub very_short: bool,
}

/// Computes [`TextFeatures`] with a compiled symbol-only pattern.
#[derive(Debug, Clone)]
pub struct TextProfiler {
    symbol_only: Regex,
}

impl TextProfiler {
    pub fn new() -> Result<Self> {
        let symbol_only = Regex::new(SYMBOL_ONLY_PATTERN).context("compiling symbol-only pattern")?;
        Ok(Self { symbol_only })
    }

    pub fn features(&self, text: &str) -> TextFeatures {
        let char_len = text.chars().count();
        let word_len = text.split_whitespace().count();
        TextFeatures {
            char_len,
            word_len,
            symbol_only: char_len > 0 && self.symbol_only.is_match(text),
            very_short: word_len <= 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Count {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fraction {
    pub column: String,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingStats {
    /// Per value ascending, nulls last under `missing`.
    pub counts: Vec<Count>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordLengthStats {
    pub mean: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
    pub max: usize,
    pub pct_very_short_le_3_words: f64,
    pub pct_emoji_or_symbol_only: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppVersionStats {
    pub top10: Vec<Count>,
    pub pct_missing: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub rows: usize,
    pub cols: usize,
    pub review_date_min: Option<String>,
    pub review_date_max: Option<String>,
    pub ratings: Option<RatingStats>,
    pub word_len: Option<WordLengthStats>,
    pub missingness_top10: Vec<Fraction>,
    pub sort_mode_counts: Option<Vec<Count>>,
    pub app_version: Option<AppVersionStats>,
    pub sentiment_counts: Vec<Count>,
    pub duplicate_texts: usize,
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation; `0.0` for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let Some(m) = mean(values) else {
        return 0.0;
    };
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Quantile with linear interpolation between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

/// Frequency table, most frequent first; ties keep first-seen order.
fn value_counts<I: IntoIterator<Item = String>>(values: I) -> Vec<Count> {
    let mut counts: Vec<Count> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for value in values {
        match index.get(&value) {
            Some(&i) => counts[i].count += 1,
            None => {
                index.insert(value.clone(), counts.len());
                counts.push(Count { value, count: 1 });
            }
        }
    }
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

fn rating_stats(values: &[Option<f64>]) -> RatingStats {
    let mut by_value: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    let mut nulls = 0usize;
    let mut present = Vec::new();
    for value in values {
        match value {
            Some(v) => {
                // keyed by the rating scaled to three decimals
                let entry = by_value.entry((v * 1000.0).round() as i64).or_insert((*v, 0));
                entry.1 += 1;
                present.push(*v);
            }
            None => nulls += 1,
        }
    }
    let mut counts: Vec<Count> = by_value
        .into_values()
        .map(|(v, count)| Count {
            value: format_number(v),
            count,
        })
        .collect();
    if nulls > 0 {
        counts.push(Count {
            value: "missing".to_string(),
            count: nulls,
        });
    }
    let has_values = !present.is_empty();
    RatingStats {
        counts,
        mean: mean(&present),
        median: quantile(&present, 0.5),
        std: has_values.then(|| sample_std(&present)),
    }
}

fn word_length_stats(features: &[TextFeatures]) -> Option<WordLengthStats> {
    if features.is_empty() {
        return None;
    }
    let words: Vec<f64> = features.iter().map(|f| f.word_len as f64).collect();
    let n = features.len() as f64;
    Some(WordLengthStats {
        mean: mean(&words)?,
        median: quantile(&words, 0.5)?,
        p25: quantile(&words, 0.25)?,
        p75: quantile(&words, 0.75)?,
        p95: quantile(&words, 0.95)?,
        max: features.iter().map(|f| f.word_len).max().unwrap_or(0),
        pct_very_short_le_3_words: features.iter().filter(|f| f.very_short).count() as f64 / n,
        pct_emoji_or_symbol_only: features.iter().filter(|f| f.symbol_only).count() as f64 / n,
    })
}

/// Null fraction over file columns then derived feature columns, highest first.
fn missingness_top10(frame: &ReviewFrame) -> Vec<Fraction> {
    let mut names: Vec<String> = frame.header.clone();
    if frame.review_text == Column::Absent {
        names.push(ReviewColumn::ReviewText.as_str().to_string());
    }
    let mut fractions: Vec<Fraction> = names
        .into_iter()
        .map(|column| {
            let nulls = frame.null_count(&column).unwrap_or(0);
            let fraction = if frame.rows == 0 {
                0.0
            } else {
                nulls as f64 / frame.rows as f64
            };
            Fraction { column, fraction }
        })
        .chain(FEATURE_COLUMNS.iter().map(|c| Fraction {
            column: c.to_string(),
            fraction: 0.0,
        }))
        .collect();
    fractions.sort_by(|a, b| b.fraction.total_cmp(&a.fraction));
    fractions.truncate(10);
    fractions
}

/// Texts that repeat an earlier non-empty text.
pub fn duplicate_text_count(texts: &[&str]) -> usize {
    let mut seen = HashSet::new();
    texts
        .iter()
        .filter(|t| !t.is_empty())
        .filter(|t| !seen.insert(**t))
        .count()
}

pub fn summarize(frame: &ReviewFrame, profiler: &TextProfiler) -> Summary {
    let texts = frame.texts();
    let features: Vec<TextFeatures> = texts.iter().map(|t| profiler.features(t)).collect();

    let synthesized_text = usize::from(frame.review_text == Column::Absent);
    let cols = frame.header.len() + synthesized_text + FEATURE_COLUMNS.len();

    let (review_date_min, review_date_max) = (
        frame.review_date.non_null().min().map(format_timestamp),
        frame.review_date.non_null().max().map(format_timestamp),
    );

    let ratings = match &frame.rating {
        Column::Absent => None,
        Column::Present(values) => Some(rating_stats(values)),
    };

    let sort_mode_counts = match &frame.sort_mode {
        Column::Absent => None,
        Column::Present(values) => Some(value_counts(
            values
                .iter()
                .map(|v| v.clone().unwrap_or_else(|| "missing".to_string())),
        )),
    };

    let app_version = match &frame.app_version {
        Column::Absent => None,
        Column::Present(values) => {
            let mut top10 = value_counts(
                values
                    .iter()
                    .map(|v| v.clone().unwrap_or_else(|| "MISSING".to_string())),
            );
            top10.truncate(10);
            let blank = values
                .iter()
                .filter(|v| v.as_deref().map_or(true, |s| s.trim().is_empty()))
                .count();
            let pct_missing = if values.is_empty() {
                0.0
            } else {
                blank as f64 / values.len() as f64
            };
            Some(AppVersionStats { top10, pct_missing })
        }
    };

    let labels: Vec<SentimentLabel> = texts.iter().map(|t| sentiment::label(t)).collect();
    let sentiment_counts = SentimentLabel::ALL
        .into_iter()
        .map(|label| Count {
            value: label.as_str().to_string(),
            count: labels.iter().filter(|l| **l == label).count(),
        })
        .collect();

    Summary {
        rows: frame.rows,
        cols,
        review_date_min,
        review_date_max,
        ratings,
        word_len: word_length_stats(&features),
        missingness_top10: missingness_top10(frame),
        sort_mode_counts,
        app_version,
        sentiment_counts,
        duplicate_texts: duplicate_text_count(&texts),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeBucket {
    pub date: NaiveDate,
    pub reviews: usize,
    pub avg_rating: Option<f64>,
}

/// Per calendar date of `review_date`: row count and mean rating.
/// `None` when the column is absent or holds no parseable value.
pub fn time_aggregation(frame: &ReviewFrame) -> Option<Vec<TimeBucket>> {
    let Column::Present(dates) = &frame.review_date else {
        return None;
    };
    let mut buckets: BTreeMap<NaiveDate, (usize, Vec<f64>)> = BTreeMap::new();
    for (row, date) in dates.iter().enumerate() {
        let Some(date) = date else { continue };
        let counted = match &frame.review_uid {
            Column::Present(uids) => uids[row].is_some(),
            Column::Absent => true,
        };
        let entry = buckets.entry(date.date()).or_default();
        if counted {
            entry.0 += 1;
        }
        if let Column::Present(ratings) = &frame.rating {
            if let Some(r) = ratings[row] {
                entry.1.push(r);
            }
        }
    }
    if buckets.is_empty() {
        return None;
    }
    Some(
        buckets
            .into_iter()
            .map(|(date, (reviews, ratings))| TimeBucket {
                date,
                reviews,
                avg_rating: mean(&ratings),
            })
            .collect(),
    )
}

pub fn render_json(summary: &Summary) -> Result<String> {
    serde_json::to_string_pretty(summary).context("serializing summary")
}

struct RatingView {
    mean: String,
    median: String,
    std: String,
    counts: Vec<Count>,
}

struct WordLengthView {
    mean: String,
    median: String,
    p25: String,
    p75: String,
    p95: String,
    max: usize,
    pct_very_short: String,
    pct_symbol_only: String,
}

struct FractionView {
    column: String,
    pct: String,
}

struct AppVersionView {
    pct_missing: String,
    top10: Vec<Count>,
}

#[derive(Template)]
#[template(path = "summary.md", escape = "none")]
struct SummaryMarkdown {
    generated_at: String,
    source: String,
    rows: usize,
    cols: usize,
    date_min: String,
    date_max: String,
    ratings: Option<RatingView>,
    text: Option<WordLengthView>,
    sentiment: Vec<Count>,
    duplicate_texts: usize,
    missingness: Vec<FractionView>,
    sort_modes: Option<Vec<Count>>,
    versions: Option<AppVersionView>,
}

fn two_decimals(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"))
}

fn three_decimals(value: f64) -> String {
    format!("{value:.3}")
}

/// Human-readable report: means to two decimals, fractions to three.
pub fn render_markdown(summary: &Summary, source: &str, generated_at: NaiveDateTime) -> Result<String> {
    let view = SummaryMarkdown {
        generated_at: format_timestamp(&generated_at),
        source: source.to_string(),
        rows: summary.rows,
        cols: summary.cols,
        date_min: summary.review_date_min.clone().unwrap_or_else(|| "n/a".to_string()),
        date_max: summary.review_date_max.clone().unwrap_or_else(|| "n/a".to_string()),
        ratings: summary.ratings.as_ref().map(|r| RatingView {
            mean: two_decimals(r.mean),
            median: two_decimals(r.median),
            std: two_decimals(r.std),
            counts: r.counts.clone(),
        }),
        text: summary.word_len.as_ref().map(|w| WordLengthView {
            mean: two_decimals(Some(w.mean)),
            median: two_decimals(Some(w.median)),
            p25: two_decimals(Some(w.p25)),
            p75: two_decimals(Some(w.p75)),
            p95: two_decimals(Some(w.p95)),
            max: w.max,
            pct_very_short: three_decimals(w.pct_very_short_le_3_words),
            pct_symbol_only: three_decimals(w.pct_emoji_or_symbol_only),
        }),
        sentiment: summary.sentiment_counts.clone(),
        duplicate_texts: summary.duplicate_texts,
        missingness: summary
            .missingness_top10
            .iter()
            .map(|f| FractionView {
                column: f.column.clone(),
                pct: three_decimals(f.fraction),
            })
            .collect(),
        sort_modes: summary.sort_mode_counts.clone(),
        versions: summary.app_version.as_ref().map(|v| AppVersionView {
            pct_missing: three_decimals(v.pct_missing),
            top10: v.top10.clone(),
        }),
    };
    view.render().context("rendering summary markdown")
}

pub fn render_time_csv(buckets: &[TimeBucket]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for bucket in buckets {
        writer.serialize(bucket).context("writing time bucket")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv buffer: {}", err.error()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
    pub time_csv: Option<PathBuf>,
}

/// Summarize `csv_path` and write `eda_summary_{stem}.json`, `eda_summary_{stem}.md`
/// and, when dates are available, `eda_time_{stem}.csv` into `outdir`.
pub async fn write_report(csv_path: &Path, outdir: Option<&Path>) -> Result<ReportPaths> {
    let frame = load_processed_csv(csv_path)?;
    let profiler = TextProfiler::new()?;
    let summary = summarize(&frame, &profiler);

    let outdir = outdir.map_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR), Path::to_path_buf);
    let stem = csv_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reviews".to_string());

    let json = outdir.join(format!("eda_summary_{stem}.json"));
    store_bytes(&json, render_json(&summary)?.as_bytes()).await?;

    let markdown = outdir.join(format!("eda_summary_{stem}.md"));
    let body = render_markdown(
        &summary,
        &csv_path.display().to_string(),
        Local::now().naive_local(),
    )?;
    store_bytes(&markdown, body.as_bytes()).await?;

    let time_csv = match time_aggregation(&frame) {
        Some(buckets) => {
            let path = outdir.join(format!("eda_time_{stem}.csv"));
            store_bytes(&path, &render_time_csv(&buckets)?).await?;
            Some(path)
        }
        None => None,
    };

    info!(
        rows = summary.rows,
        json = %json.display(),
        markdown = %markdown.display(),
        time_csv = time_csv.is_some(),
        "eda report written"
    );
    Ok(ReportPaths {
        json,
        markdown,
        time_csv,
    })
}
