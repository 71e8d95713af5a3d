//! Run artifact storage (CSV snapshots, run metadata) + HTTP fetch utilities for revu.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use reqwest::StatusCode;
use revu_core::{sha256_hex, RawBatch, RawReview, Review, ReviewColumn, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revu-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("input file not found: {}", .0.display())]
    InputNotFound(PathBuf),
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Small observability record written once per run next to the processed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub timestamp: String,
    pub rows_raw: usize,
    pub rows_processed: usize,
    pub columns: Vec<String>,
    pub config: serde_json::Value,
}

impl RunMetadata {
    pub fn new(
        run_id: RunId,
        rows_raw: usize,
        rows_processed: usize,
        config: &impl Serialize,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            run_id,
            timestamp: Local::now().to_rfc3339(),
            rows_raw,
            rows_processed,
            columns: ReviewColumn::all_names(),
            config: serde_json::to_value(config).context("serializing run configuration")?,
        })
    }
}

/// Writes per-run snapshots under a raw and a processed directory.
#[derive(Debug, Clone)]
pub struct RunArtifactStore {
    raw_dir: PathBuf,
    processed_dir: PathBuf,
}

impl RunArtifactStore {
    pub fn new(raw_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            processed_dir: processed_dir.into(),
        }
    }

    pub fn raw_csv_path(&self, run_id: &RunId) -> PathBuf {
        self.raw_dir.join(format!("reviews_raw_{run_id}.csv"))
    }

    pub fn processed_csv_path(&self, run_id: &RunId) -> PathBuf {
        self.processed_dir
            .join(format!("reviews_processed_{run_id}.csv"))
    }

    pub fn metadata_path(&self, run_id: &RunId) -> PathBuf {
        self.processed_dir
            .join(format!("run_metadata_{run_id}.json"))
    }

    pub async fn write_raw(&self, run_id: &RunId, batch: &RawBatch) -> anyhow::Result<StoredArtifact> {
        let bytes = encode_raw_csv(batch)?;
        store_bytes(&self.raw_csv_path(run_id), &bytes).await
    }

    pub async fn write_processed(
        &self,
        run_id: &RunId,
        reviews: &[Review],
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = encode_processed_csv(reviews)?;
        store_bytes(&self.processed_csv_path(run_id), &bytes).await
    }

    pub async fn write_metadata(&self, metadata: &RunMetadata) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(metadata).context("serializing run metadata")?;
        store_bytes(&self.metadata_path(&metadata.run_id), &bytes).await
    }
}

/// Write bytes through a sibling temp file and an atomic rename.
pub async fn store_bytes(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating artifact directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp artifact {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    debug!(path = %path.display(), bytes = bytes.len(), "stored artifact");
    Ok(StoredArtifact {
        content_hash: sha256_hex(bytes),
        path: path.to_path_buf(),
        byte_size: bytes.len(),
    })
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> anyhow::Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv buffer: {}", err.error()))
}

/// Raw snapshot in the batch's own column layout, extra columns included.
pub fn encode_raw_csv(batch: &RawBatch) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&batch.columns)
        .context("writing csv header")?;
    for row in 0..batch.len() {
        writer
            .write_record(
                batch
                    .columns
                    .iter()
                    .map(|name| batch.cell(row, name).unwrap_or_default()),
            )
            .context("writing csv row")?;
    }
    finish_csv(writer)
}

pub fn encode_processed_csv(reviews: &[Review]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(ReviewColumn::ALL.iter().map(|c| c.as_str()))
        .context("writing csv header")?;
    for review in reviews {
        writer.serialize(review).context("writing csv row")?;
    }
    finish_csv(writer)
}

/// Load a raw review CSV. Empty cells read as null; non-review columns are kept as extras.
pub fn read_raw_csv(path: impl AsRef<Path>) -> anyhow::Result<RawBatch> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(StorageError::InputNotFound(path.to_path_buf()).into());
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();

    let columns: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
    let mapping: Vec<Option<ReviewColumn>> =
        columns.iter().map(|h| ReviewColumn::from_name(h)).collect();
    let mut extra: Vec<(String, Vec<Option<String>>)> = columns
        .iter()
        .zip(&mapping)
        .filter(|(_, m)| m.is_none())
        .map(|(name, _)| (name.clone(), Vec::new()))
        .collect();
    if !extra.is_empty() {
        debug!(path = %path.display(), extra = extra.len(), "carrying non-review columns");
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
        let mut row = RawReview::default();
        let mut extra_cells = extra.iter_mut();
        for (i, column) in mapping.iter().enumerate() {
            let value = record
                .get(i)
                .filter(|cell| !cell.is_empty())
                .map(str::to_string);
            match column {
                Some(column) => row.set(*column, value),
                None => {
                    if let Some((_, cells)) = extra_cells.next() {
                        cells.push(value);
                    }
                }
            }
        }
        rows.push(row);
    }

    info!(path = %path.display(), rows = rows.len(), cols = columns.len(), "loaded raw csv");
    Ok(RawBatch {
        columns,
        rows,
        extra,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot HTTP client: any transport error or non-success status is returned as-is.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url);
        self.send(self.client.get(url)).instrument(span).await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "POST", url);
        self.send(self.client.post(url).form(form))
            .instrument(span)
            .await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!(status = status.as_u16(), "response received");

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
