//! Review pipeline orchestration: collect or load, clean, persist to files and SQLite.

pub mod collect;
pub mod db;
pub mod normalize;

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use revu_adapters::{source_for_marketplace, ReplaySource, ReviewSource};
use revu_core::{Marketplace, RawBatch, Review, RunId, SortMode, SortOrder};
use revu_storage::{read_raw_csv, HttpClientConfig, HttpFetcher, RunArtifactStore, RunMetadata};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::collect::{collect_all_modes, CollectRequest};
use crate::db::ReviewDb;
use crate::normalize::{clean, CleanReport};

pub const CRATE_NAME: &str = "revu-sync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub input_csv: PathBuf,
    pub raw_out_dir: PathBuf,
    pub processed_out_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub marketplace: Marketplace,
    pub app_id: String,
    pub lang: String,
    pub country: String,
    pub target_per_mode: usize,
    pub page_size: usize,
    pub sort_modes: Vec<SortMode>,
    pub use_scraper: bool,
    /// Recorded session served instead of the live marketplace when set.
    pub replay_path: Option<PathBuf>,
    pub load_to_db: bool,
    pub db_path: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::with_data_root("./data")
    }
}

impl PipelineConfig {
    /// Defaults with every path placed under `root`.
    pub fn with_data_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            input_csv: root.join("raw").join("reviews_raw.csv"),
            raw_out_dir: root.join("raw"),
            processed_out_dir: root.join("processed"),
            logs_dir: root.join("logs"),
            marketplace: Marketplace::GooglePlay,
            app_id: "com.openai.chatgpt".to_string(),
            lang: "en".to_string(),
            country: "us".to_string(),
            target_per_mode: 2500,
            page_size: 200,
            sort_modes: default_sort_modes(Marketplace::GooglePlay),
            use_scraper: true,
            replay_path: None,
            load_to_db: true,
            db_path: root.join("reviews.db"),
            http_timeout_secs: 20,
            user_agent: "revu-bot/0.1".to_string(),
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("REVU_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let mut config = Self::with_data_root(root);

        if let Ok(v) = std::env::var("REVU_MARKETPLACE") {
            if let Some(marketplace) = parse_marketplace(&v) {
                config.marketplace = marketplace;
                config.sort_modes = default_sort_modes(marketplace);
            }
        }
        if let Ok(v) = std::env::var("REVU_APP_ID") {
            config.app_id = v;
        }
        if let Ok(v) = std::env::var("REVU_LANG") {
            config.lang = v;
        }
        if let Ok(v) = std::env::var("REVU_COUNTRY") {
            config.country = v;
        }
        if let Some(v) = std::env::var("REVU_TARGET_PER_MODE").ok().and_then(|v| v.parse().ok()) {
            config.target_per_mode = v;
        }
        if let Some(v) = std::env::var("REVU_PAGE_SIZE").ok().and_then(|v| v.parse().ok()) {
            config.page_size = v;
        }
        if let Ok(v) = std::env::var("REVU_USE_SCRAPER") {
            config.use_scraper = env_flag(&v);
        }
        if let Ok(v) = std::env::var("REVU_LOAD_TO_DB") {
            config.load_to_db = env_flag(&v);
        }
        if let Ok(v) = std::env::var("REVU_INPUT_CSV") {
            config.input_csv = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REVU_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REVU_LOGS_DIR") {
            config.logs_dir = PathBuf::from(v);
        }
        config.replay_path = std::env::var("REVU_REPLAY_PATH").ok().map(PathBuf::from);
        config.user_agent = std::env::var("REVU_USER_AGENT").unwrap_or(config.user_agent);
        config.http_timeout_secs = std::env::var("REVU_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.http_timeout_secs);
        config
    }
}

pub fn default_sort_modes(marketplace: Marketplace) -> Vec<SortMode> {
    match marketplace {
        Marketplace::GooglePlay => vec![
            SortMode::new("newest", SortOrder::Newest),
            SortMode::new("most_relevant", SortOrder::MostRelevant),
        ],
        Marketplace::AppStore => vec![
            SortMode::new("newest", SortOrder::Newest),
            SortMode::new("most_helpful", SortOrder::MostHelpful),
        ],
    }
}

fn parse_marketplace(value: &str) -> Option<Marketplace> {
    match value.trim().to_ascii_lowercase().as_str() {
        "google_play" | "googleplay" | "play" => Some(Marketplace::GooglePlay),
        "app_store" | "appstore" | "itunes" => Some(Marketplace::AppStore),
        _ => None,
    }
}

fn env_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

/// Pipeline step, reported on the `run aborted` log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Collect,
    LoadInput,
    SaveFiles,
    LoadDb,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Collect => "collect",
            Stage::LoadInput => "load_input",
            Stage::SaveFiles => "save_files",
            Stage::LoadDb => "load_db",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub rows_before_dedup: Option<usize>,
    pub rows_raw: usize,
    pub rows_processed: usize,
    pub rows_upserted: Option<usize>,
    pub raw_csv: PathBuf,
    pub processed_csv: PathBuf,
    pub metadata_json: PathBuf,
    pub clean_report: CleanReport,
}

pub struct ReviewPipeline {
    config: PipelineConfig,
    source: Box<dyn ReviewSource>,
    artifacts: RunArtifactStore,
}

impl ReviewPipeline {
    /// Build against the configured marketplace, or the replay file when one is set.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let source: Box<dyn ReviewSource> = match &config.replay_path {
            Some(path) => Box::new(ReplaySource::load(path)?),
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                })?;
                source_for_marketplace(config.marketplace, http)
            }
        };
        Ok(Self::with_source(config, source))
    }

    pub fn with_source(config: PipelineConfig, source: Box<dyn ReviewSource>) -> Self {
        let artifacts = RunArtifactStore::new(
            config.raw_out_dir.clone(),
            config.processed_out_dir.clone(),
        );
        Self {
            config,
            source,
            artifacts,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = RunId::generate();
        let started_at = Local::now();
        let clock = Instant::now();
        info!(
            %run_id,
            app_id = %self.config.app_id,
            marketplace = %self.config.marketplace,
            use_scraper = self.config.use_scraper,
            load_to_db = self.config.load_to_db,
            "run start"
        );

        match self.run_stages(&run_id, started_at).await {
            Ok(summary) => {
                info!(
                    %run_id,
                    rows_raw = summary.rows_raw,
                    rows_processed = summary.rows_processed,
                    duration_sec = clock.elapsed().as_secs_f64(),
                    "run end"
                );
                Ok(summary)
            }
            Err((stage, err)) => {
                error!(%run_id, %stage, error = %format!("{err:#}"), "run aborted");
                Err(err.context(format!("pipeline run {run_id} failed at stage {stage}")))
            }
        }
    }

    async fn run_stages(
        &self,
        run_id: &RunId,
        started_at: DateTime<Local>,
    ) -> Result<RunSummary, (Stage, anyhow::Error)> {
        let (raw, rows_before_dedup) = if self.config.use_scraper {
            let request = CollectRequest {
                app_id: &self.config.app_id,
                lang: &self.config.lang,
                country: &self.config.country,
                target_count: self.config.target_per_mode,
                page_size: self.config.page_size,
            };
            let outcome = collect_all_modes(self.source.as_ref(), &request, &self.config.sort_modes)
                .await
                .map_err(|e| (Stage::Collect, e))?;
            (outcome.batch, Some(outcome.rows_before_dedup))
        } else {
            let batch = read_raw_csv(&self.config.input_csv).map_err(|e| (Stage::LoadInput, e))?;
            (batch, None)
        };

        let (reviews, clean_report) = clean(&raw);

        let (raw_csv, processed_csv, metadata_json) = self
            .save_files(run_id, &raw, &reviews)
            .await
            .map_err(|e| (Stage::SaveFiles, e))?;

        let rows_upserted = if self.config.load_to_db {
            let db = ReviewDb::new(self.config.db_path.clone());
            let n = db
                .upsert_reviews(&reviews, &self.config.app_id, run_id)
                .await
                .map_err(|e| (Stage::LoadDb, e))?;
            Some(n)
        } else {
            None
        };

        Ok(RunSummary {
            run_id: run_id.clone(),
            started_at,
            finished_at: Local::now(),
            rows_before_dedup,
            rows_raw: raw.len(),
            rows_processed: reviews.len(),
            rows_upserted,
            raw_csv,
            processed_csv,
            metadata_json,
            clean_report,
        })
    }

    async fn save_files(
        &self,
        run_id: &RunId,
        raw: &RawBatch,
        reviews: &[Review],
    ) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let raw_artifact = self.artifacts.write_raw(run_id, raw).await?;
        let processed_artifact = self.artifacts.write_processed(run_id, reviews).await?;
        let metadata = RunMetadata::new(run_id.clone(), raw.len(), reviews.len(), &self.config)?;
        let metadata_artifact = self.artifacts.write_metadata(&metadata).await?;
        info!(
            raw = %raw_artifact.path.display(),
            processed = %processed_artifact.path.display(),
            processed_sha256 = %processed_artifact.content_hash,
            "files saved"
        );
        Ok((raw_artifact.path, processed_artifact.path, metadata_artifact.path))
    }
}

pub async fn run_pipeline_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env();
    let pipeline = ReviewPipeline::new(config)?;
    pipeline.run_once().await
}

/// Apply the SQLite schema to the configured database without running the pipeline.
pub async fn migrate_from_env() -> Result<PathBuf> {
    let config = PipelineConfig::from_env();
    let db = ReviewDb::new(config.db_path.clone());
    db.init_schema()
        .await
        .with_context(|| format!("migrating {}", config.db_path.display()))?;
    info!(db = %config.db_path.display(), "schema applied");
    Ok(config.db_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_google_play_modes() {
        let config = PipelineConfig::default();
        assert_eq!(config.app_id, "com.openai.chatgpt");
        assert_eq!(config.target_per_mode, 2500);
        assert_eq!(config.page_size, 200);
        assert!(config.use_scraper && config.load_to_db);
        let names: Vec<_> = config.sort_modes.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["newest", "most_relevant"]);
        assert_eq!(config.processed_out_dir, PathBuf::from("./data/processed"));
    }

    #[test]
    fn app_store_defaults_use_helpful_order() {
        let modes = default_sort_modes(Marketplace::AppStore);
        assert_eq!(modes[1].order, SortOrder::MostHelpful);
        assert_eq!(parse_marketplace(" App_Store "), Some(Marketplace::AppStore));
        assert_eq!(parse_marketplace("steam"), None);
    }

    #[test]
    fn config_snapshot_serializes() {
        let json = serde_json::to_value(PipelineConfig::default()).unwrap();
        assert_eq!(json["marketplace"], "google_play");
        assert_eq!(json["sort_modes"][0]["order"], "newest");
        assert!(json["replay_path"].is_null());
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::LoadInput.to_string(), "load_input");
        assert_eq!(Stage::LoadDb.to_string(), "load_db");
    }
}
