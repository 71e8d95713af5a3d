//! SQLite sink: idempotent schema, app registration and review upserts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use revu_core::{format_timestamp, Review, RunId};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Row};
use tracing::info;

pub const SCHEMA_SQL: &str = include_str!("../schema/schema_sqlite.sql");

const UPSERT_REVIEW_SQL: &str = r#"
INSERT INTO reviews (
    review_uid, app_id, user_name, rating, review_text, review_date,
    thumbs_up, app_version, sort_mode, scrape_time, run_id
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(review_uid) DO UPDATE SET
    rating = excluded.rating,
    review_text = excluded.review_text,
    review_date = excluded.review_date,
    thumbs_up = excluded.thumbs_up,
    app_version = excluded.app_version,
    sort_mode = excluded.sort_mode,
    scrape_time = excluded.scrape_time,
    run_id = excluded.run_id
"#;

/// A `reviews` row as stored, timestamps kept in their text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredReview {
    pub review_uid: String,
    pub app_id: String,
    pub user_name: Option<String>,
    pub rating: Option<i64>,
    pub review_text: Option<String>,
    pub review_date: Option<String>,
    pub thumbs_up: Option<i64>,
    pub app_version: Option<String>,
    pub sort_mode: Option<String>,
    pub scrape_time: Option<String>,
    pub run_id: String,
}

/// Handle on a SQLite database file. Every operation opens and closes its own connection.
#[derive(Debug, Clone)]
pub struct ReviewDb {
    path: PathBuf,
}

impl ReviewDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<SqliteConnection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .connect()
            .await
            .with_context(|| format!("opening sqlite database {}", self.path.display()))
    }

    pub async fn init_schema(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&mut conn)
            .await
            .context("applying schema_sqlite.sql")?;
        conn.close().await.context("closing sqlite connection")?;
        Ok(())
    }

    /// Register the app, then insert or overwrite every review by `review_uid`.
    pub async fn upsert_reviews(&self, reviews: &[Review], app_id: &str, run_id: &RunId) -> Result<usize> {
        self.init_schema().await?;
        let mut conn = self.connect().await?;

        sqlx::query("INSERT OR IGNORE INTO apps (app_id) VALUES (?)")
            .bind(app_id)
            .execute(&mut conn)
            .await
            .with_context(|| format!("registering app {app_id}"))?;

        for review in reviews {
            sqlx::query(UPSERT_REVIEW_SQL)
                .bind(review.review_uid.as_str())
                .bind(app_id)
                .bind(review.user_name.as_deref())
                .bind(review.rating)
                .bind(review.review_text.as_str())
                .bind(review.review_date.as_ref().map(format_timestamp))
                .bind(review.thumbs_up)
                .bind(review.app_version.as_deref())
                .bind(review.sort_mode.as_deref())
                .bind(review.scrape_time.as_ref().map(format_timestamp))
                .bind(run_id.as_str())
                .execute(&mut conn)
                .await
                .with_context(|| format!("upserting review {}", review.review_uid))?;
        }

        conn.close().await.context("closing sqlite connection")?;
        info!(rows = reviews.len(), app_id, %run_id, "db upsert complete");
        Ok(reviews.len())
    }

    pub async fn count_reviews(&self) -> Result<i64> {
        let mut conn = self.connect().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews")
            .fetch_one(&mut conn)
            .await
            .context("counting reviews")?;
        conn.close().await.context("closing sqlite connection")?;
        Ok(count)
    }

    pub async fn fetch_review(&self, review_uid: &str) -> Result<Option<StoredReview>> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(
            "SELECT review_uid, app_id, user_name, rating, review_text, review_date, \
             thumbs_up, app_version, sort_mode, scrape_time, run_id \
             FROM reviews WHERE review_uid = ?",
        )
        .bind(review_uid)
        .fetch_optional(&mut conn)
        .await
        .with_context(|| format!("loading review {review_uid}"))?;
        conn.close().await.context("closing sqlite connection")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredReview {
            review_uid: row.try_get("review_uid")?,
            app_id: row.try_get("app_id")?,
            user_name: row.try_get("user_name")?,
            rating: row.try_get("rating")?,
            review_text: row.try_get("review_text")?,
            review_date: row.try_get("review_date")?,
            thumbs_up: row.try_get("thumbs_up")?,
            app_version: row.try_get("app_version")?,
            sort_mode: row.try_get("sort_mode")?,
            scrape_time: row.try_get("scrape_time")?,
            run_id: row.try_get("run_id")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revu_core::parse_lenient_timestamp;

    fn review(uid: &str, rating: Option<i64>) -> Review {
        Review {
            review_uid: uid.to_string(),
            user_name: Some("Ana".into()),
            rating,
            review_text: "works".into(),
            review_date: parse_lenient_timestamp("2024-03-01 10:00:00"),
            thumbs_up: None,
            app_version: Some("1.2.3".into()),
            sort_mode: Some("newest".into()),
            scrape_time: parse_lenient_timestamp("2024-03-02 08:00:00"),
        }
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = ReviewDb::new(dir.path().join("nested").join("reviews.db"));
        db.init_schema().await.unwrap();
        db.init_schema().await.unwrap();
        assert_eq!(db.count_reviews().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row_per_uid() {
        let dir = tempfile::tempdir().unwrap();
        let db = ReviewDb::new(dir.path().join("reviews.db"));
        let run = RunId::generate();
        let batch = vec![review("a", Some(5)), review("b", Some(2))];

        db.upsert_reviews(&batch, "com.example", &run).await.unwrap();
        db.upsert_reviews(&batch, "com.example", &run).await.unwrap();

        assert_eq!(db.count_reviews().await.unwrap(), 2);
        let stored = db.fetch_review("a").await.unwrap().unwrap();
        assert_eq!(stored.app_id, "com.example");
        assert_eq!(stored.rating, Some(5));
        assert_eq!(stored.review_date.as_deref(), Some("2024-03-01 10:00:00"));
        assert_eq!(stored.run_id, run.as_str());
    }

    #[tokio::test]
    async fn later_run_overwrites_non_identity_fields() {
        let dir = tempfile::tempdir().unwrap();
        let db = ReviewDb::new(dir.path().join("reviews.db"));
        let first = RunId::generate();
        let second = RunId::generate();

        db.upsert_reviews(&[review("a", Some(5))], "com.example", &first)
            .await
            .unwrap();
        let mut changed = review("a", Some(1));
        changed.sort_mode = Some("most_relevant".into());
        db.upsert_reviews(&[changed], "com.example", &second)
            .await
            .unwrap();

        let stored = db.fetch_review("a").await.unwrap().unwrap();
        assert_eq!(stored.rating, Some(1));
        assert_eq!(stored.sort_mode.as_deref(), Some("most_relevant"));
        assert_eq!(stored.run_id, second.as_str());
        assert_eq!(db.count_reviews().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn null_integers_stay_null() {
        let dir = tempfile::tempdir().unwrap();
        let db = ReviewDb::new(dir.path().join("reviews.db"));
        db.upsert_reviews(&[review("a", None)], "com.example", &RunId::generate())
            .await
            .unwrap();
        let stored = db.fetch_review("a").await.unwrap().unwrap();
        assert_eq!(stored.rating, None);
        assert_eq!(stored.thumbs_up, None);
        assert!(db.fetch_review("missing").await.unwrap().is_none());
    }
}
