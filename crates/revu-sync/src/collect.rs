//! Paginated collection per sort mode and the multi-mode aggregation on top of it.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use revu_adapters::{AdapterError, ContinuationToken, MarketplaceReview, PageRequest, ReviewSource};
use revu_core::{format_timestamp, review_uid, RawBatch, RawReview, SortMode};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectRequest<'a> {
    pub app_id: &'a str,
    pub lang: &'a str,
    pub country: &'a str,
    pub target_count: usize,
    pub page_size: usize,
}

pub fn to_raw_review(item: MarketplaceReview, sort_name: &str, scrape_time: NaiveDateTime) -> RawReview {
    RawReview {
        review_uid: Some(review_uid(
            item.user_name.as_deref(),
            item.at.as_deref(),
            item.content.as_deref(),
        )),
        user_name: item.user_name,
        rating: item.score.map(|v| v.to_string()),
        review_text: item.content,
        review_date: item.at,
        thumbs_up: item.thumbs_up_count.map(|v| v.to_string()),
        app_version: item.app_version,
        sort_mode: Some(sort_name.to_string()),
        scrape_time: Some(format_timestamp(&scrape_time)),
    }
}

/// Page through one sort mode until the target is reached or the source runs dry.
///
/// The target is only checked before each request, so the last page is kept
/// whole and the result can exceed `target_count`. Source errors abort the
/// collection without returning the rows gathered so far.
pub async fn collect_reviews(
    source: &dyn ReviewSource,
    request: &CollectRequest<'_>,
    mode: &SortMode,
) -> Result<Vec<RawReview>> {
    let page_request = PageRequest {
        app_id: request.app_id,
        lang: request.lang,
        country: request.country,
        order: mode.order,
        count: request.page_size,
    };

    let mut rows: Vec<RawReview> = Vec::new();
    let mut token: Option<ContinuationToken> = None;
    let mut pages = 0usize;

    while rows.len() < request.target_count {
        let page = source
            .fetch_page(&page_request, token.as_ref())
            .await
            .with_context(|| {
                format!(
                    "fetching page {} for sort mode {} of {}",
                    pages + 1,
                    mode.name,
                    request.app_id
                )
            })?;
        pages += 1;

        if page.items.is_empty() {
            debug!(sort_mode = %mode.name, page = pages, "empty page, stopping");
            break;
        }

        let scrape_time = Utc::now().naive_utc();
        rows.extend(
            page.items
                .into_iter()
                .map(|item| to_raw_review(item, &mode.name, scrape_time)),
        );
        info!(
            sort_mode = %mode.name,
            page = pages,
            collected = rows.len().min(request.target_count),
            target = request.target_count,
            "collecting reviews"
        );

        match page.continuation {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    info!(sort_mode = %mode.name, rows = rows.len(), pages, "sort mode collected");
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub batch: RawBatch,
    pub rows_before_dedup: usize,
    /// Rows returned by each sort mode before deduplication, in mode order.
    pub per_mode: Vec<(String, usize)>,
}

/// Keep the first row for every `review_uid`; rows without one are all kept.
pub fn dedup_by_uid(rows: Vec<RawReview>) -> Vec<RawReview> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| match &row.review_uid {
            Some(uid) => seen.insert(uid.clone()),
            None => true,
        })
        .collect()
}

/// Run the collector once per sort mode, concatenate in mode order and dedup.
pub async fn collect_all_modes(
    source: &dyn ReviewSource,
    request: &CollectRequest<'_>,
    modes: &[SortMode],
) -> Result<AggregateOutcome> {
    if let Some(mode) = modes.iter().find(|m| !source.supports(m.order)) {
        return Err(AdapterError::UnsupportedSortOrder {
            marketplace: source.marketplace(),
            order: mode.order,
        })
        .with_context(|| format!("sort mode {} is not collectable", mode.name));
    }

    let mut all_rows = Vec::new();
    let mut per_mode = Vec::with_capacity(modes.len());
    for mode in modes {
        let rows = collect_reviews(source, request, mode).await?;
        per_mode.push((mode.name.clone(), rows.len()));
        all_rows.extend(rows);
    }

    let rows_before_dedup = all_rows.len();
    let rows = dedup_by_uid(all_rows);
    info!(
        rows_before_dedup,
        rows = rows.len(),
        breakdown = ?per_mode,
        "scrape breakdown"
    );

    Ok(AggregateOutcome {
        batch: RawBatch::canonical(rows),
        rows_before_dedup,
        per_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use revu_adapters::ReviewPage;
    use revu_core::{Marketplace, SortOrder};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves `total` items per sort order in pages of `page_len`; the token is the next offset.
    struct PagedSource {
        total: usize,
        page_len: usize,
        shared_items: bool,
        fail_on_request: Option<usize>,
        requests: AtomicUsize,
    }

    impl PagedSource {
        fn new(total: usize, page_len: usize) -> Self {
            Self {
                total,
                page_len,
                shared_items: false,
                fail_on_request: None,
                requests: AtomicUsize::new(0),
            }
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReviewSource for PagedSource {
        fn marketplace(&self) -> Marketplace {
            Marketplace::GooglePlay
        }

        fn supports(&self, order: SortOrder) -> bool {
            order != SortOrder::MostHelpful
        }

        async fn fetch_page(
            &self,
            request: &PageRequest<'_>,
            token: Option<&ContinuationToken>,
        ) -> Result<ReviewPage, AdapterError> {
            let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_request == Some(n) {
                return Err(AdapterError::Malformed {
                    marketplace: Marketplace::GooglePlay,
                    reason: "simulated outage".into(),
                });
            }
            let offset: usize = token.map(|t| t.as_str().parse().unwrap()).unwrap_or(0);
            let end = (offset + self.page_len).min(self.total);
            let prefix = if self.shared_items {
                "shared".to_string()
            } else {
                format!("{:?}", request.order)
            };
            let items = (offset..end)
                .map(|i| MarketplaceReview {
                    review_id: Some(format!("{prefix}-{i}")),
                    user_name: Some(format!("{prefix}-user-{i}")),
                    score: Some((i % 5) as i64 + 1),
                    content: Some(format!("review number {i}")),
                    at: Some("2024-03-01 10:00:00".into()),
                    thumbs_up_count: Some(0),
                    app_version: None,
                })
                .collect();
            let continuation = (end < self.total).then(|| ContinuationToken::new(end.to_string()));
            Ok(ReviewPage {
                items,
                continuation,
            })
        }
    }

    fn request(target_count: usize) -> CollectRequest<'static> {
        CollectRequest {
            app_id: "com.example",
            lang: "en",
            country: "us",
            target_count,
            page_size: 200,
        }
    }

    fn newest() -> SortMode {
        SortMode::new("newest", SortOrder::Newest)
    }

    #[tokio::test]
    async fn keeps_whole_last_page_when_crossing_target() {
        let source = PagedSource::new(450, 90);
        let rows = collect_reviews(&source, &request(200), &newest()).await.unwrap();
        assert_eq!(rows.len(), 270);
        assert_eq!(source.requests(), 3);
    }

    #[tokio::test]
    async fn stops_when_continuation_token_is_absent() {
        let source = PagedSource::new(450, 90);
        let rows = collect_reviews(&source, &request(1000), &newest()).await.unwrap();
        assert_eq!(rows.len(), 450);
        assert_eq!(source.requests(), 5);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let source = PagedSource::new(0, 90);
        let rows = collect_reviews(&source, &request(100), &newest()).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(source.requests(), 1);
    }

    #[tokio::test]
    async fn zero_target_makes_no_requests() {
        let source = PagedSource::new(450, 90);
        let rows = collect_reviews(&source, &request(0), &newest()).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(source.requests(), 0);
    }

    #[tokio::test]
    async fn source_errors_abort_collection() {
        let mut source = PagedSource::new(450, 90);
        source.fail_on_request = Some(2);
        let err = collect_reviews(&source, &request(1000), &newest())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("simulated outage"));
        assert_eq!(source.requests(), 2);
    }

    #[tokio::test]
    async fn rows_carry_identity_and_provenance() {
        let source = PagedSource::new(3, 90);
        let rows = collect_reviews(&source, &request(10), &newest()).await.unwrap();
        let first = &rows[0];
        assert_eq!(first.sort_mode.as_deref(), Some("newest"));
        assert_eq!(first.rating.as_deref(), Some("1"));
        assert_eq!(
            first.review_uid.as_deref(),
            Some(
                review_uid(
                    Some("Newest-user-0"),
                    Some("2024-03-01 10:00:00"),
                    Some("review number 0")
                )
                .as_str()
            )
        );
        assert!(first.scrape_time.is_some());
    }

    #[tokio::test]
    async fn aggregates_modes_in_order() {
        let source = PagedSource::new(450, 90);
        let modes = vec![
            newest(),
            SortMode::new("most_relevant", SortOrder::MostRelevant),
        ];
        let outcome = collect_all_modes(&source, &request(100), &modes).await.unwrap();

        assert_eq!(
            outcome.per_mode,
            vec![("newest".to_string(), 180), ("most_relevant".to_string(), 180)]
        );
        assert_eq!(outcome.rows_before_dedup, 360);
        assert_eq!(outcome.batch.len(), 360);
        let distinct: BTreeSet<_> = outcome
            .batch
            .rows
            .iter()
            .filter_map(|r| r.sort_mode.clone())
            .collect();
        assert_eq!(distinct.len(), 2);
        assert_eq!(outcome.batch.rows[0].sort_mode.as_deref(), Some("newest"));
        assert_eq!(outcome.batch.rows[359].sort_mode.as_deref(), Some("most_relevant"));
        assert_eq!(outcome.batch.columns.len(), 9);
    }

    #[tokio::test]
    async fn overlapping_modes_keep_first_occurrence() {
        let mut source = PagedSource::new(100, 50);
        source.shared_items = true;
        let modes = vec![
            newest(),
            SortMode::new("most_relevant", SortOrder::MostRelevant),
        ];
        let outcome = collect_all_modes(&source, &request(100), &modes).await.unwrap();
        assert_eq!(outcome.rows_before_dedup, 200);
        assert_eq!(outcome.batch.len(), 100);
        assert!(outcome
            .batch
            .rows
            .iter()
            .all(|r| r.sort_mode.as_deref() == Some("newest")));
    }

    #[tokio::test]
    async fn empty_collection_still_has_canonical_columns() {
        let source = PagedSource::new(0, 50);
        let outcome = collect_all_modes(&source, &request(100), &[newest()]).await.unwrap();
        assert!(outcome.batch.is_empty());
        assert_eq!(outcome.batch.columns.len(), 9);
    }

    #[tokio::test]
    async fn unsupported_mode_fails_before_any_request() {
        let source = PagedSource::new(100, 50);
        let modes = vec![newest(), SortMode::new("helpful", SortOrder::MostHelpful)];
        let err = collect_all_modes(&source, &request(100), &modes).await.unwrap_err();
        assert!(format!("{err:#}").contains("helpful"));
        assert_eq!(source.requests(), 0);
    }

    #[test]
    fn dedup_is_idempotent() {
        let row = |uid: &str| RawReview {
            review_uid: Some(uid.to_string()),
            ..Default::default()
        };
        let rows = vec![row("a"), row("b"), row("a"), RawReview::default(), RawReview::default()];
        let once = dedup_by_uid(rows);
        assert_eq!(once.len(), 4);
        let doubled: Vec<_> = once.iter().cloned().chain(once.iter().cloned()).collect();
        let twice = dedup_by_uid(dedup_by_uid(doubled));
        assert_eq!(twice.iter().filter(|r| r.review_uid.is_some()).count(), 2);
    }
}
