//! Marketplace review source contracts + Google Play / App Store / replay implementations.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use revu_core::{format_timestamp, Marketplace, SortOrder};
use revu_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "revu-adapters";

/// One review item as a marketplace returns it, before any normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceReview {
    pub review_id: Option<String>,
    pub user_name: Option<String>,
    pub score: Option<i64>,
    pub content: Option<String>,
    /// Raw timestamp label as used for identity hashing.
    pub at: Option<String>,
    pub thumbs_up_count: Option<i64>,
    pub app_version: Option<String>,
}

/// Opaque cursor handed back by a marketplace; absence means no further pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPage {
    pub items: Vec<MarketplaceReview>,
    #[serde(default)]
    pub continuation: Option<ContinuationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest<'a> {
    pub app_id: &'a str,
    pub lang: &'a str,
    pub country: &'a str,
    pub order: SortOrder,
    pub count: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {marketplace} payload: {reason}")]
    Malformed {
        marketplace: Marketplace,
        reason: String,
    },
    #[error("{marketplace} does not support sort order {order:?}")]
    UnsupportedSortOrder {
        marketplace: Marketplace,
        order: SortOrder,
    },
}

#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn marketplace(&self) -> Marketplace;

    fn supports(&self, order: SortOrder) -> bool;

    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        token: Option<&ContinuationToken>,
    ) -> Result<ReviewPage, AdapterError>;
}

fn json_at<'a>(value: &'a JsonValue, path: &[usize]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for index in path {
        cur = cur.get(*index)?;
    }
    Some(cur)
}

fn json_str_at(value: &JsonValue, path: &[usize]) -> Option<String> {
    json_at(value, path)?.as_str().map(ToString::to_string)
}

fn json_i64_at(value: &JsonValue, path: &[usize]) -> Option<i64> {
    json_at(value, path)?.as_i64()
}

const GOOGLE_PLAY_BASE_URL: &str = "https://play.google.com";
const GOOGLE_PLAY_REVIEWS_RPC: &str = "UsvDTd";

#[derive(Debug, Clone)]
pub struct GooglePlaySource {
    http: HttpFetcher,
    base_url: String,
}

impl GooglePlaySource {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, GOOGLE_PLAY_BASE_URL)
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn sort_value(order: SortOrder) -> Option<u8> {
        match order {
            SortOrder::MostRelevant => Some(1),
            SortOrder::Newest => Some(2),
            SortOrder::Rating => Some(3),
            SortOrder::MostHelpful => None,
        }
    }
}

/// Build the `f.req` form value of a batchexecute review request.
pub fn google_play_request_body(
    app_id: &str,
    sort: u8,
    count: usize,
    token: Option<&ContinuationToken>,
) -> String {
    let inner = serde_json::json!([
        null,
        null,
        [2, sort, [count, null, token.map(ContinuationToken::as_str)], null, [null, null, null, null, null, null, null, null, null]],
        [app_id, 7]
    ]);
    serde_json::json!([[[GOOGLE_PLAY_REVIEWS_RPC, inner.to_string(), null, "generic"]]]).to_string()
}

fn google_play_malformed(reason: impl Into<String>) -> AdapterError {
    AdapterError::Malformed {
        marketplace: Marketplace::GooglePlay,
        reason: reason.into(),
    }
}

fn google_play_item(value: &JsonValue) -> MarketplaceReview {
    let at = json_i64_at(value, &[5, 0])
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| format_timestamp(&dt.naive_utc()));
    MarketplaceReview {
        review_id: json_str_at(value, &[0]),
        user_name: json_str_at(value, &[1, 0]),
        score: json_i64_at(value, &[2]),
        content: json_str_at(value, &[4]),
        at,
        thumbs_up_count: json_i64_at(value, &[6]),
        app_version: json_str_at(value, &[10]),
    }
}

/// Parse a batchexecute response: `)]}'` guard, envelope, then the nested
/// JSON payload holding items at `[0]` and the token at `[-2][-1]`.
pub fn parse_google_play_response(body: &str) -> Result<ReviewPage, AdapterError> {
    let payload = body
        .trim_start()
        .strip_prefix(")]}'")
        .ok_or_else(|| google_play_malformed("missing )]}' guard"))?;
    let envelope: JsonValue = serde_json::Deserializer::from_str(payload)
        .into_iter::<JsonValue>()
        .next()
        .ok_or_else(|| google_play_malformed("empty response body"))?
        .map_err(|e| google_play_malformed(format!("invalid envelope json: {e}")))?;

    let Some(inner) = json_at(&envelope, &[0, 2]).and_then(JsonValue::as_str) else {
        return Ok(ReviewPage::default());
    };
    let data: JsonValue = serde_json::from_str(inner)
        .map_err(|e| google_play_malformed(format!("invalid review payload json: {e}")))?;

    let items = data
        .get(0)
        .and_then(JsonValue::as_array)
        .map(|arr| arr.iter().map(google_play_item).collect())
        .unwrap_or_default();

    let continuation = data
        .as_array()
        .filter(|arr| arr.len() >= 2)
        .and_then(|arr| arr[arr.len() - 2].as_array())
        .and_then(|arr| arr.last())
        .and_then(JsonValue::as_str)
        .map(ContinuationToken::new);

    Ok(ReviewPage {
        items,
        continuation,
    })
}

#[async_trait]
impl ReviewSource for GooglePlaySource {
    fn marketplace(&self) -> Marketplace {
        Marketplace::GooglePlay
    }

    fn supports(&self, order: SortOrder) -> bool {
        Self::sort_value(order).is_some()
    }

    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        token: Option<&ContinuationToken>,
    ) -> Result<ReviewPage, AdapterError> {
        let sort = Self::sort_value(request.order).ok_or(AdapterError::UnsupportedSortOrder {
            marketplace: Marketplace::GooglePlay,
            order: request.order,
        })?;
        let url = format!(
            "{}/_/PlayStoreUi/data/batchexecute?hl={}&gl={}",
            self.base_url, request.lang, request.country
        );
        let body = google_play_request_body(request.app_id, sort, request.count, token);
        let resp = self.http.post_form(&url, &[("f.req", body.as_str())]).await?;
        let page = parse_google_play_response(&resp.text())?;
        debug!(
            items = page.items.len(),
            has_next = page.continuation.is_some(),
            "google play page parsed"
        );
        Ok(page)
    }
}

const APP_STORE_BASE_URL: &str = "https://itunes.apple.com";
/// The customer-review RSS feed stops serving after this page.
pub const APP_STORE_MAX_PAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct AppStoreSource {
    http: HttpFetcher,
    base_url: String,
}

impl AppStoreSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, APP_STORE_BASE_URL)
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn sort_value(order: SortOrder) -> Option<&'static str> {
        match order {
            SortOrder::Newest => Some("mostRecent"),
            SortOrder::MostHelpful => Some("mostHelpful"),
            SortOrder::MostRelevant | SortOrder::Rating => None,
        }
    }
}

fn app_store_malformed(reason: impl Into<String>) -> AdapterError {
    AdapterError::Malformed {
        marketplace: Marketplace::AppStore,
        reason: reason.into(),
    }
}

fn label<'a>(entry: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = entry;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.get("label")?.as_str()
}

fn app_store_item(entry: &JsonValue) -> MarketplaceReview {
    MarketplaceReview {
        review_id: label(entry, &["id"]).map(ToString::to_string),
        user_name: label(entry, &["author", "name"]).map(ToString::to_string),
        score: label(entry, &["im:rating"]).and_then(|s| s.trim().parse().ok()),
        content: label(entry, &["content"]).map(ToString::to_string),
        at: label(entry, &["updated"]).map(ToString::to_string),
        thumbs_up_count: label(entry, &["im:voteCount"]).and_then(|s| s.trim().parse().ok()),
        app_version: label(entry, &["im:version"]).map(ToString::to_string),
    }
}

/// Parse one RSS JSON feed page. Entries without a rating (the app metadata
/// entry some feeds lead with) are skipped.
pub fn parse_app_store_feed(body: &str, page: usize) -> Result<ReviewPage, AdapterError> {
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| app_store_malformed(format!("invalid feed json: {e}")))?;
    let entries = match value.get("feed").and_then(|f| f.get("entry")) {
        Some(JsonValue::Array(entries)) => entries.iter().collect::<Vec<_>>(),
        Some(entry @ JsonValue::Object(_)) => vec![entry],
        _ => Vec::new(),
    };

    let items: Vec<MarketplaceReview> = entries
        .into_iter()
        .filter(|entry| entry.get("im:rating").is_some())
        .map(app_store_item)
        .collect();

    let continuation = (!items.is_empty() && page < APP_STORE_MAX_PAGES)
        .then(|| ContinuationToken::new((page + 1).to_string()));
    Ok(ReviewPage {
        items,
        continuation,
    })
}

#[async_trait]
impl ReviewSource for AppStoreSource {
    fn marketplace(&self) -> Marketplace {
        Marketplace::AppStore
    }

    fn supports(&self, order: SortOrder) -> bool {
        Self::sort_value(order).is_some()
    }

    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        token: Option<&ContinuationToken>,
    ) -> Result<ReviewPage, AdapterError> {
        let sort = Self::sort_value(request.order).ok_or(AdapterError::UnsupportedSortOrder {
            marketplace: Marketplace::AppStore,
            order: request.order,
        })?;
        let page = match token {
            Some(token) => token
                .as_str()
                .parse::<usize>()
                .map_err(|_| app_store_malformed(format!("bad page token {:?}", token.as_str())))?,
            None => 1,
        };
        let url = format!(
            "{}/{}/rss/customerreviews/page={}/id={}/sortby={}/json",
            self.base_url, request.country, page, request.app_id, sort
        );
        let resp = self.http.get(&url).await?;
        parse_app_store_feed(&resp.text(), page)
    }
}

pub fn source_for_marketplace(marketplace: Marketplace, http: HttpFetcher) -> Box<dyn ReviewSource> {
    match marketplace {
        Marketplace::GooglePlay => Box::new(GooglePlaySource::new(http)),
        Marketplace::AppStore => Box::new(AppStoreSource::new(http)),
    }
}

/// Recorded pages for one sort order, served in sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedMode {
    pub order: SortOrder,
    pub pages: Vec<ReviewPage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedSession {
    pub marketplace: Marketplace,
    pub modes: Vec<RecordedMode>,
}

/// Offline source replaying recorded pages; each sort order has its own cursor.
/// Requests past the end of a recording get an empty page.
#[derive(Debug)]
pub struct ReplaySource {
    marketplace: Marketplace,
    pages: HashMap<SortOrder, Vec<ReviewPage>>,
    cursors: Mutex<HashMap<SortOrder, usize>>,
    requests: Mutex<Vec<(SortOrder, Option<ContinuationToken>)>>,
}

impl ReplaySource {
    pub fn new(session: RecordedSession) -> Self {
        let pages = session
            .modes
            .into_iter()
            .map(|mode| (mode.order, mode.pages))
            .collect();
        Self {
            marketplace: session.marketplace,
            pages,
            cursors: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let session: RecordedSession =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(session))
    }

    /// Every request served so far, in order.
    pub fn requests(&self) -> Vec<(SortOrder, Option<ContinuationToken>)> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReviewSource for ReplaySource {
    fn marketplace(&self) -> Marketplace {
        self.marketplace
    }

    fn supports(&self, order: SortOrder) -> bool {
        self.pages.contains_key(&order)
    }

    async fn fetch_page(
        &self,
        request: &PageRequest<'_>,
        token: Option<&ContinuationToken>,
    ) -> Result<ReviewPage, AdapterError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((request.order, token.cloned()));
        }
        let Some(pages) = self.pages.get(&request.order) else {
            return Err(AdapterError::UnsupportedSortOrder {
                marketplace: self.marketplace,
                order: request.order,
            });
        };
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| AdapterError::Malformed {
                marketplace: self.marketplace,
                reason: "replay cursor lock poisoned".to_string(),
            })?;
        let cursor = cursors.entry(request.order).or_insert(0);
        let page = pages.get(*cursor).cloned().unwrap_or_default();
        *cursor += 1;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google_play_fixture(token: Option<&str>) -> String {
        let payload = serde_json::json!([
            [
                ["gp:AOqp1", ["Ana", [null, 2, null, [null, null, "https://img"]]], 5, null, "Love it",
                 [1709287200, 0], 3, null, null, null, "1.2.3"],
                ["gp:AOqp2", ["Bo"], 1, null, "Crashes on start", [1709290800, 0], 0, null, null, null, null]
            ],
            null,
            [null, token],
            null
        ]);
        let envelope = serde_json::json!([
            ["wrb.fr", "UsvDTd", payload.to_string(), null, null, null, "generic"],
            ["di", 42]
        ]);
        format!(")]}}'\n\n{}\n", envelope)
    }

    #[test]
    fn google_play_items_and_token_are_extracted() {
        let page = parse_google_play_response(&google_play_fixture(Some("CsQBCr8B"))).unwrap();
        assert_eq!(page.items.len(), 2);
        let first = &page.items[0];
        assert_eq!(first.review_id.as_deref(), Some("gp:AOqp1"));
        assert_eq!(first.user_name.as_deref(), Some("Ana"));
        assert_eq!(first.score, Some(5));
        assert_eq!(first.content.as_deref(), Some("Love it"));
        assert_eq!(first.at.as_deref(), Some("2024-03-01 10:00:00"));
        assert_eq!(first.thumbs_up_count, Some(3));
        assert_eq!(first.app_version.as_deref(), Some("1.2.3"));
        assert_eq!(page.items[1].app_version, None);
        assert_eq!(page.continuation, Some(ContinuationToken::new("CsQBCr8B")));
    }

    #[test]
    fn google_play_null_token_means_last_page() {
        let page = parse_google_play_response(&google_play_fixture(None)).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.continuation, None);
    }

    #[test]
    fn google_play_null_payload_is_an_empty_page() {
        let body = ")]}'\n\n[[\"wrb.fr\",\"UsvDTd\",null,null,null,[5],\"generic\"]]";
        let page = parse_google_play_response(body).unwrap();
        assert!(page.items.is_empty());
        assert!(page.continuation.is_none());
    }

    #[test]
    fn google_play_rejects_unguarded_body() {
        let err = parse_google_play_response("<html>blocked</html>").unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Malformed {
                marketplace: Marketplace::GooglePlay,
                ..
            }
        ));
    }

    #[test]
    fn google_play_request_body_threads_token() {
        let first = google_play_request_body("com.example", 2, 200, None);
        let outer: JsonValue = serde_json::from_str(&first).unwrap();
        assert_eq!(outer[0][0][0], "UsvDTd");
        let inner: JsonValue = serde_json::from_str(outer[0][0][1].as_str().unwrap()).unwrap();
        assert_eq!(inner[2][1], 2);
        assert_eq!(inner[2][2][0], 200);
        assert!(inner[2][2][2].is_null());
        assert_eq!(inner[3][0], "com.example");

        let next = google_play_request_body("com.example", 2, 200, Some(&ContinuationToken::new("tok")));
        let outer: JsonValue = serde_json::from_str(&next).unwrap();
        let inner: JsonValue = serde_json::from_str(outer[0][0][1].as_str().unwrap()).unwrap();
        assert_eq!(inner[2][2][2], "tok");
    }

    #[test]
    fn app_store_feed_skips_metadata_entry_and_pages_forward() {
        let body = serde_json::json!({
            "feed": {
                "entry": [
                    {"im:name": {"label": "Some App"}},
                    {
                        "id": {"label": "1001"},
                        "author": {"name": {"label": "Cy"}},
                        "im:rating": {"label": "4"},
                        "title": {"label": "Nice"},
                        "content": {"label": "Works well"},
                        "im:version": {"label": "8.1"},
                        "im:voteCount": {"label": "2"},
                        "updated": {"label": "2024-03-01T03:00:00-07:00"}
                    }
                ]
            }
        })
        .to_string();

        let page = parse_app_store_feed(&body, 1).unwrap();
        assert_eq!(page.items.len(), 1);
        let item = &page.items[0];
        assert_eq!(item.user_name.as_deref(), Some("Cy"));
        assert_eq!(item.score, Some(4));
        assert_eq!(item.thumbs_up_count, Some(2));
        assert_eq!(item.at.as_deref(), Some("2024-03-01T03:00:00-07:00"));
        assert_eq!(page.continuation, Some(ContinuationToken::new("2")));

        let last = parse_app_store_feed(&body, APP_STORE_MAX_PAGES).unwrap();
        assert!(last.continuation.is_none());
    }

    #[test]
    fn app_store_feed_without_entries_ends_pagination() {
        let page = parse_app_store_feed(r#"{"feed": {"author": {}}}"#, 3).unwrap();
        assert!(page.items.is_empty());
        assert!(page.continuation.is_none());
    }

    #[test]
    fn sort_order_support_differs_per_marketplace() {
        assert_eq!(GooglePlaySource::sort_value(SortOrder::Newest), Some(2));
        assert_eq!(GooglePlaySource::sort_value(SortOrder::MostHelpful), None);
        assert_eq!(AppStoreSource::sort_value(SortOrder::Newest), Some("mostRecent"));
        assert_eq!(AppStoreSource::sort_value(SortOrder::MostRelevant), None);
    }

    #[tokio::test]
    async fn replay_source_serves_pages_per_order() {
        let item = MarketplaceReview {
            user_name: Some("Ana".into()),
            ..Default::default()
        };
        let source = ReplaySource::new(RecordedSession {
            marketplace: Marketplace::GooglePlay,
            modes: vec![RecordedMode {
                order: SortOrder::Newest,
                pages: vec![ReviewPage {
                    items: vec![item.clone()],
                    continuation: Some(ContinuationToken::new("t1")),
                }],
            }],
        });
        let request = PageRequest {
            app_id: "com.example",
            lang: "en",
            country: "us",
            order: SortOrder::Newest,
            count: 200,
        };

        let first = source.fetch_page(&request, None).await.unwrap();
        assert_eq!(first.items, vec![item]);
        let second = source
            .fetch_page(&request, first.continuation.as_ref())
            .await
            .unwrap();
        assert!(second.items.is_empty());
        assert_eq!(source.requests().len(), 2);
        assert!(!source.supports(SortOrder::MostRelevant));

        let other = PageRequest {
            order: SortOrder::Rating,
            ..request
        };
        assert!(source.fetch_page(&other, None).await.is_err());
    }
}
