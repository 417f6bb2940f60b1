use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use nonzero_ext::nonzero;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use super::{global_rate_limiter, ApiClient, HttpItemFetcher, HttpItemSource, HttpSourceConfig};
use crate::pipeline::{EntryOrigin, FetchErrorKind, ItemFetcher, QueueEntry};
use crate::scan::{DiscoveryErrorKind, ItemSource};
use crate::work::WorkId;

const TOKEN: &str = "test-key";

struct FakeApi {
    base: String,
    total: u64,
    throttled_page: Option<u64>,
}

impl FakeApi {
    fn record(&self, id: &str) -> Value {
        json!({
            "id": id,
            "width": 4000,
            "links": { "download_location": format!("{}/photos/{id}/download", self.base) },
        })
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!("Client-ID {TOKEN}");
    headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) == Some(expected.as_str())
}

fn page_params(params: &HashMap<String, String>) -> (u64, u64) {
    let page = params.get("page").and_then(|raw| raw.parse().ok()).unwrap_or(1);
    let per_page = params.get("per_page").and_then(|raw| raw.parse().ok()).unwrap_or(10);
    (page, per_page)
}

async fn list_photos(
    State(api): State<Arc<FakeApi>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let (page, per_page) = page_params(&params);
    if api.throttled_page == Some(page) {
        return (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "9")], "slow down").into_response();
    }
    let start = (page - 1) * per_page;
    let end = (start + per_page).min(api.total);
    let records: Vec<Value> = (start..end).map(|i| api.record(&format!("p{i}"))).collect();
    Json(Value::Array(records)).into_response()
}

async fn search_photos(
    State(api): State<Arc<FakeApi>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (page, _) = page_params(&params);
    let results = match (params.get("query").map(String::as_str), page) {
        (Some("forest"), 1) => vec![api.record("s1"), api.record("s2")],
        _ => Vec::new(),
    };
    Json(json!({ "total": 2, "results": results })).into_response()
}

async fn photo(State(api): State<Arc<FakeApi>>, Path(id): Path<String>) -> Response {
    if id == "gone" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(api.record(&id)).into_response()
}

async fn download_location(State(api): State<Arc<FakeApi>>, Path(id): Path<String>) -> Response {
    Json(json!({ "url": format!("{}/cdn/{id}.jpg", api.base) })).into_response()
}

async fn cdn(Path(file): Path<String>) -> Response {
    ([(CONTENT_TYPE, "image/jpeg")], format!("jpeg:{file}")).into_response()
}

async fn serve(total: u64, throttled_page: Option<u64>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let base = format!("http://{addr}");
    let api = Arc::new(FakeApi {
        base: base.clone(),
        total,
        throttled_page,
    });
    let app = Router::new()
        .route("/photos", get(list_photos))
        .route("/search/photos", get(search_photos))
        .route("/photos/:id", get(photo))
        .route("/photos/:id/download", get(download_location))
        .route("/cdn/:file", get(cdn))
        .with_state(api);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake api");
    });
    base
}

fn client(base: &str, token: Option<&str>) -> Arc<ApiClient> {
    let config = HttpSourceConfig {
        base_url: format!("{base}/"),
        access_token: token.map(str::to_string),
        list_page_size: 2,
        request_timeout: Duration::from_secs(5),
        ..HttpSourceConfig::default()
    };
    Arc::new(ApiClient::new(config, global_rate_limiter(nonzero!(60_000u32))).expect("client"))
}

fn ids(items: &[crate::scan::DiscoveredItem]) -> Vec<&str> {
    items.iter().map(|item| item.work_id.as_str()).collect()
}

#[tokio::test]
async fn lists_pages_in_order() {
    let base = serve(5, None).await;
    let source = HttpItemSource::new(client(&base, Some(TOKEN)));

    assert_eq!(source.page_size(), 2);
    let first = source.list_page(0).await.expect("page 0");
    assert_eq!(ids(&first), vec!["p0", "p1"]);
    assert_eq!(
        first[0].download_url.as_deref(),
        Some(format!("{base}/photos/p0/download").as_str())
    );
    assert_eq!(first[0].metadata["width"], 4000);

    let last = source.list_page(2).await.expect("page 2");
    assert_eq!(ids(&last), vec!["p4"]);
    assert!(source.list_page(3).await.expect("page 3").is_empty());
}

#[tokio::test]
async fn listing_rate_limit_carries_retry_after() {
    let base = serve(10, Some(2)).await;
    let source = HttpItemSource::new(client(&base, Some(TOKEN)));

    let err = source.list_page(1).await.expect_err("throttled");
    assert_eq!(err.kind, DiscoveryErrorKind::RateLimited);
    assert_eq!(err.retry_after, Some(Duration::from_secs(9)));
}

#[tokio::test]
async fn missing_credentials_are_fatal() {
    let base = serve(5, None).await;
    let source = HttpItemSource::new(client(&base, None));

    let err = source.list_page(0).await.expect_err("unauthorized");
    assert_eq!(err.kind, DiscoveryErrorKind::Fatal);
    assert!(err.message.contains("401"));
}

#[tokio::test]
async fn search_reads_results_until_empty() {
    let base = serve(5, None).await;
    let source = HttpItemSource::new(client(&base, Some(TOKEN)));

    let hits = source.search("forest", 0).await.expect("search");
    assert_eq!(ids(&hits), vec!["s1", "s2"]);
    assert!(source.search("forest", 1).await.expect("page 2").is_empty());
    assert!(source.search("desert", 0).await.expect("no hits").is_empty());
}

#[tokio::test]
async fn fetcher_follows_the_download_location() {
    let base = serve(5, None).await;
    let api = client(&base, Some(TOKEN));
    let listed = HttpItemSource::new(api.clone())
        .list_page(0)
        .await
        .expect("page 0");
    let item = listed[1].clone();
    let entry = QueueEntry::new(item.work_id, EntryOrigin::Scan)
        .with_download_url(item.download_url.expect("location"));

    let fetched = HttpItemFetcher::new(api).fetch(&entry).await.expect("fetch");
    assert_eq!(fetched.bytes, b"jpeg:p1.jpg".to_vec());
    assert_eq!(fetched.content_type.as_deref(), Some("image/jpeg"));
}

#[tokio::test]
async fn fetcher_looks_up_manual_entries() {
    let base = serve(5, None).await;
    let fetcher = HttpItemFetcher::new(client(&base, Some(TOKEN)));

    let manual = QueueEntry::new(WorkId::parse("m7").expect("id"), EntryOrigin::Manual);
    let fetched = fetcher.fetch(&manual).await.expect("fetch");
    assert_eq!(fetched.bytes, b"jpeg:m7.jpg".to_vec());

    let gone = QueueEntry::new(WorkId::parse("gone").expect("id"), EntryOrigin::Manual);
    let err = fetcher.fetch(&gone).await.expect_err("missing");
    assert_eq!(err.kind, FetchErrorKind::NotFound);
    assert!(!err.is_retryable());
}
