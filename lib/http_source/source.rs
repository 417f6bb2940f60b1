use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::error_mapping::map_api_error_to_discovery;
use super::{ApiClient, ApiError};
use crate::scan::{DiscoveredItem, DiscoveryError, ItemSource};
use crate::work::WorkId;

/// Discovery over the photo API's `/photos` listing and `/search/photos`.
pub struct HttpItemSource {
    api: Arc<ApiClient>,
}

impl HttpItemSource {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    async fn fetch_listing(&self, page: u64) -> Result<Vec<DiscoveredItem>, ApiError> {
        let config = self.api.config();
        let resource = format!("listing page {page}");
        let url = format!("{}/photos", config.base_url);
        let query = [
            // The API counts pages from 1.
            ("page", (page + 1).to_string()),
            ("per_page", config.list_page_size.to_string()),
            ("order_by", config.order_by.clone()),
        ];
        let body = self.api.get_json(&url, &query, &resource).await?;
        let Value::Array(records) = body else {
            return Err(malformed(&resource, "expected a JSON array"));
        };
        parse_records(records, &resource)
    }

    async fn fetch_search(&self, search: &str, page: u64) -> Result<Vec<DiscoveredItem>, ApiError> {
        let config = self.api.config();
        let resource = format!("search {search:?} page {page}");
        let url = format!("{}/search/photos", config.base_url);
        let query = [
            ("query", search.to_string()),
            ("page", (page + 1).to_string()),
            ("per_page", config.search_page_size.to_string()),
            ("content_filter", "high".to_string()),
        ];
        let mut body = self.api.get_json(&url, &query, &resource).await?;
        match body.get_mut("results").map(Value::take) {
            Some(Value::Array(records)) => parse_records(records, &resource),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(malformed(&resource, "`results` is not an array")),
        }
    }
}

impl ItemSource for HttpItemSource {
    fn page_size(&self) -> u64 {
        self.api.config().list_page_size
    }

    fn list_page<'a>(
        &'a self,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>> {
        Box::pin(async move {
            self.fetch_listing(page)
                .await
                .map_err(map_api_error_to_discovery)
        })
    }

    fn search<'a>(
        &'a self,
        query: &'a str,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>> {
        Box::pin(async move {
            self.fetch_search(query, page)
                .await
                .map_err(map_api_error_to_discovery)
        })
    }
}

/// Every record must carry a usable id: dropping one would shift the positions of the rest.
fn parse_records(records: Vec<Value>, resource: &str) -> Result<Vec<DiscoveredItem>, ApiError> {
    records
        .into_iter()
        .map(|record| discovered_from_record(record).map_err(|message| malformed(resource, &message)))
        .collect()
}

pub(super) fn discovered_from_record(record: Value) -> Result<DiscoveredItem, String> {
    let raw_id = match record.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err("record has no id".to_string()),
    };
    let work_id = WorkId::parse(&raw_id)?;
    let download_url = download_location(&record);
    let mut item = DiscoveredItem::new(work_id);
    item.download_url = download_url;
    item.metadata = record;
    Ok(item)
}

pub(super) fn download_location(record: &Value) -> Option<String> {
    record
        .pointer("/links/download_location")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn malformed(resource: &str, message: &str) -> ApiError {
    ApiError::Malformed {
        resource: resource.to_string(),
        message: message.to_string(),
    }
}
