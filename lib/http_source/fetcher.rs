use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::error_mapping::map_api_error_to_fetch;
use super::source::download_location;
use super::{ApiClient, ApiError};
use crate::pipeline::{FetchError, FetchedItem, ItemFetcher, QueueEntry};

/// Downloads the original image behind a queue entry.
///
/// The entry's `download_url` is the API's tracked download location; it resolves to a CDN URL
/// that is fetched without auth. Manually submitted entries have no location yet, so the photo
/// record is looked up first.
pub struct HttpItemFetcher {
    api: Arc<ApiClient>,
}

impl HttpItemFetcher {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    async fn fetch_entry(&self, entry: &QueueEntry) -> Result<FetchedItem, ApiError> {
        let location = match &entry.download_url {
            Some(location) => location.clone(),
            None => self.lookup_download_location(entry).await?,
        };
        let resource = format!("download location for {}", entry.work_id);
        let body = self.api.get_json(&location, &[], &resource).await?;
        let Some(url) = body.get("url").and_then(Value::as_str) else {
            return Err(ApiError::Malformed {
                resource,
                message: "no `url` in download response".to_string(),
            });
        };

        let (bytes, content_type) = self
            .api
            .get_bytes(url, &format!("image for {}", entry.work_id))
            .await?;
        Ok(FetchedItem {
            bytes,
            content_type,
        })
    }

    async fn lookup_download_location(&self, entry: &QueueEntry) -> Result<String, ApiError> {
        let resource = format!("photo {}", entry.work_id);
        let url = format!("{}/photos/{}", self.api.config().base_url, entry.work_id);
        let record = self.api.get_json(&url, &[], &resource).await?;
        download_location(&record).ok_or_else(|| ApiError::Malformed {
            resource,
            message: "record has no links.download_location".to_string(),
        })
    }
}

impl ItemFetcher for HttpItemFetcher {
    fn fetch<'a>(&'a self, entry: &'a QueueEntry) -> BoxFuture<'a, Result<FetchedItem, FetchError>> {
        Box::pin(async move { self.fetch_entry(entry).await.map_err(map_api_error_to_fetch) })
    }
}
