use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{DiscoveredItem, DiscoveryError, ItemSource, ScanConfig, ScanDriver};
use crate::commit_governor::BackoffPolicy;
use crate::coordination::{RangeSelector, SelectorConfig};
use crate::pipeline::test_support::{test_pipeline_config, PipelineFixture};
use crate::pipeline::PipelineConfig;
use crate::progress::ProgressStore;
use crate::work::WorkId;

pub(crate) const RANGE_SIZE: u64 = 10;

pub(crate) fn item_id(position: u64) -> String {
    format!("item-{position:04}")
}

pub(crate) fn selector_config() -> SelectorConfig {
    SelectorConfig {
        candidates: 6,
        epsilon: 0.0,
        fresh_window: Duration::from_secs(90),
        max_attempts: 3,
        range_size: RANGE_SIZE,
    }
}

pub(crate) fn scan_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        batch_wait: Duration::from_millis(10),
        ..test_pipeline_config(4)
    }
}

pub(crate) fn scan_config() -> ScanConfig {
    ScanConfig {
        poll_interval: Duration::from_millis(5),
        discovery_retry: BackoffPolicy::immediate(3),
        ..ScanConfig::default()
    }
}

pub(crate) fn driver(
    fixture: &PipelineFixture,
    source: &Arc<ScriptedSource>,
    config: ScanConfig,
) -> ScanDriver {
    let coordinator = fixture.client.coordinator.clone();
    let selector =
        RangeSelector::with_rng(coordinator.clone(), selector_config(), StdRng::seed_from_u64(7));
    ScanDriver::new(
        coordinator,
        selector,
        source.clone(),
        ProgressStore::new(fixture.dir.path().join("progress.json")),
        config,
    )
}

/// Ordered listing of `total` items named `item-NNNN`, plus canned search pages.
pub(crate) struct ScriptedSource {
    page_size: u64,
    total: u64,
    list_faults: Mutex<HashMap<u64, VecDeque<DiscoveryError>>>,
    list_calls: Mutex<Vec<u64>>,
    search_pages: HashMap<String, Vec<Vec<String>>>,
}

impl ScriptedSource {
    pub(crate) fn listing(total: u64, page_size: u64) -> Self {
        Self {
            page_size,
            total,
            list_faults: Mutex::new(HashMap::new()),
            list_calls: Mutex::new(Vec::new()),
            search_pages: HashMap::new(),
        }
    }

    pub(crate) fn with_search(mut self, query: &str, pages: Vec<Vec<&str>>) -> Self {
        let pages = pages
            .into_iter()
            .map(|page| page.into_iter().map(str::to_string).collect())
            .collect();
        self.search_pages.insert(query.to_string(), pages);
        self
    }

    pub(crate) fn fail_page(&self, page: u64, errors: Vec<DiscoveryError>) {
        self.list_faults
            .lock()
            .expect("list_faults mutex poisoned")
            .entry(page)
            .or_default()
            .extend(errors);
    }

    pub(crate) fn list_calls(&self) -> Vec<u64> {
        self.list_calls
            .lock()
            .expect("list_calls mutex poisoned")
            .clone()
    }
}

fn discovered(id: &str) -> DiscoveredItem {
    DiscoveredItem::new(WorkId::parse(id).expect("valid id"))
}

impl ItemSource for ScriptedSource {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn list_page<'a>(
        &'a self,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>> {
        Box::pin(async move {
            self.list_calls
                .lock()
                .expect("list_calls mutex poisoned")
                .push(page);
            let fault = self
                .list_faults
                .lock()
                .expect("list_faults mutex poisoned")
                .get_mut(&page)
                .and_then(VecDeque::pop_front);
            if let Some(error) = fault {
                return Err(error);
            }
            let start = page * self.page_size;
            let end = (start + self.page_size).min(self.total);
            Ok((start..end).map(|position| discovered(&item_id(position))).collect())
        })
    }

    fn search<'a>(
        &'a self,
        query: &'a str,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>> {
        Box::pin(async move {
            let results = self
                .search_pages
                .get(query)
                .and_then(|pages| pages.get(page as usize))
                .map(|ids| ids.iter().map(|id| discovered(id)).collect())
                .unwrap_or_default();
            Ok(results)
        })
    }
}
