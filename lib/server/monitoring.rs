use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers a constant `1` gauge labeled with service, version and commit.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: build_info::SERVICE_NAME,
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    registry.sub_registry_with_prefix(prefix).register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

/// Local pipeline throughput and queue pressure.
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    pub items_accepted_total: Counter,
    pub items_published_total: Counter,
    /// Items the external processor rejected.
    pub items_failed_total: Counter,
    /// Items dropped at intake because another client already finished them.
    pub items_skipped_done_total: Counter,
    pub items_skipped_locked_total: Counter,
    pub publish_batches_total: Counter,
    pub last_publish_batch_size: Gauge,
    pub recovered_entries_total: Counter,
    pub download_queue_depth: Gauge,
    pub process_queue_depth: Gauge,
    pub publish_queue_depth: Gauge,
    /// 0 running, 1 paused, 2 stopping.
    pub run_state: Gauge,
}

impl PipelineMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "items_accepted",
            "Queue entries durably accepted at intake",
            metrics.items_accepted_total.clone(),
        );
        sub_registry.register(
            "items_published",
            "Items published and marked done",
            metrics.items_published_total.clone(),
        );
        sub_registry.register(
            "items_failed",
            "Items rejected by the external processor",
            metrics.items_failed_total.clone(),
        );
        sub_registry.register(
            "items_skipped_done",
            "Items skipped at intake because a done marker exists",
            metrics.items_skipped_done_total.clone(),
        );
        sub_registry.register(
            "items_skipped_locked",
            "Items skipped at intake because another owner holds the lease",
            metrics.items_skipped_locked_total.clone(),
        );
        sub_registry.register(
            "publish_batches",
            "Combined publish commits issued",
            metrics.publish_batches_total.clone(),
        );
        sub_registry.register(
            "last_publish_batch_size",
            "Number of items in the most recent publish commit",
            metrics.last_publish_batch_size.clone(),
        );
        sub_registry.register(
            "recovered_entries",
            "Queue log entries re-enqueued at startup",
            metrics.recovered_entries_total.clone(),
        );
        sub_registry.register(
            "download_queue_depth",
            "Entries waiting for a download worker",
            metrics.download_queue_depth.clone(),
        );
        sub_registry.register(
            "process_queue_depth",
            "Entries waiting for a processing worker",
            metrics.process_queue_depth.clone(),
        );
        sub_registry.register(
            "publish_queue_depth",
            "Entries waiting for the publish batcher",
            metrics.publish_queue_depth.clone(),
        );
        sub_registry.register(
            "run_state",
            "Pipeline control state (0 running, 1 paused, 2 stopping)",
            metrics.run_state.clone(),
        );
        metrics
    }
}

pub static PIPELINE_METRICS: OnceCell<PipelineMetrics> = OnceCell::const_new();

/// Lease and range coordination outcomes.
#[derive(Clone, Default)]
pub struct CoordinationMetrics {
    pub item_leases_acquired_total: Counter,
    pub item_lease_conflicts_total: Counter,
    pub stale_leases_reclaimed_total: Counter,
    pub ranges_acquired_total: Counter,
    pub range_lock_conflicts_total: Counter,
    pub ranges_done_total: Counter,
    pub ranges_abandoned_total: Counter,
    pub selector_fallbacks_total: Counter,
    pub frontier: Gauge,
    pub holes: Gauge,
}

impl CoordinationMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "item_leases_acquired",
            "Item leases acquired by this client",
            metrics.item_leases_acquired_total.clone(),
        );
        sub_registry.register(
            "item_lease_conflicts",
            "Item lease attempts that found a live lease held by another owner",
            metrics.item_lease_conflicts_total.clone(),
        );
        sub_registry.register(
            "stale_leases_reclaimed",
            "Expired leases deleted and re-created by this client",
            metrics.stale_leases_reclaimed_total.clone(),
        );
        sub_registry.register(
            "ranges_acquired",
            "Range leases acquired by this client",
            metrics.ranges_acquired_total.clone(),
        );
        sub_registry.register(
            "range_lock_conflicts",
            "Range lock attempts lost to another client",
            metrics.range_lock_conflicts_total.clone(),
        );
        sub_registry.register(
            "ranges_done",
            "Ranges marked done by this client",
            metrics.ranges_done_total.clone(),
        );
        sub_registry.register(
            "ranges_abandoned",
            "Ranges released before every item settled",
            metrics.ranges_abandoned_total.clone(),
        );
        sub_registry.register(
            "selector_fallbacks",
            "Range selections that fell back to per-item locking",
            metrics.selector_fallbacks_total.clone(),
        );
        sub_registry.register(
            "frontier",
            "Current ordered-scan frontier position",
            metrics.frontier.clone(),
        );
        sub_registry.register(
            "holes",
            "Completed positions above the frontier",
            metrics.holes.clone(),
        );
        metrics
    }
}

pub static COORDINATION_METRICS: OnceCell<CoordinationMetrics> = OnceCell::const_new();

/// Remote write governor behavior.
#[derive(Clone, Default)]
pub struct GovernorMetrics {
    pub writes_applied_total: Counter,
    pub write_retries_total: Counter,
    pub writes_short_circuited_total: Counter,
    pub writes_throttled_total: Counter,
    pub critical_writes_exhausted_total: Counter,
    pub circuit_opened_total: Counter,
    /// 0 closed, 1 half-open, 2 open.
    pub circuit_state: Gauge,
}

impl GovernorMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "writes_applied",
            "Remote mutations that succeeded",
            metrics.writes_applied_total.clone(),
        );
        sub_registry.register(
            "write_retries",
            "Remote mutation attempts retried after a transient failure",
            metrics.write_retries_total.clone(),
        );
        sub_registry.register(
            "writes_short_circuited",
            "Non-critical writes skipped locally while the circuit was open",
            metrics.writes_short_circuited_total.clone(),
        );
        sub_registry.register(
            "writes_throttled",
            "Non-critical writes skipped by adaptive throttling",
            metrics.writes_throttled_total.clone(),
        );
        sub_registry.register(
            "critical_writes_exhausted",
            "Critical writes that failed after every retry",
            metrics.critical_writes_exhausted_total.clone(),
        );
        sub_registry.register(
            "circuit_opened",
            "Number of times the circuit breaker opened",
            metrics.circuit_opened_total.clone(),
        );
        sub_registry.register(
            "circuit_state",
            "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            metrics.circuit_state.clone(),
        );
        metrics
    }
}

pub static GOVERNOR_METRICS: OnceCell<GovernorMetrics> = OnceCell::const_new();
