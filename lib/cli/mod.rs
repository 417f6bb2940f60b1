use crate::build_info;
use crate::pipeline::PublishOverride;
use clap::{Args, Parser, Subcommand, ValueEnum};

pub const DEFAULT_SCAN_ID: &str = "listing";

#[derive(Parser, Debug)]
#[command(
    about = "Cooperative photo harvester: many clients, one shared store",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan the ordered listing range by range and publish artifacts
    Run(RunArgs),
    /// Harvest keyword search results (item leases only, no scan progress)
    Search(SearchArgs),
    /// Queue specific item ids for the next run of this scan
    Submit(SubmitArgs),
    /// Inspect or clear the local pending queue
    Queue(QueueArgs),
    /// Print local progress and the shared done prefix
    Status(StatusArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RateLimitMode {
    Stop,
    Backoff,
}

/// Tuning knobs for a harvest run. Infrastructure settings come from `HarvestConfig`.
#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Local state directory name; separate scans never share queue or progress files.
    #[arg(long = "scan-id", default_value = DEFAULT_SCAN_ID)]
    pub scan_id: String,
    #[arg(long = "owner-id")]
    pub owner_id: Option<String>,

    #[arg(long = "start-position")]
    pub start_position: Option<u64>,
    #[arg(long = "end-position")]
    pub end_position: Option<u64>,
    #[arg(long = "max-items")]
    pub max_items: Option<u64>,

    #[arg(long = "range-size", default_value_t = 300)]
    pub range_size: u64,
    #[arg(long = "candidates", default_value_t = 6)]
    pub candidates: usize,
    #[arg(long = "epsilon", default_value_t = 0.2)]
    pub epsilon: f64,
    #[arg(long = "fresh-window-secs", default_value_t = 90)]
    pub fresh_window_secs: u64,
    #[arg(long = "max-active-ranges", default_value_t = 2)]
    pub max_active_ranges: usize,

    #[arg(long = "item-ttl-secs", default_value_t = 21_600)]
    pub item_ttl_secs: u64,
    #[arg(long = "range-ttl-secs", default_value_t = 21_600)]
    pub range_ttl_secs: u64,
    #[arg(long = "range-heartbeat-secs", default_value_t = 600)]
    pub range_heartbeat_secs: u64,
    #[arg(long = "range-progress-secs", default_value_t = 300)]
    pub range_progress_secs: u64,

    #[arg(long = "download-queue", default_value_t = 8)]
    pub download_queue: usize,
    #[arg(long = "process-queue", default_value_t = 8)]
    pub process_queue: usize,
    #[arg(long = "upload-queue", default_value_t = 256)]
    pub upload_queue: usize,
    #[arg(long = "download-workers", default_value_t = 2)]
    pub download_workers: usize,
    #[arg(long = "process-workers", default_value_t = 1)]
    pub process_workers: usize,
    #[arg(long = "upload-workers", default_value_t = 2)]
    pub upload_workers: usize,
    #[arg(long = "batch-size", default_value_t = 8)]
    pub batch_size: usize,
    #[arg(long = "batch-wait-ms", default_value_t = 500)]
    pub batch_wait_ms: u64,
    #[arg(long = "no-publish", default_value_t = false)]
    /// Process items locally but only publish entries submitted with `--override force`.
    pub no_publish: bool,
    #[arg(long = "processor-timeout-secs", default_value_t = 900)]
    pub processor_timeout_secs: u64,
    #[arg(long = "keep-work-dirs", default_value_t = false)]
    pub keep_work_dirs: bool,

    #[arg(long = "list-page-size", default_value_t = 30)]
    pub list_page_size: u64,
    #[arg(long = "requests-per-minute", default_value_t = 50)]
    pub requests_per_minute: u32,
    #[arg(long = "rate-limit", value_enum, default_value_t = RateLimitMode::Stop)]
    pub rate_limit: RateLimitMode,
    #[arg(long = "rate-limit-wait-secs", default_value_t = 3600)]
    pub rate_limit_wait_secs: u64,

    #[arg(long = "retry-attempts", default_value_t = 6)]
    pub retry_attempts: u32,
    #[arg(long = "retry-initial-ms", default_value_t = 500)]
    pub retry_initial_ms: u64,
    #[arg(long = "retry-max-ms", default_value_t = 8000)]
    pub retry_max_ms: u64,
    #[arg(long = "breaker-threshold", default_value_t = 5)]
    pub breaker_threshold: u32,
    #[arg(long = "breaker-window-secs", default_value_t = 60)]
    pub breaker_window_secs: u64,
    #[arg(long = "breaker-cooldown-secs", default_value_t = 30)]
    pub breaker_cooldown_secs: u64,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    /// Overrides `HARVEST_METRICS_BIND`.
    #[arg(long = "metrics-bind")]
    pub metrics_bind: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct SearchArgs {
    #[arg(long = "query", required = true)]
    pub queries: Vec<String>,
    #[arg(long = "max-pages", default_value_t = 10)]
    pub max_pages: u64,
    #[arg(long = "search-page-size", default_value_t = 10)]
    pub search_page_size: u64,
    #[command(flatten)]
    pub run: RunArgs,
}

fn parse_override(raw: &str) -> Result<PublishOverride, String> {
    PublishOverride::parse(raw)
        .ok_or_else(|| format!("`{raw}` is not one of default, force, suppress"))
}

/// Appends to the queue log; run it while no harvest is active on the same scan id.
#[derive(Debug, Args, Clone)]
pub struct SubmitArgs {
    #[arg(required = true)]
    pub ids: Vec<String>,
    #[arg(long = "override", value_parser = parse_override, default_value = "default")]
    pub publish_override: PublishOverride,
    #[arg(long = "scan-id", default_value = DEFAULT_SCAN_ID)]
    pub scan_id: String,
}

#[derive(Debug, Args, Clone)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub action: QueueAction,
    #[arg(long = "scan-id", default_value = DEFAULT_SCAN_ID, global = true)]
    pub scan_id: String,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// Print pending entries as JSON lines
    List,
    /// Drop every pending entry
    Clear,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    #[arg(long = "scan-id", default_value = DEFAULT_SCAN_ID)]
    pub scan_id: String,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
