use crate::{
    cli::{
        Cli, Command, QueueAction, QueueArgs, RateLimitMode, RunArgs, SearchArgs, StatusArgs,
        SubmitArgs,
    },
    clock::{SharedClock, SystemClock},
    command_processor::{CommandProcessor, CommandSpec},
    commit_governor::{BackoffPolicy, BreakerConfig, CommitGovernor, GovernorConfig},
    config::{ConfigError, HarvestConfig},
    coordination::{
        CoordinationError, KeyLayout, LeasePolicy, LockCoordinator, RangeSelector, SelectorConfig,
    },
    http_source::{
        global_rate_limiter, ApiClient, ApiError, HttpItemFetcher, HttpItemSource,
        HttpSourceConfig,
    },
    lease_store::FsLeaseStore,
    local_state::ScanStateDir,
    logging::{format_error_report, init_logging, LoggingContext},
    pipeline::{
        ControlHandle, EntryOrigin, FailureLog, PipelineConfig, PipelineError,
        PipelineOrchestrator, QueueEntry, QueueLog, QueueLogError, RunningPipeline,
    },
    progress::{ProgressStore, ProgressStoreError},
    scan::{search, RateLimitPolicy, ScanConfig, ScanDriver, ScanError, SearchConfig},
    server::{register_metrics, setup_server_with_addr},
    state::AppState,
    work::WorkId,
};
use dotenv::dotenv;
use serde_json::json;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start status server on {bind}: {source}")]
    Server {
        bind: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    QueueLog(#[from] QueueLogError),
    #[error(transparent)]
    Progress(#[from] ProgressStoreError),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("pipeline stopped after a fatal publish failure")]
    FatalPipelineFailure,
}

impl CommandError {
    /// 2 for anything the operator must fix before retrying, 1 for runtime failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgs(_) | Self::Config(_) => 2,
            _ => 1,
        }
    }
}

pub fn validate_run_args(args: &RunArgs) -> Result<(), String> {
    if args.scan_id.trim().is_empty() {
        return Err("--scan-id must not be empty".to_string());
    }
    if let (Some(start), Some(end)) = (args.start_position, args.end_position) {
        if end <= start {
            return Err(format!(
                "--end-position ({end}) must be > --start-position ({start})"
            ));
        }
    }
    if args.max_items == Some(0) {
        return Err("--max-items must be > 0".to_string());
    }
    if args.range_size == 0 {
        return Err("--range-size must be > 0".to_string());
    }
    if !(1..=20).contains(&args.candidates) {
        return Err(format!("--candidates must be in 1..=20, got {}", args.candidates));
    }
    if !(0.0..=1.0).contains(&args.epsilon) {
        return Err(format!("--epsilon must be in [0, 1], got {}", args.epsilon));
    }
    if args.max_active_ranges == 0 {
        return Err("--max-active-ranges must be > 0".to_string());
    }
    if args.item_ttl_secs == 0 || args.range_ttl_secs == 0 {
        return Err("--item-ttl-secs and --range-ttl-secs must be > 0".to_string());
    }
    if args.range_heartbeat_secs >= args.range_ttl_secs {
        return Err(format!(
            "--range-heartbeat-secs ({}) must be < --range-ttl-secs ({})",
            args.range_heartbeat_secs, args.range_ttl_secs
        ));
    }
    for (flag, value) in [
        ("--download-queue", args.download_queue),
        ("--process-queue", args.process_queue),
        ("--upload-queue", args.upload_queue),
        ("--download-workers", args.download_workers),
        ("--process-workers", args.process_workers),
        ("--upload-workers", args.upload_workers),
    ] {
        if value == 0 {
            return Err(format!("{flag} must be > 0"));
        }
    }
    if !(1..=64).contains(&args.batch_size) {
        return Err(format!("--batch-size must be in 1..=64, got {}", args.batch_size));
    }
    if args.batch_wait_ms > 5000 {
        return Err(format!(
            "--batch-wait-ms must be <= 5000, got {}",
            args.batch_wait_ms
        ));
    }
    if args.processor_timeout_secs == 0 {
        return Err("--processor-timeout-secs must be > 0".to_string());
    }
    if !(1..=30).contains(&args.list_page_size) {
        return Err(format!(
            "--list-page-size must be in 1..=30, got {}",
            args.list_page_size
        ));
    }
    if args.requests_per_minute == 0 {
        return Err("--requests-per-minute must be > 0".to_string());
    }
    if args.retry_attempts == 0 {
        return Err("--retry-attempts must be > 0".to_string());
    }
    if args.retry_max_ms < args.retry_initial_ms {
        return Err(format!(
            "--retry-max-ms ({}) must be >= --retry-initial-ms ({})",
            args.retry_max_ms, args.retry_initial_ms
        ));
    }
    if args.breaker_threshold == 0 {
        return Err("--breaker-threshold must be > 0".to_string());
    }
    if let Some(bind) = &args.metrics_bind {
        bind.parse::<SocketAddr>()
            .map_err(|err| format!("invalid --metrics-bind address `{bind}`: {err}"))?;
    }
    Ok(())
}

pub fn validate_search_args(args: &SearchArgs) -> Result<(), String> {
    validate_run_args(&args.run)?;
    if args.queries.iter().any(|query| query.trim().is_empty()) {
        return Err("--query must not be blank".to_string());
    }
    if args.max_pages == 0 {
        return Err("--max-pages must be > 0".to_string());
    }
    Ok(())
}

pub fn resolve_lease_policy(args: &RunArgs) -> LeasePolicy {
    LeasePolicy {
        item_ttl: Duration::from_secs(args.item_ttl_secs),
        range_ttl: Duration::from_secs(args.range_ttl_secs),
    }
}

pub fn resolve_selector_config(args: &RunArgs) -> SelectorConfig {
    SelectorConfig {
        candidates: args.candidates,
        epsilon: args.epsilon,
        fresh_window: Duration::from_secs(args.fresh_window_secs),
        range_size: args.range_size,
        ..SelectorConfig::default()
    }
    .clamped()
}

pub fn resolve_retry_policy(args: &RunArgs) -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: args.retry_attempts,
        base_delay: Duration::from_millis(args.retry_initial_ms),
        max_delay: Duration::from_millis(args.retry_max_ms),
        ..BackoffPolicy::default()
    }
}

pub fn resolve_governor_config(args: &RunArgs) -> GovernorConfig {
    GovernorConfig {
        breaker: BreakerConfig {
            failure_threshold: args.breaker_threshold,
            failure_window: Duration::from_secs(args.breaker_window_secs),
            cooldown: Duration::from_secs(args.breaker_cooldown_secs),
        },
        backoff: resolve_retry_policy(args),
        ..GovernorConfig::default()
    }
}

pub fn resolve_pipeline_config(args: &RunArgs) -> PipelineConfig {
    PipelineConfig {
        download_queue: args.download_queue,
        process_queue: args.process_queue,
        publish_queue: args.upload_queue,
        download_workers: args.download_workers,
        process_workers: args.process_workers,
        publish_workers: args.upload_workers,
        batch_size: args.batch_size,
        batch_wait: Duration::from_millis(args.batch_wait_ms),
        fetch_retry: resolve_retry_policy(args),
        publish_enabled: !args.no_publish,
    }
    .clamped()
}

pub fn resolve_rate_limit(args: &RunArgs) -> RateLimitPolicy {
    match args.rate_limit {
        RateLimitMode::Stop => RateLimitPolicy::Stop,
        RateLimitMode::Backoff => {
            RateLimitPolicy::Backoff(Duration::from_secs(args.rate_limit_wait_secs))
        }
    }
}

pub fn resolve_scan_config(args: &RunArgs) -> ScanConfig {
    ScanConfig {
        start_position: args.start_position.unwrap_or(0),
        end_position: args.end_position,
        max_items: args.max_items,
        range_heartbeat: Duration::from_secs(args.range_heartbeat_secs),
        range_progress_interval: Duration::from_secs(args.range_progress_secs),
        max_active_ranges: args.max_active_ranges,
        rate_limit: resolve_rate_limit(args),
        discovery_retry: resolve_retry_policy(args),
        ..ScanConfig::default()
    }
}

fn resolve_metrics_bind(args: &RunArgs, config: &HarvestConfig) -> Option<SocketAddr> {
    args.metrics_bind
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .or(config.metrics_bind)
}

/// `--owner-id`, then `HARVEST_OWNER_ID`. `None` lets the scan keep its recorded owner.
fn resolve_owner_id(args: &RunArgs, config: &HarvestConfig) -> Option<String> {
    args.owner_id
        .clone()
        .filter(|owner| !owner.trim().is_empty())
        .or_else(|| config.owner_id.clone())
}

fn build_coordinator(
    config: &HarvestConfig,
    owner_id: &str,
    policy: LeasePolicy,
    governor: Arc<CommitGovernor>,
    clock: SharedClock,
) -> Arc<LockCoordinator> {
    Arc::new(LockCoordinator::new(
        Arc::new(FsLeaseStore::new(&config.store_root)),
        governor,
        KeyLayout::new(&config.namespace),
        clock,
        owner_id,
        policy,
    ))
}

/// Maps SIGTERM/SIGINT onto the run control. Workers finish their current unit and drain.
pub async fn handle_shutdown_signals(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            warn!(
                event = "signal_handler_unavailable",
                error = %err,
                "could not register shutdown signal handlers"
            );
            return;
        }
    };

    let signal_name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(
        event = "shutdown_signal_received",
        signal = signal_name,
        "stopping after in-flight work"
    );
    state.control.stop();
}

/// Runs one parsed subcommand and returns the process exit code.
pub async fn run_command(cli: Cli) -> i32 {
    dotenv().ok();

    let (mode, log_level) = match &cli.command {
        Command::Run(args) => ("run", args.log_level.clone()),
        Command::Search(args) => ("search", args.run.log_level.clone()),
        Command::Submit(_) | Command::Queue(_) | Command::Status(_) => {
            ("admin", "warn".to_string())
        }
    };
    let logging_context = init_logging(mode, &log_level);

    let config = match HarvestConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", error = %err, "configuration rejected");
            eprintln!("{err}");
            return 2;
        }
    };

    let result = match cli.command {
        Command::Run(args) => harvest(args, None, config, logging_context).await,
        Command::Search(search_args) => {
            let run_args = search_args.run.clone();
            harvest(run_args, Some(search_args), config, logging_context).await
        }
        Command::Submit(args) => submit_items(args, &config).await,
        Command::Queue(args) => manage_queue(args, &config).await,
        Command::Status(args) => show_status(args, &config).await,
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "command_failed",
                mode,
                error = %err,
                error_debug = ?err,
                error_report = %error_report,
                "command failed"
            );
            eprintln!("{mode} failed: {err}");
            if err.exit_code() == 1 {
                eprintln!("{error_report}");
            }
            err.exit_code()
        }
    }
}

/// Validates the arguments and pins the scan's owner id, then runs the harvest in its run span.
async fn harvest(
    args: RunArgs,
    search_args: Option<SearchArgs>,
    config: HarvestConfig,
    logging_context: LoggingContext,
) -> Result<(), CommandError> {
    let validation = match &search_args {
        Some(search_args) => validate_search_args(search_args),
        None => validate_run_args(&args),
    };
    validation.map_err(CommandError::InvalidArgs)?;

    let state_dir = ScanStateDir::new(&config.state_dir, &args.scan_id);
    let owner_id = state_dir
        .pin_owner_id(
            resolve_owner_id(&args, &config).as_deref(),
            &config.host_owner_id,
        )
        .await
        .map_err(|source| CommandError::Io {
            path: state_dir.owner_path(),
            source,
        })?;
    let context = logging_context.with_owner(&owner_id);
    let span = context.run_span();
    run_harvest(args, search_args, config, state_dir, owner_id, context)
        .instrument(span)
        .await
}

/// One scan or search pass: recover the queue log, run discovery, drain the pipeline.
async fn run_harvest(
    args: RunArgs,
    search_args: Option<SearchArgs>,
    config: HarvestConfig,
    state_dir: ScanStateDir,
    owner_id: String,
    context: LoggingContext,
) -> Result<(), CommandError> {
    let processor_cmd = config.processor_cmd.clone().ok_or_else(|| {
        CommandError::InvalidArgs("HARVEST_PROCESSOR_CMD is required for harvest runs".to_string())
    })?;
    let requests_per_minute = NonZeroU32::new(args.requests_per_minute)
        .ok_or_else(|| CommandError::InvalidArgs("--requests-per-minute must be > 0".to_string()))?;

    info!(
        event = "harvest_starting",
        mode = %context.mode,
        scan_id = %args.scan_id,
        namespace = %config.namespace,
        store_root = %config.store_root.display(),
        "starting harvest run"
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let governor = Arc::new(CommitGovernor::new(resolve_governor_config(&args), clock.clone()));
    let coordinator = build_coordinator(
        &config,
        &owner_id,
        resolve_lease_policy(&args),
        governor.clone(),
        clock,
    );

    let control = ControlHandle::new();
    let app_state = Arc::new(AppState::new(
        CancellationToken::new(),
        control.clone(),
        governor,
        owner_id.clone(),
    ));
    let signal_handle = tokio::spawn(handle_shutdown_signals(app_state.clone()));

    let server_handle = match resolve_metrics_bind(&args, &config) {
        Some(bind) => Some(
            setup_server_with_addr(app_state.clone(), bind)
                .await
                .map_err(|source| CommandError::Server { bind, source })?,
        ),
        None => {
            register_metrics(&app_state).await;
            None
        }
    };

    let result = run_pipeline(
        &args,
        search_args.as_ref(),
        &config,
        &state_dir,
        processor_cmd,
        requests_per_minute,
        &context,
        coordinator,
        &app_state,
    )
    .await;

    app_state.shutdown_token.cancel();
    signal_handle.abort();
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    args: &RunArgs,
    search_args: Option<&SearchArgs>,
    config: &HarvestConfig,
    state_dir: &ScanStateDir,
    processor_cmd: CommandSpec,
    requests_per_minute: NonZeroU32,
    context: &LoggingContext,
    coordinator: Arc<LockCoordinator>,
    app_state: &Arc<AppState>,
) -> Result<(), CommandError> {
    tokio::fs::create_dir_all(state_dir.dir())
        .await
        .map_err(|source| CommandError::Io {
            path: state_dir.dir().to_path_buf(),
            source,
        })?;
    let (queue_log, pending) = QueueLog::open(state_dir.queue_log_path()).await?;
    let failure_log = FailureLog::new(state_dir.failures_path(), context.run_id.clone());

    let api = Arc::new(ApiClient::new(
        HttpSourceConfig {
            base_url: config.source_url.clone(),
            access_token: config.source_token.clone(),
            list_page_size: args.list_page_size,
            search_page_size: search_args.map_or(10, |search| search.search_page_size),
            ..HttpSourceConfig::default()
        },
        global_rate_limiter(requests_per_minute),
    )?);
    let processor = CommandProcessor::new(
        processor_cmd,
        state_dir.dir().join("work"),
        Duration::from_secs(args.processor_timeout_secs),
    )
    .keep_work_dirs(args.keep_work_dirs);

    let pipeline = PipelineOrchestrator::new(
        resolve_pipeline_config(args),
        coordinator.clone(),
        Arc::new(HttpItemFetcher::new(api.clone())),
        Arc::new(processor),
        Arc::new(queue_log),
        Arc::new(failure_log),
        app_state.control.clone(),
    )
    .start();
    app_state.attach_pipeline(pipeline.depths());

    let discovery = match pipeline.recover(pending).await {
        Ok(recovery) => {
            if recovery.replayed > 0 {
                info!(
                    event = "queue_log_recovered",
                    replayed = recovery.replayed,
                    requeued = recovery.requeued,
                    skipped_done = recovery.skipped_done,
                    skipped_locked = recovery.skipped_locked,
                    "replayed pending entries from the queue log"
                );
            }
            let source = HttpItemSource::new(api);
            discover(
                args,
                search_args,
                coordinator,
                source,
                recovery.requeued_positions,
                app_state,
                &pipeline,
                state_dir,
            )
            .await
        }
        Err(err) => Err(err.into()),
    };
    if discovery.is_err() {
        app_state.control.stop();
    }

    let summary = pipeline.finish().await?;
    info!(
        event = "harvest_complete",
        downloaded = summary.downloaded,
        processed = summary.processed,
        published = summary.published,
        suppressed = summary.suppressed,
        failed = summary.failed,
        publish_batches = summary.publish_batches,
        "harvest run finished"
    );
    discovery?;
    if summary.had_fatal_failures {
        return Err(CommandError::FatalPipelineFailure);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn discover(
    args: &RunArgs,
    search_args: Option<&SearchArgs>,
    coordinator: Arc<LockCoordinator>,
    source: HttpItemSource,
    in_flight: Vec<u64>,
    app_state: &Arc<AppState>,
    pipeline: &RunningPipeline,
    state_dir: &ScanStateDir,
) -> Result<(), CommandError> {
    if let Some(search_args) = search_args {
        let search_config = SearchConfig {
            queries: search_args.queries.clone(),
            max_pages: search_args.max_pages,
            max_items: args.max_items,
            rate_limit: resolve_rate_limit(args),
            discovery_retry: resolve_retry_policy(args),
        };
        search(&source, pipeline, &search_config).await?;
        return Ok(());
    }

    let selector = RangeSelector::new(coordinator.clone(), resolve_selector_config(args));
    let mut driver = ScanDriver::new(
        coordinator,
        selector,
        Arc::new(source),
        ProgressStore::new(state_dir.progress_path()),
        resolve_scan_config(args),
    );
    driver.note_in_flight(in_flight);
    driver.publish_progress_to(app_state.progress.clone());
    driver.run(pipeline).await?;
    Ok(())
}

async fn submit_items(args: SubmitArgs, config: &HarvestConfig) -> Result<(), CommandError> {
    let ids = args
        .ids
        .iter()
        .map(|raw| WorkId::parse(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(CommandError::InvalidArgs)?;
    let state_dir = ScanStateDir::new(&config.state_dir, &args.scan_id);
    let (queue_log, _) = QueueLog::open(state_dir.queue_log_path()).await?;

    for id in &ids {
        let entry =
            QueueEntry::new(id.clone(), EntryOrigin::Manual).with_override(args.publish_override);
        let seq = queue_log.append(&entry).await?;
        info!(event = "item_submitted", work_id = %id, seq, "queued item for next run");
    }
    println!(
        "queued {} item(s) for scan `{}`; they run on the next harvest start",
        ids.len(),
        state_dir.scan_id()
    );
    Ok(())
}

async fn manage_queue(args: QueueArgs, config: &HarvestConfig) -> Result<(), CommandError> {
    let state_dir = ScanStateDir::new(&config.state_dir, &args.scan_id);
    let (queue_log, _) = QueueLog::open(state_dir.queue_log_path()).await?;
    match args.action {
        QueueAction::List => {
            for logged in queue_log.pending().await? {
                println!("{}", json!({ "seq": logged.seq, "entry": logged.entry }));
            }
        }
        QueueAction::Clear => {
            let cleared = queue_log.clear().await?;
            info!(event = "queue_cleared", scan_id = %state_dir.scan_id(), cleared, "cleared queue log");
            println!("cleared {cleared} pending item(s)");
        }
    }
    Ok(())
}

async fn show_status(args: StatusArgs, config: &HarvestConfig) -> Result<(), CommandError> {
    let state_dir = ScanStateDir::new(&config.state_dir, &args.scan_id);
    let progress = ProgressStore::new(state_dir.progress_path()).load().await?;

    let clock: SharedClock = Arc::new(SystemClock);
    let governor = Arc::new(CommitGovernor::new(GovernorConfig::default(), clock.clone()));
    let coordinator = build_coordinator(
        config,
        &config.host_owner_id,
        LeasePolicy::default(),
        governor,
        clock,
    );
    let done_prefix = coordinator.read_done_prefix().await?;

    let report = json!({
        "scan_id": state_dir.scan_id(),
        "namespace": config.namespace,
        "progress": progress.map(|progress| progress.snapshot()),
        "shared_done_prefix": done_prefix,
    });
    println!("{report:#}");
    Ok(())
}
