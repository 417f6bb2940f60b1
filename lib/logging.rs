use crate::build_info;
use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for runtime logs, chosen with `LOG_FORMAT` (`json` by default, or `text`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("text") {
            Self::Text
        } else {
            Self::Json
        }
    }

    fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|raw| Self::parse(&raw))
            .unwrap_or(Self::Json)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

/// Fields attached to every event emitted inside the run span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    pub service: String,
    pub mode: String,
    pub environment: String,
    pub run_id: String,
    pub owner_id: Option<String>,
    pub build_version: String,
    pub build_commit: String,
    pub format: LogFormat,
}

impl LoggingContext {
    pub fn with_owner(mut self, owner_id: &str) -> Self {
        self.owner_id = Some(owner_id.to_string());
        self
    }

    /// Span that commands enter for the lifetime of a run.
    pub fn run_span(&self) -> tracing::Span {
        tracing::info_span!(
            "harvest_run",
            service = %self.service,
            environment = %self.environment,
            mode = %self.mode,
            run_id = %self.run_id,
            owner_id = self.owner_id.as_deref().unwrap_or("-"),
            build_version = %self.build_version,
            build_commit = %self.build_commit
        )
    }
}

/// Installs the global subscriber and emits the `logging_initialized` event.
///
/// `log` records from dependencies are forwarded into `tracing`. `RUST_LOG` takes precedence over
/// `default_level`.
pub fn init_logging(mode: &str, default_level: &str) -> LoggingContext {
    let context = LoggingContext {
        service: build_info::SERVICE_NAME.to_string(),
        mode: mode.to_string(),
        environment: std::env::var("APP_ENV")
            .or_else(|_| std::env::var("ENVIRONMENT"))
            .unwrap_or_else(|_| "dev".to_string()),
        run_id: new_run_id(),
        owner_id: None,
        build_version: build_info::VERSION.to_string(),
        build_commit: build_info::short_commit_hash().to_string(),
        format: LogFormat::from_env(),
    };

    install_subscriber(context.format, default_level);

    tracing::info!(
        event = "logging_initialized",
        service = %context.service,
        environment = %context.environment,
        mode = %context.mode,
        run_id = %context.run_id,
        build_version = %context.build_version,
        build_commit = %context.build_commit,
        log_format = context.format.as_str(),
        "initialized logging"
    );

    context
}

fn install_subscriber(format: LogFormat, default_level: &str) {
    // A second init (tests, repeated commands) keeps the first subscriber.
    let _ = LogTracer::init();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
}

fn new_run_id() -> String {
    let epoch_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or_default();
    format!(
        "{}-{}-{epoch_millis}",
        build_info::SERVICE_NAME,
        std::process::id()
    )
}

/// Renders an error, each of its `source()` causes, and a backtrace captured here.
///
/// Used at command boundaries where `%err` alone would hide the io or http error underneath.
pub fn format_error_report(err: &(dyn StdError + 'static)) -> String {
    let mut report = format!("error: {err}");
    let mut cause = err.source();
    let mut depth = 1usize;
    while let Some(source) = cause {
        let _ = write!(report, "\ncaused by ({depth}): {source}");
        cause = source.source();
        depth += 1;
    }
    let _ = write!(report, "\nbacktrace:\n{}", Backtrace::force_capture());
    report
}
