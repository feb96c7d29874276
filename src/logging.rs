//! # Structured Logging Module
//!
//! Console plus file logging for unattended runs. The console layer is human readable; the file
//! layer is JSON lines (or plain text when `logger.json = false`) written through a non-blocking
//! daily-rolling appender.

use chrono::Utc;
use std::fs;
use std::process;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggerConfig;
use crate::error::{ExporterError, Result};

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over `logger.level` when set. The returned guard flushes the file
/// writer on drop and must be held for the lifetime of the process. An already installed global
/// subscriber is tolerated.
pub fn init_structured_logging(config: &LoggerConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(&config.directory)
        .map_err(|e| ExporterError::filesystem("create log directory", &config.directory, e))?;

    let file_appender = tracing_appender::rolling::daily(&config.directory, &config.filename);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .with_filter(build_filter(&config.level));

    let file_layer = if config.json {
        fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .json()
            .with_filter(build_filter(&config.level))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .with_filter(build_filter(&config.level))
            .boxed()
    };

    if tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, keeping it");
    }

    tracing::info!(
        pid = process::id(),
        level = %config.level,
        log_dir = %config.directory.display(),
        log_file = %config.filename,
        "Structured logging initialized"
    );

    Ok(guard)
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()))
}

/// Current time for the `timestamp` field of structured step logs
pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Log a pipeline step event with an `operation` field and an RFC 3339 timestamp.
///
/// ```rust,no_run
/// use exporter_core::log_step;
///
/// let err = "disk full";
/// log_step!(info, "run_exports", "Run Exports Success", rows = 10u64, elapsed_sec = 0.5);
/// log_step!(error, "compress", "Compress Failure", error = %err);
/// ```
#[macro_export]
macro_rules! log_step {
    ($level:ident, $operation:expr, $message:expr) => {
        tracing::$level!(
            operation = %$operation,
            timestamp = %$crate::logging::timestamp(),
            "{}",
            $message
        )
    };
    ($level:ident, $operation:expr, $message:expr, $($fields:tt)+) => {
        tracing::$level!(
            operation = %$operation,
            timestamp = %$crate::logging::timestamp(),
            $($fields)+,
            "{}",
            $message
        )
    };
}

/// Convert a step name such as `run_exports` into the `Run Exports` label used in log messages.
pub fn step_label(step: &str) -> String {
    step.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
