//! Tracing subscriber setup
//!
//! Launcher events carry `dispatch_id`, `rank` and `world_size` fields, and
//! every [`Launcher::distribute`](crate::Launcher::distribute) call runs in a
//! span holding the dispatch id. The file layer logs span closes, so each
//! dispatch leaves one line with its id, world size and busy time.

use crate::config::LoggingConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "launch.log";

/// Default log directory: `~/.meshlaunch/logs`
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshlaunch")
        .join("logs")
}

/// Filter that applies `level` to this crate and keeps dependencies at `warn`.
///
/// `RUST_LOG` replaces it entirely when set.
pub fn launch_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level.to_lowercase());
    EnvFilter::try_new(&directive)
        .map_err(|e| anyhow::anyhow!("Invalid log level {:?}: {}", level, e))
}

/// Install the global subscriber described by `config`.
///
/// `level_override` (from the command line) wins over `config.level`. With
/// `log_to_file` set, events also go to a daily rotated `launch.log` through
/// a background writer; keep the returned guard alive until exit so buffered
/// lines are flushed.
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<&str>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = level_override.unwrap_or(&config.level);
    let filter = launch_filter(level)?;

    let (file_layer, guard, log_dir) = if config.log_to_file {
        let log_dir = config.log_dir.clone().unwrap_or_else(default_log_dir);
        std::fs::create_dir_all(&log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE);
        (Some(layer), Some(guard), Some(log_dir))
    } else {
        (None, None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Some(dir) = log_dir {
        tracing::info!(log_dir = %dir.display(), level, "File logging enabled");
    }
    Ok(guard)
}
