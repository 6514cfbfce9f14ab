use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

pub const LOG_FILE_NAME: &str = "courier.log";

pub type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Installs the global subscriber: a file layer under `log_dir` plus a compact
/// stderr layer, both behind a reloadable filter.
pub fn init(log_dir: &Path) -> Result<(WorkerGuard, LogHandle)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok((guard, reload_handle))
}

/// Swaps the active filter, e.g. for the persisted `log_level` setting.
pub fn apply_level(handle: &LogHandle, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("invalid log level '{}'", level))?;
    handle.reload(filter).context("reload log filter")?;
    Ok(())
}
