//! Logging setup for the binary
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a
//! console `fmt` layer, plus a daily rolling file layer when a log
//! directory is configured. Filter precedence: explicit override (the
//! `--log-filter` flag), then `RUST_LOG`, then the configured filter.

use crate::config::LoggingSettings;
use crate::error::{Result, RfidError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the background log writer alive; flushes on drop
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Resolve the filter directive to use
pub fn filter_directive(settings: &LoggingSettings, override_filter: Option<&str>) -> String {
    if let Some(filter) = override_filter.filter(|f| !f.trim().is_empty()) {
        return filter.to_string();
    }
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) if !env.trim().is_empty() => env,
        _ => settings.filter.clone(),
    }
}

/// Install the global subscriber
pub fn init_logging(settings: &LoggingSettings, override_filter: Option<&str>) -> Result<LogGuard> {
    let directive = filter_directive(settings, override_filter);
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| RfidError::Config(format!("invalid log filter {:?}: {}", directive, e)))?;

    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::daily(directory, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| RfidError::Config(format!("logging already initialised: {}", e)))?;

    Ok(LogGuard { _file: guard })
}
