use std::path::Path;

use anyhow::{Context, Result};
use tracing::subscriber::DefaultGuard;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Logging for one process invocation: stderr plus a daily-rolling file under the logs dir.
///
/// The subscriber is installed as the thread default and removed when the session drops;
/// the file writer is flushed after that.
pub struct LogSession {
    _default: DefaultGuard,
    _writer: WorkerGuard,
}

impl LogSession {
    pub fn start(logs_dir: &Path, file_prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("creating log directory {}", logs_dir.display()))?;

        let appender = tracing_appender::rolling::daily(logs_dir, format!("{file_prefix}.log"));
        let (file_writer, writer_guard) = tracing_appender::non_blocking(appender);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = Registry::default()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(fmt::layer().with_writer(file_writer).with_ansi(false));

        Ok(Self {
            _default: tracing::subscriber::set_default(subscriber),
            _writer: writer_guard,
        })
    }
}
