//! Structured logging setup.
//!
//! The original split logs across five spdlog sinks (error/exception/
//! stdout/database/verbose). `tracing` gives the same separation through
//! per-module targets (`dirsync::database`, `dirsync::protocol`, ...)
//! filterable with `RUST_LOG`, so one subscriber replaces all five sinks.

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Guard returned by [`init`]; drop it only at process exit so the
/// non-blocking file writer has a chance to flush.
pub struct LogGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

/// Initialize the global subscriber. When `log_dir` is set (CLI flag or
/// `DIRSYNC_LOG_DIR`), logs are additionally written to a daily-rolling
/// file under that directory; otherwise only stderr is used.
pub fn init(log_dir: Option<&std::path::Path>) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "dirsync.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking.and(std::io::stderr))
                .init();
            LogGuard(Some(guard))
        }
        None => {
            fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
            LogGuard(None)
        }
    }
}
