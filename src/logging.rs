//! Logging setup: console output, optional rolling file output.

use std::io;
use std::path::Path;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system.
///
/// `log_dir` enables daily-rotated file output next to the console layer;
/// `verbose` lifts the default filter from `info` to `debug`. `log::`
/// macros are bridged into tracing.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let console = fmt::layer()
        .with_writer(io::stdout)
        .with_target(true)
        .with_level(true)
        .with_timer(LocalTimeTimer);

    let registry = tracing_subscriber::registry().with(env_filter).with(console);

    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, "satip-client.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // Keep the writer guard alive for the process lifetime.
        Box::leak(Box::new(guard));
        let file = fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_level(true)
            .with_ansi(false)
            .with_timer(LocalTimeTimer);
        tracing::subscriber::set_global_default(registry.with(file))?;
    } else {
        tracing::subscriber::set_global_default(registry)?;
    }

    tracing_log::LogTracer::init()?;
    Ok(())
}

/// Local-time timestamps for log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"))
    }
}
