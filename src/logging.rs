//! Tracing initialisation for the epicflow binary.
//!
//! Call [`init_logging`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Prefix of the daily-rotated log file under `.epicflow/logs/`.
pub const LOG_FILE: &str = "epicflow.log";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions<'a> {
    pub verbose: bool,
    /// JSON lines on stderr instead of human-readable output.
    pub json: bool,
    /// Also write a log file here.
    pub log_dir: Option<&'a Path>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the default level (`info`, or `debug` with
/// `verbose`). The returned guard flushes the file writer on drop and must
/// be kept alive for the duration of the program.
pub fn init_logging(options: LogOptions<'_>) -> Option<WorkerGuard> {
    let default_level = if options.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match options.log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    if options.json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = tempdir().unwrap();
        let options = LogOptions {
            verbose: true,
            json: false,
            log_dir: Some(dir.path()),
        };
        let _first = init_logging(options);
        let _second = init_logging(LogOptions::default());
        tracing::info!("logging initialised");
        assert!(dir.path().exists());
    }
}
