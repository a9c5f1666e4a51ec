use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_FILE_NAME: &str = "pisyncd.log";
const DEFAULT_DIRECTIVE: &str = "info";

/// Keeps the file writer flushing until dropped.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
    log_path: Option<PathBuf>,
}

impl LoggingGuard {
    pub fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }
}

pub fn log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("pisync")
}

fn filter_directive<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["PISYNC_LOG", "RUST_LOG"]
        .into_iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string())
}

fn env_filter() -> EnvFilter {
    let directive = filter_directive(|name| std::env::var(name).ok());
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Installs a console layer and, when the log directory is writable, a file
/// layer. Safe to call more than once; later calls keep the first subscriber.
pub fn init_logging() -> LoggingGuard {
    let dir = log_dir();
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if std::fs::create_dir_all(&dir).is_ok() {
        let appender = tracing_appender::rolling::never(&dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file = fmt::layer().with_writer(writer).with_ansi(false);
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(console)
            .with(file)
            .try_init();
        return LoggingGuard {
            _file: Some(guard),
            log_path: Some(dir.join(LOG_FILE_NAME)),
        };
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .try_init();
    LoggingGuard {
        _file: None,
        log_path: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_pisync_log_over_rust_log() {
        let directive = filter_directive(|name| match name {
            "PISYNC_LOG" => Some("pisyncd=debug".into()),
            "RUST_LOG" => Some("warn".into()),
            _ => None,
        });
        assert_eq!(directive, "pisyncd=debug");
    }

    #[test]
    fn falls_back_to_rust_log_then_info() {
        let directive = filter_directive(|name| match name {
            "PISYNC_LOG" => Some("  ".into()),
            "RUST_LOG" => Some("trace".into()),
            _ => None,
        });
        assert_eq!(directive, "trace");
        assert_eq!(filter_directive(|_| None), "info");
    }

    #[test]
    fn log_dir_is_namespaced() {
        assert!(log_dir().ends_with("pisync"));
    }
}
