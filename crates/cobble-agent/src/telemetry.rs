use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "agent.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Diagnostics go to stderr and a daily-rolling file under `logs_dir`.
/// Stdout is left for the server console. Keep the guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(logs_dir: &Path) -> Option<WorkerGuard> {
    let file = match std::fs::create_dir_all(logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
            Some(tracing_appender::non_blocking(appender))
        }
        Err(err) => {
            eprintln!("cannot create log dir {}: {err}", logs_dir.display());
            None
        }
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .compact();

    match file {
        Some((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .try_init()
                .ok();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_the_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let guard = init(&logs);
        assert!(logs.is_dir());
        assert!(guard.is_some());
    }
}
