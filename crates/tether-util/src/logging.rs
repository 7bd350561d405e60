use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking file writer alive. Dropping it flushes and stops
/// the background logging thread.
pub struct LogGuard {
    path: Option<PathBuf>,
    _worker: Option<WorkerGuard>,
}

impl LogGuard {
    /// Log file in use, `None` when logging to stderr.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn build_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")))
}

pub fn log_file_path(log_dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%dT%H%M%S").to_string();
    log_dir.join(format!("{}.log", timestamp))
}

/// Installs the global tracing subscriber.
///
/// With `print` set, events go to stderr. Otherwise they are written to a
/// timestamped file under `log_dir` (current directory when absent).
/// Fails if a global subscriber is already installed.
pub fn init_tracing(level: Option<&str>, log_dir: Option<PathBuf>, print: bool) -> Result<LogGuard> {
    let filter = build_filter(level);

    if print {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .context("tracing subscriber already installed")?;
        return Ok(LogGuard {
            path: None,
            _worker: None,
        });
    }

    let log_dir = log_dir.unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
    let log_path = log_file_path(&log_dir);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {:?}", log_path))?;

    let (non_blocking, worker) = tracing_appender::non_blocking(file);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LogGuard {
        path: Some(log_path),
        _worker: Some(worker),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_to_timestamped_file_and_refuses_second_init() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init_tracing(Some("debug"), Some(dir.path().join("logs")), false)
            .expect("first init should succeed");

        let path = guard.path().expect("file logging").to_path_buf();
        assert!(path.starts_with(dir.path().join("logs")));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("log"));
        assert!(path.exists());

        assert!(init_tracing(None, None, true).is_err());
    }
}
