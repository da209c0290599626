//! # Tracing Setup
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter` built from
//! the configured level (`RUST_LOG` wins when set), a stdout layer and, when a
//! log directory is configured, a daily-rolling file layer written through a
//! non-blocking worker. Log files older than the retention window are removed
//! before the subscriber starts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log directory error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    /// File name prefix of the rolling log files.
    pub app_name: String,
    /// `None` logs to stdout only.
    pub log_dir: Option<PathBuf>,
    /// Default filter directive, e.g. "info" or "lib_gateway=debug,info".
    pub level: String,
    /// Days a log file is kept.
    pub saving_days: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            app_name: "server_focas".to_string(),
            log_dir: Some(PathBuf::from("./logs")),
            level: "info".to_string(),
            saving_days: 7,
        }
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn setup_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>, LoggerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let removed = cleanup_old_logs(dir, settings.saving_days)?;
            if removed > 0 {
                eprintln!("removed {removed} expired log file(s) from {}", dir.display());
            }
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", settings.app_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    Ok(guard)
}

/// Removes `*.log*` files in `dir` last modified more than `saving_days`
/// days ago. Returns how many were removed.
pub fn cleanup_old_logs(dir: &Path, saving_days: u64) -> io::Result<usize> {
    let window = Duration::from_secs(saving_days.saturating_mul(24 * 60 * 60));
    let cutoff = SystemTime::now()
        .checked_sub(window)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    remove_logs_older_than(dir, cutoff)
}

fn remove_logs_older_than(dir: &Path, cutoff: SystemTime) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)?.filter_map(Result::ok) {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".log"));
        if !is_log {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("failed to delete old log file {}: {e}", path.display()),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn only_expired_log_files_are_removed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("server_focas.log.2024-01-01"), "old").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        // Fresh files survive the normal retention window.
        assert_eq!(cleanup_old_logs(dir.path(), 7).unwrap(), 0);

        let future = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(remove_logs_older_than(dir.path(), future).unwrap(), 1);
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("server_focas.log.2024-01-01").exists());
    }
}
