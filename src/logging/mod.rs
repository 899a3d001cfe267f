use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::config::GeneralConfig;

const LOG_TARGET: &str = "audio_topology_controller";
const LOG_FILE_PREFIX: &str = "audio-topology-controller.log";

/// Subscriber setup for the daemon and the one-shot commands
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub file_output: bool,
    pub console_output: bool,
    pub log_dir: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: true,
            console_output: true,
            log_dir: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Console-only logging for short-lived CLI commands.
    pub fn console(level: Level) -> Self {
        Self {
            level,
            file_output: false,
            ..Self::default()
        }
    }

    /// Daemon logging at the configured level; `verbose` forces debug.
    pub fn for_daemon(general: &GeneralConfig, verbose: bool) -> Self {
        let level = if verbose {
            Level::DEBUG
        } else {
            parse_level(&general.log_level)
        };
        Self {
            level,
            ..Self::default()
        }
    }
}

/// Parse a configured level name, falling back to info.
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

/// Install the global subscriber. The returned guard flushes the file
/// writer and must be held for the life of the process.
pub fn initialize_logging(config: LoggingConfig) -> Result<(Option<WorkerGuard>, Option<PathBuf>)> {
    let mut layers = Vec::new();
    let mut guard = None;

    // RUST_LOG wins over the configured level when set
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={}",
            LOG_TARGET,
            config.level.as_str().to_lowercase()
        ))
    });

    if config.console_output {
        let console_layer = if config.json_format {
            fmt::layer().json().with_target(true).boxed()
        } else {
            fmt::layer().with_target(false).boxed()
        };
        layers.push(console_layer);
    }

    let log_dir = if config.file_output {
        let dir = match config.log_dir.clone() {
            Some(dir) => dir,
            None => get_default_log_dir()?,
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

        let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_thread_names(true)
                .with_writer(non_blocking)
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(non_blocking)
                .boxed()
        };
        layers.push(file_layer);

        Some(dir)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok((guard, log_dir))
}

/// Get the default log directory path
pub fn get_default_log_dir() -> Result<PathBuf> {
    let home_dir =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?;
    Ok(home_dir.join(".local/share/audio-topology-controller/logs"))
}

/// Delete rolled log files last modified more than `keep_days` ago.
/// Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep_days: u64) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(60 * 60 * 24 * keep_days))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;

    for entry in std::fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read log directory: {}", log_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let is_rolled_log = path.is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_rolled_log {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                tracing::debug!("Removed old log file: {}", path.display());
            }
            Err(e) => tracing::warn!("Failed to remove old log file {}: {}", path.display(), e),
        }
    }

    if removed > 0 {
        tracing::info!("Cleaned up {} old log files from {}", removed, log_dir.display());
    }
    Ok(removed)
}
