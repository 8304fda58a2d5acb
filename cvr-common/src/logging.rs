//! Tracing bootstrap for CVR binaries.
//!
//! Daemon-level diagnostics go through `tracing`; per-run build/runtime
//! logs are separate plain files (see [`crate::run_log`]).

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logging configuration for a binary.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `CVR_LOG` / `RUST_LOG` are unset.
    level: String,
    /// Optional log file (non-blocking appender).
    file: Option<PathBuf>,
    /// Whether to also write to stderr.
    stderr: bool,
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            file: None,
            stderr: true,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file = Some(path);
        self
    }
}

/// Keeps non-blocking appender workers alive for the process lifetime.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Initialize the global tracing subscriber.
///
/// `CVR_LOG` takes precedence over the configured default level and accepts
/// full `EnvFilter` directives.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = EnvFilter::try_from_env("CVR_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let mut guards = Vec::new();
    let registry = tracing_subscriber::registry().with(filter);

    match &config.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cvrd.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            if config.stderr {
                registry
                    .with(file_layer)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .init();
            } else {
                registry.with(file_layer).init();
            }
        }
        None => {
            registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(LoggingGuards { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_config_builder() {
        let config = LogConfig::new("info")
            .with_level("debug")
            .with_file(PathBuf::from("/tmp/cvrd.log"));
        assert_eq!(config.level, "debug");
        assert_eq!(config.file.as_deref(), Some(std::path::Path::new("/tmp/cvrd.log")));
        assert!(config.stderr);
    }
}
