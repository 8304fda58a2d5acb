//! Environment-driven pipeline configuration.
//!
//! Provides a type-safe parser for `CVR_` environment variables with
//! validation and error collection, so all configuration problems can be
//! reported at once instead of one startup crash at a time.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the CVR_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "CVR_",
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get an optional string value (None when unset or empty).
    pub fn get_opt_string(&mut self, name: &str) -> Option<String> {
        match env::var(self.var_name(name)) {
            Ok(value) if !value.is_empty() => Some(value),
            _ => None,
        }
    }

    /// Get a path with `~` expansion, falling back to a default.
    pub fn get_path(&mut self, name: &str, default: PathBuf) -> PathBuf {
        match env::var(self.var_name(name)) {
            Ok(value) if !value.is_empty() => {
                PathBuf::from(shellexpand::tilde(&value).into_owned())
            }
            _ => default,
        }
    }

    /// Get a usize with default and range validation.
    pub fn get_usize_range(
        &mut self,
        name: &str,
        default: usize,
        min: usize,
        max: usize,
    ) -> usize {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<usize>() {
                Ok(parsed) if (min..=max).contains(&parsed) => parsed,
                Ok(parsed) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value: parsed.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned integer".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Get a duration with default, accepting humantime strings ("30s", "10m").
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Duration {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match humantime::parse_duration(&value) {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name,
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-step deadline budget. Every external command the pipeline runs is
/// bounded by one of these.
#[derive(Debug, Clone)]
pub struct StepTimeouts {
    pub clone_repo: Duration,
    pub fetch: Duration,
    pub checkout: Duration,
    pub install: Duration,
    pub build: Duration,
    pub test: Duration,
    pub simulator_boot: Duration,
    pub app_launch: Duration,
    pub dev_ready: Duration,
    pub render_delay: Duration,
    pub log_capture: Duration,
    pub screenshot: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            clone_repo: Duration::from_secs(300),
            fetch: Duration::from_secs(60),
            checkout: Duration::from_secs(60),
            install: Duration::from_secs(600),
            build: Duration::from_secs(600),
            test: Duration::from_secs(300),
            simulator_boot: Duration::from_secs(120),
            app_launch: Duration::from_secs(120),
            dev_ready: Duration::from_secs(180),
            render_delay: Duration::from_secs(8),
            log_capture: Duration::from_secs(15),
            screenshot: Duration::from_secs(30),
        }
    }
}

impl StepTimeouts {
    fn from_parser(parser: &mut EnvParser) -> Self {
        let defaults = Self::default();
        Self {
            clone_repo: parser.get_duration("CLONE_TIMEOUT", defaults.clone_repo),
            fetch: parser.get_duration("FETCH_TIMEOUT", defaults.fetch),
            checkout: parser.get_duration("CHECKOUT_TIMEOUT", defaults.checkout),
            install: parser.get_duration("INSTALL_TIMEOUT", defaults.install),
            build: parser.get_duration("BUILD_TIMEOUT", defaults.build),
            test: parser.get_duration("TEST_TIMEOUT", defaults.test),
            simulator_boot: parser.get_duration("SIMULATOR_BOOT_TIMEOUT", defaults.simulator_boot),
            app_launch: parser.get_duration("APP_LAUNCH_TIMEOUT", defaults.app_launch),
            dev_ready: parser.get_duration("DEV_READY_TIMEOUT", defaults.dev_ready),
            render_delay: parser.get_duration("RENDER_DELAY", defaults.render_delay),
            log_capture: parser.get_duration("LOG_CAPTURE_DURATION", defaults.log_capture),
            screenshot: parser.get_duration("SCREENSHOT_TIMEOUT", defaults.screenshot),
        }
    }
}

/// Daemon-wide pipeline configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base directory for clones: `<base>/<owner>/<repo>`.
    pub clone_base_dir: PathBuf,
    /// Per-run build/runtime/network log files.
    pub logs_dir: PathBuf,
    /// Captured screenshots and diff images.
    pub screenshots_dir: PathBuf,
    /// Dependency cache snapshots.
    pub cache_dir: PathBuf,
    /// Token for authenticated clone transport. Absence makes cloning fail
    /// fast with an explicit "not configured" result.
    pub github_token: Option<String>,
    /// Distinct repository+branch keys allowed to run concurrently.
    pub max_concurrent_jobs: usize,
    pub timeouts: StepTimeouts,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cvr")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data = default_data_dir();
        Self {
            clone_base_dir: data.join("repos"),
            logs_dir: data.join("logs"),
            screenshots_dir: data.join("screenshots"),
            cache_dir: data.join("cache"),
            github_token: None,
            max_concurrent_jobs: 2,
            timeouts: StepTimeouts::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the environment, collecting (not throwing)
    /// validation errors.
    pub fn from_env() -> (Self, Vec<EnvError>) {
        let mut parser = EnvParser::new();
        let defaults = Self::default();

        let config = Self {
            clone_base_dir: parser.get_path("CLONE_BASE_DIR", defaults.clone_base_dir),
            logs_dir: parser.get_path("LOGS_DIR", defaults.logs_dir),
            screenshots_dir: parser.get_path("SCREENSHOTS_DIR", defaults.screenshots_dir),
            cache_dir: parser.get_path("CACHE_DIR", defaults.cache_dir),
            github_token: parser.get_opt_string("GITHUB_TOKEN"),
            max_concurrent_jobs: parser.get_usize_range("MAX_CONCURRENT_JOBS", 2, 1, 16),
            timeouts: StepTimeouts::from_parser(&mut parser),
        };

        (config, parser.take_errors())
    }
}
