//! Shared types and utilities for the Continuous Verification Runner.
//!
//! This crate holds everything the daemon and its tests agree on: the core
//! data model (jobs, run records, profile contexts/results), the error
//! taxonomy, environment-driven configuration, logging bootstrap, the
//! process supervisor, retry/backoff, and the per-run log writer.

pub mod config;
pub mod errors;
pub mod logging;
pub mod process;
pub mod retry;
pub mod run_log;
pub mod types;

pub use config::{EnvError, PipelineConfig, StepTimeouts};
pub use errors::PipelineError;
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use process::{
    CommandOutput, OutputLine, OutputStream, ProcessHandle, SupervisorError, run_with_timeout,
    spawn_long_running,
};
pub use retry::{RetryPolicy, retry};
pub use run_log::{LogKind, RunLogger};
pub use types::{
    BuildJob, BuildOptions, DiffResult, JobKey, ProfileContext, ProfileKind, ProfileResult,
    ProfileStatus, RepoConfig, RunRecord, RunStatus, StepDuration, Trigger, new_run_id,
};
