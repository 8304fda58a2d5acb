//! Core types shared across CVR components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::StepTimeouts;

/// Serialization key for the build queue: one in-flight run per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub repo_full_name: String,
    pub branch: String,
}

impl JobKey {
    pub fn new(repo_full_name: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            branch: branch.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repo_full_name, self.branch)
    }
}

/// What caused a build job to be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A push to the repository.
    Push,
    /// An operator-initiated run.
    Manual,
    /// A re-run of an earlier job.
    Retry,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Manual => write!(f, "manual"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// A single admitted build request. Consumed exactly once by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub repo_full_name: String,
    pub branch: String,
    pub queued_at: DateTime<Utc>,
    pub trigger: Trigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_author: Option<String>,
}

impl BuildJob {
    pub fn new(repo_full_name: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            branch: branch.into(),
            queued_at: Utc::now(),
            trigger: Trigger::Push,
            commit_message: None,
            commit_author: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.repo_full_name, &self.branch)
    }
}

/// Closed set of build/run/capture recipes. Dispatch is an exhaustive match
/// so adding a kind forces every consumer to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileKind {
    IosCapacitor,
    AndroidCapacitor,
    NodeService,
    TauriApp,
    WebGeneric,
    Custom,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IosCapacitor => write!(f, "ios-capacitor"),
            Self::AndroidCapacitor => write!(f, "android-capacitor"),
            Self::NodeService => write!(f, "node-service"),
            Self::TauriApp => write!(f, "tauri-app"),
            Self::WebGeneric => write!(f, "web-generic"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for ProfileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios-capacitor" => Ok(Self::IosCapacitor),
            "android-capacitor" => Ok(Self::AndroidCapacitor),
            "node-service" => Ok(Self::NodeService),
            "tauri-app" => Ok(Self::TauriApp),
            "web-generic" => Ok(Self::WebGeneric),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown profile kind: {other}")),
        }
    }
}

/// Per-repository configuration, owned by the config store.
///
/// The pipeline reads it for routing and writes `local_path`/`last_runs`
/// back through the store's update contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Unique `owner/repo` name.
    pub repo_full_name: String,
    /// On-disk working tree, set once cloned.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub profile: ProfileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<u64>,
    /// Pinned dev-server port, when known up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_port: Option<u16>,
    /// Append-ordered run history (ring-bounded by the store).
    #[serde(default)]
    pub last_runs: Vec<RunRecord>,
    /// Whether the working tree was created by the pipeline itself.
    #[serde(default)]
    pub auto_cloned: bool,
}

fn default_true() -> bool {
    true
}

impl RepoConfig {
    pub fn new(repo_full_name: impl Into<String>, profile: ProfileKind) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            local_path: None,
            enabled: true,
            profile,
            webhook_id: None,
            dev_port: None,
            last_runs: Vec::new(),
            auto_cloned: false,
        }
    }
}

/// Lifecycle state of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// One pipeline run, created at start (`running`) and finalized on
/// completion. The most recent successful record with a screenshot is the
/// diff baseline for its branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub branch: String,
    pub timestamp: DateTime<Utc>,
    /// Globally unique; used as a filename component and history key.
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RunRecord {
    /// A freshly started run.
    pub fn started(branch: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            timestamp: Utc::now(),
            run_id: run_id.into(),
            status: RunStatus::Running,
            screenshot_path: None,
            build_log_path: None,
            runtime_log_path: None,
            network_log_path: None,
            error_message: None,
        }
    }
}

/// Mint a globally unique run id.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Knobs a profile run consults beyond the working tree itself.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Step timeout budget for this run.
    pub timeouts: StepTimeouts,
    /// Window title / app name for desktop capture, when it differs from
    /// the repository name.
    pub app_name: Option<String>,
    /// Override for the dev command (`npm run dev` by default).
    pub dev_command: Option<String>,
    /// Extra environment passed to every command of the run.
    pub env: Vec<(String, String)>,
}

/// Immutable input to a profile run.
#[derive(Debug, Clone)]
pub struct ProfileContext {
    pub repo_full_name: String,
    pub branch: String,
    pub local_path: PathBuf,
    pub run_id: String,
    pub logs_dir: PathBuf,
    pub screenshots_dir: PathBuf,
    pub dev_port: Option<u16>,
    pub build_options: BuildOptions,
}

impl ProfileContext {
    /// Short repo name (`repo` from `owner/repo`), used for window titles
    /// and cache keys.
    pub fn repo_short_name(&self) -> &str {
        self.repo_full_name
            .rsplit_once('/')
            .map_or(self.repo_full_name.as_str(), |(_, name)| name)
    }
}

/// Terminal outcome of a profile run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Success,
    Failure,
}

impl From<ProfileStatus> for RunStatus {
    fn from(status: ProfileStatus) -> Self {
        match status {
            ProfileStatus::Success => RunStatus::Success,
            ProfileStatus::Failure => RunStatus::Failure,
        }
    }
}

/// Wall time spent in one named profile step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDuration {
    pub step: String,
    pub elapsed_ms: u64,
}

impl StepDuration {
    pub fn new(step: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            step: step.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Output of a profile run.
///
/// Invariant: `status == Failure` always carries a non-empty
/// `error_message` (enforced by the `failure` constructor, checked at the
/// profile boundary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileResult {
    pub status: ProfileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    pub build_log_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub durations: Vec<StepDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_result: Option<DiffResult>,
}

impl ProfileResult {
    /// A failed result with a guaranteed non-empty message.
    pub fn failure(build_log_path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = "profile failed without a message".to_string();
        }
        Self {
            status: ProfileStatus::Failure,
            screenshot_path: None,
            build_log_path: build_log_path.into(),
            runtime_log_path: None,
            network_log_path: None,
            error_message: Some(message),
            durations: Vec::new(),
            diff_result: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProfileStatus::Success
    }
}

/// Screenshot regression comparison against the branch baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    /// Differing pixels as a percentage of the image area, 0.0..=100.0.
    pub diff_percentage: f64,
    /// Exact differing-pixel count; `None` when only an estimate was
    /// possible (hash fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_pixel_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_image_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_screenshot_path: Option<PathBuf>,
}

impl DiffResult {
    pub fn has_diff(&self) -> bool {
        self.diff_percentage > 0.0
    }
}
