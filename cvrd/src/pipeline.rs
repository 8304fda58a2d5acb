//! One job, end to end: working tree → profile → diff → record → notify.
//!
//! The pipeline never decides *whether* to build — admission answers that
//! before the queue — and it never throws past its own boundary: whatever
//! a run produced, callers observe a finalized run record and a
//! `run_completed` event.

use crate::depcache::DependencyCache;
use crate::diff::ScreenshotDiffer;
use crate::events::{EventBus, RunCompletedEvent, RunStartedEvent};
use crate::gitsync::RepoSynchronizer;
use crate::profiles::{ProfileToolkit, run_profile};
use crate::queue::{BoxedJobFuture, JobRunner};
use crate::screenshot;
use crate::simulator::SimulatorService;
use crate::store::ConfigStore;
use cvr_common::{
    BuildJob, BuildOptions, PipelineConfig, PipelineError, ProfileContext, ProfileResult,
    RepoConfig, RunRecord, new_run_id,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a trigger was (or was not) admitted. Everything except `Admitted`
/// is acknowledged-and-dropped, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted,
    UnknownRepo,
    Disabled,
    Paused,
}

impl std::fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admitted => write!(f, "admitted"),
            Self::UnknownRepo => write!(f, "unknown repository"),
            Self::Disabled => write!(f, "repository disabled"),
            Self::Paused => write!(f, "repository paused"),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    store: Arc<dyn ConfigStore>,
    events: EventBus,
    sync: RepoSynchronizer,
    differ: ScreenshotDiffer,
    toolkit: ProfileToolkit,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn ConfigStore>, events: EventBus) -> Self {
        let config = Arc::new(config);
        let toolkit = ProfileToolkit {
            simulators: Arc::new(SimulatorService::default()),
            dep_cache: Arc::new(DependencyCache::new(config.cache_dir.clone())),
        };
        Self {
            sync: RepoSynchronizer::new(Arc::clone(&config)),
            differ: ScreenshotDiffer::new(),
            toolkit,
            config,
            store,
            events,
        }
    }

    pub fn synchronizer(&self) -> &RepoSynchronizer {
        &self.sync
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Admission check used before anything enters the queue.
    pub fn admit(&self, repo_full_name: &str) -> AdmissionDecision {
        match self.store.get_repo_config(repo_full_name) {
            None => AdmissionDecision::UnknownRepo,
            Some(config) if !config.enabled => AdmissionDecision::Disabled,
            Some(_) if self.store.is_repo_paused(repo_full_name) => AdmissionDecision::Paused,
            Some(_) => AdmissionDecision::Admitted,
        }
    }

    /// Execute one admitted job to completion. Never returns an error: the
    /// outcome is a finalized run record plus a `run_completed` event.
    pub async fn handle_job(&self, job: BuildJob) {
        let Some(repo) = self.store.get_repo_config(&job.repo_full_name) else {
            warn!(repo = %job.repo_full_name, "job for unknown repo reached the queue, dropping");
            return;
        };

        let run_id = new_run_id();
        self.store
            .record_run_started(&job.repo_full_name, RunRecord::started(&job.branch, &run_id));
        self.events.emit(
            "run_started",
            &RunStartedEvent {
                repo_full_name: job.repo_full_name.clone(),
                branch: job.branch.clone(),
                run_id: run_id.clone(),
            },
        );
        info!(repo = %job.repo_full_name, branch = %job.branch, run_id = %run_id, "run started");

        let started = Instant::now();
        let result = match self.execute(&job, &repo, &run_id).await {
            Ok(result) => result,
            Err(err) => {
                warn!(repo = %job.repo_full_name, error = %err, "run failed before the profile could finish");
                ProfileResult::failure(
                    self.config.logs_dir.join(format!("{run_id}-build.log")),
                    err.to_string(),
                )
            }
        };

        self.store.finalize_run(&job.repo_full_name, &run_id, &|record| {
            record.status = result.status.into();
            record.screenshot_path = result.screenshot_path.clone();
            record.build_log_path = Some(result.build_log_path.clone());
            record.runtime_log_path = result.runtime_log_path.clone();
            record.network_log_path = result.network_log_path.clone();
            record.error_message = result.error_message.clone();
        });

        let completed = RunCompletedEvent::from_result(
            &job.repo_full_name,
            &job.branch,
            &run_id,
            &result,
            started.elapsed().as_millis() as u64,
        );
        self.events.emit("run_completed", &completed);
        info!(
            repo = %job.repo_full_name,
            run_id = %run_id,
            success = result.is_success(),
            "run finished"
        );
    }

    async fn execute(
        &self,
        job: &BuildJob,
        repo: &RepoConfig,
        run_id: &str,
    ) -> Result<ProfileResult, PipelineError> {
        // Working tree: reuse the known checkout, auto-clone otherwise.
        let local_path = match &repo.local_path {
            Some(path) if path.join(".git").exists() => path.clone(),
            _ => {
                let outcome = self.sync.clone_repo(&job.repo_full_name).await?;
                let path = outcome.local_path.clone();
                let freshly_cloned = !outcome.already_present;
                self.store.update_repo_config(&job.repo_full_name, &|config| {
                    config.local_path = Some(path.clone());
                    if freshly_cloned {
                        config.auto_cloned = true;
                    }
                });
                outcome.local_path
            }
        };

        let sync_outcome = self.sync.sync_to_branch(&local_path, &job.branch).await?;
        if sync_outcome.recovery_attempted {
            info!(
                repo = %job.repo_full_name,
                branch_used = %sync_outcome.branch_used,
                "sync needed recovery"
            );
        }
        self.sync.clean_orphaned_branches(&local_path).await;

        std::fs::create_dir_all(&self.config.logs_dir)?;
        std::fs::create_dir_all(&self.config.screenshots_dir)?;

        let ctx = ProfileContext {
            repo_full_name: job.repo_full_name.clone(),
            branch: job.branch.clone(),
            local_path,
            run_id: run_id.to_string(),
            logs_dir: self.config.logs_dir.clone(),
            screenshots_dir: self.config.screenshots_dir.clone(),
            dev_port: repo.dev_port,
            build_options: BuildOptions {
                timeouts: self.config.timeouts.clone(),
                app_name: None,
                dev_command: None,
                env: Vec::new(),
            },
        };

        let mut result = run_profile(self.toolkit.clone(), ctx, repo.profile).await;

        // Regression diff for any profile that produced a screenshot.
        if let Some(current) = result.screenshot_path.clone() {
            let baseline = self
                .store
                .previous_successful_run(&job.repo_full_name, &job.branch, run_id)
                .and_then(|record| record.screenshot_path);
            match baseline {
                Some(previous) => {
                    let diff_out = self
                        .config
                        .screenshots_dir
                        .join(format!("{run_id}-diff.png"));
                    result.diff_result = self
                        .differ
                        .diff(&current, &previous, &diff_out, self.config.timeouts.screenshot)
                        .await;
                }
                None => debug!(repo = %job.repo_full_name, "no baseline, skipping diff"),
            }
            screenshot::thumbnail(
                &current,
                &self
                    .config
                    .screenshots_dir
                    .join(format!("{run_id}-thumb.png")),
                self.config.timeouts.screenshot,
            )
            .await;
        }

        Ok(result)
    }
}

impl JobRunner for Pipeline {
    fn run_job(&self, job: BuildJob) -> BoxedJobFuture {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.handle_job(job).await })
    }
}
