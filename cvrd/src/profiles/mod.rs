//! Profile executor: one fixed pipeline of timed steps per project kind.
//!
//! Dispatch over [`ProfileKind`] is an exhaustive match, so adding a kind
//! forces a decision here. The profile boundary is absolute: whatever goes
//! wrong inside a profile — typed errors, panics — comes out as a
//! `ProfileResult` with `status = failure` and a non-empty message. The
//! host process never dies for a broken build.

pub mod ios_capacitor;
pub mod node_service;
pub mod stubs;
pub mod tauri_app;
pub mod web_generic;

use crate::depcache::DependencyCache;
use crate::simulator::SimulatorService;
use cvr_common::{CommandOutput, ProfileContext, ProfileKind, ProfileResult, ProfileStatus,
    StepDuration};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Shared services a profile run may need. Cheap to clone.
#[derive(Clone)]
pub struct ProfileToolkit {
    pub simulators: Arc<SimulatorService>,
    pub dep_cache: Arc<DependencyCache>,
}

/// Run a profile to completion. This is the catch-all boundary: typed
/// errors and panics both become a failed result.
pub async fn run_profile(
    toolkit: ProfileToolkit,
    ctx: ProfileContext,
    kind: ProfileKind,
) -> ProfileResult {
    let fallback_log = ctx.logs_dir.join(format!("{}-build.log", ctx.run_id));

    let handle = tokio::spawn(dispatch(toolkit, ctx, kind));
    let result = match handle.await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!(profile = %kind, error = %err, "profile failed");
            ProfileResult::failure(&fallback_log, err.to_string())
        }
        Err(join_err) => {
            error!(profile = %kind, error = %join_err, "profile execution crashed");
            ProfileResult::failure(&fallback_log, format!("profile execution crashed: {join_err}"))
        }
    };
    normalize(result)
}

async fn dispatch(
    toolkit: ProfileToolkit,
    ctx: ProfileContext,
    kind: ProfileKind,
) -> Result<ProfileResult, cvr_common::PipelineError> {
    match kind {
        ProfileKind::NodeService => node_service::run(&ctx).await,
        ProfileKind::WebGeneric => web_generic::run(&ctx).await,
        ProfileKind::IosCapacitor => ios_capacitor::run(&toolkit, &ctx).await,
        ProfileKind::TauriApp => tauri_app::run(&toolkit, &ctx).await,
        ProfileKind::AndroidCapacitor => stubs::run_android_capacitor(&ctx).await,
        ProfileKind::Custom => stubs::run_custom(&ctx).await,
    }
}

/// Uphold the invariant that a failed result carries a message.
fn normalize(mut result: ProfileResult) -> ProfileResult {
    if result.status == ProfileStatus::Failure
        && result
            .error_message
            .as_deref()
            .is_none_or(|message| message.is_empty())
    {
        result.error_message = Some("profile failed without a message".to_string());
    }
    result
}

// ── Strategy chain ───────────────────────────────────────────────────────

/// Tagged outcome of one strategy in an ordered fallback chain.
pub enum StrategyOutcome<T> {
    Success(T),
    /// Try the next strategy.
    SoftFail(String),
    /// Stop the whole chain.
    HardFail(String),
}

pub type BoxedStrategy<T> = (
    &'static str,
    Pin<Box<dyn Future<Output = StrategyOutcome<T>> + Send>>,
);

/// Try strategies in order, stopping at the first success. Soft failures
/// move on to the next strategy; a hard failure aborts the chain.
pub async fn first_success<T>(
    label: &str,
    strategies: Vec<BoxedStrategy<T>>,
) -> Result<(&'static str, T), String> {
    let mut last_failure = format!("no strategies available for {label}");
    for (name, strategy) in strategies {
        match strategy.await {
            StrategyOutcome::Success(value) => {
                debug!(label, strategy = name, "strategy succeeded");
                return Ok((name, value));
            }
            StrategyOutcome::SoftFail(message) => {
                debug!(label, strategy = name, message = %message, "strategy soft-failed, trying next");
                last_failure = message;
            }
            StrategyOutcome::HardFail(message) => {
                warn!(label, strategy = name, message = %message, "strategy hard-failed, stopping chain");
                return Err(message);
            }
        }
    }
    Err(last_failure)
}

// ── Shared step helpers ──────────────────────────────────────────────────

/// Records wall time per named step.
pub(crate) struct StepTimer {
    durations: Vec<StepDuration>,
}

impl StepTimer {
    pub(crate) fn new() -> Self {
        Self {
            durations: Vec::new(),
        }
    }

    pub(crate) async fn time<T, F>(&mut self, step: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let out = fut.await;
        self.durations.push(StepDuration::new(step, started.elapsed()));
        out
    }

    pub(crate) fn into_durations(self) -> Vec<StepDuration> {
        self.durations
    }
}

/// Whether the manifest declares a script with this name.
pub(crate) fn manifest_script_exists(local_path: &std::path::Path, script: &str) -> bool {
    let Ok(manifest) = std::fs::read_to_string(local_path.join("package.json")) else {
        return false;
    };
    let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&manifest) else {
        return false;
    };
    manifest
        .get("scripts")
        .and_then(|scripts| scripts.get(script))
        .is_some()
}

/// Human-readable exit label for result messages.
pub(crate) fn exit_label(output: &CommandOutput) -> String {
    match output.exit_code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}
