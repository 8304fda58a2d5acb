//! ios-capacitor profile: sync the Capacitor iOS shell, boot a simulator,
//! launch, capture, and stream device logs.
//!
//! Missing platform folder or simulator toolchain is fatal; a failing app
//! launch is soft — the screenshot and log capture still run so the result
//! carries as much evidence as possible.

use super::{ProfileToolkit, StepTimer, exit_label};
use cvr_common::{
    LogKind, PipelineError, ProfileContext, ProfileResult, ProfileStatus, RunLogger,
    run_with_timeout,
};
use std::path::PathBuf;
use tokio::time::sleep;
use tracing::{info, warn};

pub(crate) async fn run(
    toolkit: &ProfileToolkit,
    ctx: &ProfileContext,
) -> Result<ProfileResult, PipelineError> {
    let build_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Build);
    let runtime_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Runtime);
    let timeouts = &ctx.build_options.timeouts;
    let env = &ctx.build_options.env;
    let mut timer = StepTimer::new();

    build_log.line(&format!(
        "ios-capacitor run {} for {}@{}",
        ctx.run_id, ctx.repo_full_name, ctx.branch
    ));

    // Without the platform shell there is nothing to build at all.
    if !ctx.local_path.join("ios").exists() {
        let message = "iOS platform folder missing; run `npx cap add ios` and commit it";
        build_log.line(message);
        return Ok(failure(&build_log, &runtime_log, timer, message));
    }

    // ToolUnavailable carries its remediation hint to the profile boundary.
    toolkit.simulators.ensure_available().await?;

    build_log.line("installing dependencies (npm ci)");
    let install = timer
        .time(
            "install",
            run_with_timeout("npm ci", &ctx.local_path, timeouts.install, env),
        )
        .await?;
    build_log.chunk(&install.combined());
    if !install.success {
        let message = format!("Dependency install failed (exit code {})", exit_label(&install));
        build_log.line(&message);
        return Ok(failure(&build_log, &runtime_log, timer, &message));
    }

    build_log.line("syncing web assets into the iOS shell");
    let sync = timer
        .time(
            "cap-sync",
            run_with_timeout("npx cap sync ios", &ctx.local_path, timeouts.build, env),
        )
        .await?;
    build_log.chunk(&sync.combined());
    if !sync.success {
        let message = format!("Capacitor sync failed (exit code {})", exit_label(&sync));
        build_log.line(&message);
        return Ok(failure(&build_log, &runtime_log, timer, &message));
    }

    let target = toolkit.simulators.pick_device().await?;
    build_log.line(&format!("simulator: {} ({:?})", target.name, target.udid));

    timer
        .time("simulator-boot", async {
            toolkit.simulators.boot(&target).await?;
            toolkit
                .simulators
                .wait_for_boot(&target, timeouts.simulator_boot)
                .await
        })
        .await?;
    build_log.line("simulator booted");

    // Launch is soft: capture continues even when the launch command
    // reports failure, because the app may still be on screen.
    let launch_target = target.udid.as_deref().unwrap_or(&target.name);
    let launch = timer
        .time(
            "launch",
            run_with_timeout(
                &format!("npx cap run ios --target '{launch_target}'"),
                &ctx.local_path,
                timeouts.app_launch,
                env,
            ),
        )
        .await?;
    build_log.chunk(&launch.combined());
    if !launch.success {
        warn!(repo = %ctx.repo_full_name, "app launch reported failure, capturing anyway");
        build_log.line("app launch reported failure; continuing to capture (soft failure)");
    }

    sleep(timeouts.render_delay).await;

    let screenshot_path = timer
        .time("screenshot", capture(toolkit, ctx, &build_log))
        .await;

    build_log.line(&format!(
        "streaming simulator logs for {}s",
        timeouts.log_capture.as_secs()
    ));
    timer
        .time(
            "log-stream",
            toolkit.simulators.stream_logs(timeouts.log_capture, &runtime_log),
        )
        .await;

    info!(repo = %ctx.repo_full_name, device = %target.name, "ios-capacitor run finished");
    Ok(ProfileResult {
        status: ProfileStatus::Success,
        screenshot_path,
        build_log_path: build_log.path().to_path_buf(),
        runtime_log_path: Some(runtime_log.path().to_path_buf()),
        network_log_path: None,
        error_message: None,
        durations: timer.into_durations(),
        diff_result: None,
    })
}

async fn capture(
    toolkit: &ProfileToolkit,
    ctx: &ProfileContext,
    build_log: &RunLogger,
) -> Option<PathBuf> {
    if let Err(err) = std::fs::create_dir_all(&ctx.screenshots_dir) {
        warn!(error = %err, "screenshots directory unavailable");
        return None;
    }
    let out = ctx.screenshots_dir.join(format!("{}.png", ctx.run_id));
    match toolkit
        .simulators
        .screenshot(&out, ctx.build_options.timeouts.screenshot)
        .await
    {
        Ok(()) => {
            build_log.line("simulator screenshot captured");
            Some(out)
        }
        Err(err) => {
            build_log.line(&format!("screenshot unavailable: {err}"));
            None
        }
    }
}

fn failure(
    build_log: &RunLogger,
    runtime_log: &RunLogger,
    timer: StepTimer,
    message: &str,
) -> ProfileResult {
    ProfileResult {
        status: ProfileStatus::Failure,
        screenshot_path: None,
        build_log_path: build_log.path().to_path_buf(),
        runtime_log_path: Some(runtime_log.path().to_path_buf()),
        network_log_path: None,
        error_message: Some(message.to_string()),
        durations: timer.into_durations(),
        diff_result: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depcache::DependencyCache;
    use crate::simulator::SimulatorService;
    use std::sync::Arc;

    fn toolkit(tmp: &std::path::Path) -> ProfileToolkit {
        ProfileToolkit {
            simulators: Arc::new(SimulatorService::default()),
            dep_cache: Arc::new(DependencyCache::new(tmp.join("cache"))),
        }
    }

    #[tokio::test]
    async fn missing_platform_folder_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        let ctx = super::super::tests::test_context(&tree, tmp.path());

        let result = run(&toolkit(tmp.path()), &ctx).await.unwrap();
        assert_eq!(result.status, ProfileStatus::Failure);
        assert!(
            result
                .error_message
                .as_deref()
                .unwrap()
                .contains("iOS platform folder")
        );
    }

    #[tokio::test]
    async fn missing_toolchain_surfaces_remediation_hint() {
        // On hosts without xcrun the toolchain check must produce the
        // ToolUnavailable hint instead of a confusing downstream error.
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        std::fs::create_dir_all(tree.join("ios")).unwrap();
        let ctx = super::super::tests::test_context(&tree, tmp.path());

        let toolkit = toolkit(tmp.path());
        if toolkit.simulators.ensure_available().await.is_ok() {
            // Host actually has Xcode tooling; nothing to assert here.
            return;
        }
        let err = run(&toolkit, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("xcrun"));
        assert!(err.to_string().contains("Xcode"));
    }
}
