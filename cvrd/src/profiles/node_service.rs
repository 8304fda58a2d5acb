//! node-service profile: install → optional build → test.
//!
//! Install and test are hard steps; a missing or failing build script is
//! tolerated so the test signal still gets produced. Test output is tee'd
//! into both the build log and the runtime log.

use super::{StepTimer, exit_label, manifest_script_exists};
use cvr_common::{
    LogKind, PipelineError, ProfileContext, ProfileResult, ProfileStatus, RunLogger,
    run_with_timeout,
};
use tracing::{info, warn};

pub(crate) async fn run(ctx: &ProfileContext) -> Result<ProfileResult, PipelineError> {
    let build_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Build);
    let runtime_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Runtime);
    let timeouts = &ctx.build_options.timeouts;
    let env = &ctx.build_options.env;
    let mut timer = StepTimer::new();

    build_log.line(&format!(
        "node-service run {} for {}@{}",
        ctx.run_id, ctx.repo_full_name, ctx.branch
    ));

    if !ctx.local_path.join("package.json").exists() {
        let message = "package.json not found in working tree; is this a Node project?";
        build_log.line(message);
        return Ok(failure(&build_log, &runtime_log, timer, message));
    }

    // Install is a hard step: without dependencies nothing below means
    // anything.
    build_log.line("installing dependencies (npm ci)");
    let install = timer
        .time(
            "install",
            run_with_timeout("npm ci", &ctx.local_path, timeouts.install, env),
        )
        .await?;
    build_log.chunk(&install.combined());
    if install.timed_out {
        let message = format!(
            "Dependency install timed out after {}s",
            timeouts.install.as_secs()
        );
        build_log.line(&message);
        return Ok(failure(&build_log, &runtime_log, timer, &message));
    }
    if !install.success {
        let message = format!("Dependency install failed (exit code {})", exit_label(&install));
        build_log.line(&message);
        return Ok(failure(&build_log, &runtime_log, timer, &message));
    }

    // Build only when the script exists; its failure is soft.
    if manifest_script_exists(&ctx.local_path, "build") {
        build_log.line("running build script");
        let build = timer
            .time(
                "build",
                run_with_timeout("npm run build", &ctx.local_path, timeouts.build, env),
            )
            .await?;
        build_log.chunk(&build.combined());
        if !build.success {
            warn!(repo = %ctx.repo_full_name, "build script failed, continuing to tests");
            build_log.line("build step failed; continuing (soft failure)");
        }
    } else {
        build_log.line("no build script, skipping build step");
    }

    build_log.line("running tests (npm test)");
    let test = timer
        .time(
            "test",
            run_with_timeout("npm test", &ctx.local_path, timeouts.test, env),
        )
        .await?;
    build_log.chunk(&test.combined());
    runtime_log.chunk(&test.combined());

    if test.timed_out {
        let message = format!("Tests failed (timed out after {}s)", timeouts.test.as_secs());
        build_log.line(&message);
        return Ok(failure(&build_log, &runtime_log, timer, &message));
    }
    if !test.success {
        let message = format!("Tests failed (exit code {})", exit_label(&test));
        build_log.line(&message);
        return Ok(failure(&build_log, &runtime_log, timer, &message));
    }

    info!(repo = %ctx.repo_full_name, "node-service run passed");
    build_log.line("all steps passed");
    Ok(ProfileResult {
        status: ProfileStatus::Success,
        screenshot_path: None,
        build_log_path: build_log.path().to_path_buf(),
        runtime_log_path: Some(runtime_log.path().to_path_buf()),
        network_log_path: None,
        error_message: None,
        durations: timer.into_durations(),
        diff_result: None,
    })
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
    use cvr_common::BuildOptions;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Shim `npm` on PATH: `ci` and `run build` succeed, `test` behaves per
    /// the TEST_EXIT file in the working tree.
    fn install_npm_shim(dir: &Path) -> String {
        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let shim = bin.join("npm");
        std::fs::write(
            &shim,
            "#!/bin/bash\n\
             case \"$1\" in\n\
               ci) echo 'added 120 packages'; exit 0 ;;\n\
               run) echo 'build ok'; exit 0 ;;\n\
               test) echo 'running suite'; echo '1 failing' 1>&2; exit $(cat TEST_EXIT) ;;\n\
               *) exit 0 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();
        format!("{}:/usr/bin:/bin", bin.display())
    }

    fn context_with_shim(tmp: &Path, test_exit: u32) -> ProfileContext {
        let tree = tmp.join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(
            tree.join("package.json"),
            r#"{"scripts": {"build": "tsc", "test": "node test.js"}}"#,
        )
        .unwrap();
        std::fs::write(tree.join("TEST_EXIT"), test_exit.to_string()).unwrap();

        let path = install_npm_shim(tmp);
        let mut ctx = super::super::tests::test_context(&tree, tmp);
        ctx.build_options = BuildOptions {
            env: vec![("PATH".to_string(), path)],
            ..BuildOptions::default()
        };
        ctx
    }

    #[tokio::test]
    async fn failing_tests_produce_failure_with_populated_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with_shim(tmp.path(), 1);

        let result = run(&ctx).await.unwrap();
        assert_eq!(result.status, ProfileStatus::Failure);
        let message = result.error_message.as_deref().unwrap();
        assert!(message.contains("Tests failed"), "got: {message}");

        let build_log = std::fs::read_to_string(&result.build_log_path).unwrap();
        assert!(build_log.contains("running suite"));
        let runtime_log =
            std::fs::read_to_string(result.runtime_log_path.as_ref().unwrap()).unwrap();
        assert!(runtime_log.contains("running suite"));
    }

    #[tokio::test]
    async fn passing_tests_produce_success_with_step_durations() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context_with_shim(tmp.path(), 0);

        let result = run(&ctx).await.unwrap();
        assert_eq!(result.status, ProfileStatus::Success);
        assert!(result.error_message.is_none());
        let steps: Vec<&str> = result.durations.iter().map(|d| d.step.as_str()).collect();
        assert_eq!(steps, vec!["install", "build", "test"]);
    }

    #[tokio::test]
    async fn missing_manifest_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("empty");
        std::fs::create_dir_all(&tree).unwrap();
        let ctx = super::super::tests::test_context(&tree, tmp.path());

        let result = run(&ctx).await.unwrap();
        assert_eq!(result.status, ProfileStatus::Failure);
        assert!(
            result
                .error_message
                .as_deref()
                .unwrap()
                .contains("package.json")
        );
    }
}
