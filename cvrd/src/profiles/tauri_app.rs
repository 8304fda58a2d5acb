//! tauri-app profile: desktop build with cached dependencies, a detached
//! dev process, readiness detection on streamed output, and window capture.
//!
//! The detached dev tree is terminated on every exit path — success,
//! failure, or crash (the supervisor's drop guard backstops panics).

use super::{BoxedStrategy, ProfileToolkit, StepTimer, StrategyOutcome, exit_label,
    first_success};
use crate::ports;
use crate::screenshot;
use cvr_common::{
    LogKind, PipelineError, ProcessHandle, ProfileContext, ProfileResult, ProfileStatus,
    RunLogger, run_with_timeout, spawn_long_running,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

/// Output substrings that mean the dev process is up. Scanned with
/// memchr's substring search since dev servers are chatty.
const READY_PATTERNS: [&str; 6] = [
    "Finished",
    "App listening",
    "Dev server running",
    "Local:",
    "compiled successfully",
    "Webview ready",
];

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
        "tauri-app run {} for {}@{}",
        ctx.run_id, ctx.repo_full_name, ctx.branch
    ));

    if !ctx.local_path.join("src-tauri").exists() {
        let message = "src-tauri folder missing; not a Tauri project";
        build_log.line(message);
        return Ok(failure(&build_log, &runtime_log, timer, message));
    }

    let cargo = run_with_timeout("cargo --version", &ctx.local_path, Duration::from_secs(10), env)
        .await?;
    if !cargo.success {
        return Err(PipelineError::tool_unavailable(
            "cargo",
            "install the Rust toolchain (https://rustup.rs) on the runner host",
        ));
    }

    // Dependency install behind the per-repo cache: restore when the
    // lockfile is unchanged, otherwise install and refresh the snapshot.
    if ctx.local_path.join("package.json").exists() {
        let restored = timer
            .time(
                "cache-restore",
                toolkit
                    .dep_cache
                    .restore(&ctx.repo_full_name, &ctx.local_path, timeouts.install),
            )
            .await;
        if restored {
            build_log.line("dependency cache restored");
        } else {
            build_log.line("dependency cache miss, installing");
            let install = timer
                .time(
                    "install",
                    run_with_timeout("npm install", &ctx.local_path, timeouts.install, env),
                )
                .await?;
            build_log.chunk(&install.combined());
            if !install.success {
                let message =
                    format!("Dependency install failed (exit code {})", exit_label(&install));
                build_log.line(&message);
                return Ok(failure(&build_log, &runtime_log, timer, &message));
            }
            if timer
                .time(
                    "cache-populate",
                    toolkit
                        .dep_cache
                        .populate(&ctx.repo_full_name, &ctx.local_path, timeouts.install),
                )
                .await
            {
                build_log.line("dependency cache refreshed");
            }
        }
    }

    if let Some(guess) = ports::detect_port_static(&ctx.local_path) {
        ports::free_port(guess.port).await;
    }

    let dev_command = ctx.build_options.dev_command.clone().unwrap_or_else(|| {
        if ctx.local_path.join("package.json").exists() {
            "npm run tauri dev".to_string()
        } else {
            "cargo tauri dev".to_string()
        }
    });
    build_log.line(&format!("starting dev process: {dev_command}"));

    let mut handle = spawn_long_running(&dev_command, &ctx.local_path, env)?;

    let readiness = timer
        .time(
            "dev-ready",
            watch_until_ready(&mut handle, timeouts.dev_ready, &build_log, &runtime_log),
        )
        .await;

    match readiness {
        Readiness::ExitedEarly(detail) => {
            handle.kill().await;
            let message = format!("Dev process exited before becoming ready ({detail})");
            build_log.line(&message);
            return Ok(failure(&build_log, &runtime_log, timer, &message));
        }
        Readiness::TimedOut => {
            warn!(repo = %ctx.repo_full_name, "readiness patterns never matched, capturing anyway");
            build_log.line("readiness timeout; continuing to capture (soft failure)");
        }
        Readiness::Ready => {}
    }

    sleep(timeouts.render_delay).await;

    let screenshot_path = timer
        .time("screenshot", capture(ctx, &build_log))
        .await;

    handle.kill().await;

    match screenshot_path {
        Some(path) => {
            info!(repo = %ctx.repo_full_name, "tauri-app run captured the app window");
            Ok(ProfileResult {
                status: ProfileStatus::Success,
                screenshot_path: Some(path),
                build_log_path: build_log.path().to_path_buf(),
                runtime_log_path: Some(runtime_log.path().to_path_buf()),
                network_log_path: None,
                error_message: None,
                durations: timer.into_durations(),
                diff_result: None,
            })
        }
        None => {
            let message = "Could not capture the application window or screen";
            build_log.line(message);
            Ok(failure(&build_log, &runtime_log, timer, message))
        }
    }
}

enum Readiness {
    Ready,
    TimedOut,
    ExitedEarly(String),
}

fn is_ready_line(line: &str) -> bool {
    READY_PATTERNS
        .iter()
        .any(|pattern| memchr::memmem::find(line.as_bytes(), pattern.as_bytes()).is_some())
}

/// Tee dev output into both logs while racing the ready patterns against
/// the deadline.
async fn watch_until_ready(
    handle: &mut ProcessHandle,
    deadline: Duration,
    build_log: &RunLogger,
    runtime_log: &RunLogger,
) -> Readiness {
    let expires = Instant::now() + deadline;
    loop {
        let Some(remaining) = expires.checked_duration_since(Instant::now()) else {
            return Readiness::TimedOut;
        };
        match timeout(remaining, handle.next_line()).await {
            Ok(Some(line)) => {
                build_log.line(&line.line);
                runtime_log.line(&line.line);
                if is_ready_line(&line.line) {
                    return Readiness::Ready;
                }
            }
            Ok(None) => {
                let status = handle.wait_for_exit(Duration::from_secs(5)).await;
                let detail = match status.and_then(|s| s.code()) {
                    Some(code) => format!("exit code {code}"),
                    None => "killed or unknown exit".to_string(),
                };
                return Readiness::ExitedEarly(detail);
            }
            Err(_) => return Readiness::TimedOut,
        }
    }
}

/// Window-by-name capture with full-screen fallback.
async fn capture(ctx: &ProfileContext, build_log: &RunLogger) -> Option<PathBuf> {
    if let Err(err) = std::fs::create_dir_all(&ctx.screenshots_dir) {
        warn!(error = %err, "screenshots directory unavailable");
        return None;
    }
    let out = ctx.screenshots_dir.join(format!("{}.png", ctx.run_id));
    let deadline = ctx.build_options.timeouts.screenshot;
    let app_name = ctx
        .build_options
        .app_name
        .clone()
        .unwrap_or_else(|| ctx.repo_short_name().to_string());

    let strategies: Vec<BoxedStrategy<()>> = vec![
        ("window", {
            let out = out.clone();
            Box::pin(async move {
                match screenshot::capture_window_by_name(&app_name, &out, deadline).await {
                    Ok(()) => StrategyOutcome::Success(()),
                    Err(err) => StrategyOutcome::SoftFail(err.to_string()),
                }
            })
        }),
        ("full-screen", {
            let out = out.clone();
            Box::pin(async move {
                match screenshot::capture_full_screen(&out, deadline).await {
                    Ok(()) => StrategyOutcome::Success(()),
                    Err(err) => StrategyOutcome::SoftFail(err.to_string()),
                }
            })
        }),
    ];

    match first_success("window-capture", strategies).await {
        Ok((method, ())) => {
            build_log.line(&format!("screenshot captured via {method}"));
            Some(out)
        }
        Err(message) => {
            build_log.line(&format!("screenshot unavailable: {message}"));
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
    use cvr_common::BuildOptions;
    use std::sync::Arc;

    fn toolkit(tmp: &std::path::Path) -> ProfileToolkit {
        ProfileToolkit {
            simulators: Arc::new(SimulatorService::default()),
            dep_cache: Arc::new(DependencyCache::new(tmp.join("cache"))),
        }
    }

    fn tauri_tree(tmp: &std::path::Path) -> std::path::PathBuf {
        let tree = tmp.join("tree");
        std::fs::create_dir_all(tree.join("src-tauri")).unwrap();
        tree
    }

    #[test]
    fn ready_patterns_match_typical_dev_output() {
        assert!(is_ready_line("    Finished `dev` profile [unoptimized] target(s)"));
        assert!(is_ready_line("  ➜  Local:   http://localhost:1420/"));
        assert!(is_ready_line("App listening on port 1420"));
        assert!(!is_ready_line("Compiling tauri-app v0.1.0"));
    }

    #[tokio::test]
    async fn missing_native_folder_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        let ctx = super::super::tests::test_context(&tree, tmp.path());

        let result = run(&toolkit(tmp.path()), &ctx).await.unwrap();
        assert_eq!(result.status, ProfileStatus::Failure);
        assert!(result.error_message.as_deref().unwrap().contains("src-tauri"));
    }

    #[tokio::test]
    async fn dev_process_exiting_early_fails_with_exit_detail() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tauri_tree(tmp.path());
        let mut ctx = super::super::tests::test_context(&tree, tmp.path());
        ctx.build_options = BuildOptions {
            dev_command: Some("echo compiling; exit 3".to_string()),
            ..BuildOptions::default()
        };

        let result = run(&toolkit(tmp.path()), &ctx).await.unwrap();
        assert_eq!(result.status, ProfileStatus::Failure);
        let message = result.error_message.as_deref().unwrap();
        assert!(message.contains("exited before becoming ready"), "got: {message}");
        assert!(message.contains('3'), "got: {message}");
    }

    #[tokio::test]
    async fn ready_dev_process_is_torn_down_even_when_capture_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tauri_tree(tmp.path());
        let mut ctx = super::super::tests::test_context(&tree, tmp.path());
        let mut timeouts = ctx.build_options.timeouts.clone();
        timeouts.render_delay = Duration::from_millis(50);
        timeouts.screenshot = Duration::from_secs(5);
        ctx.build_options = BuildOptions {
            dev_command: Some("echo 'Dev server running'; sleep 300".to_string()),
            timeouts,
            ..BuildOptions::default()
        };

        let started = std::time::Instant::now();
        let result = run(&toolkit(tmp.path()), &ctx).await.unwrap();
        // Headless test hosts have no window to capture; the run must fail
        // cleanly and fast, not hang on the sleeping dev process.
        assert!(started.elapsed() < Duration::from_secs(60));
        if result.status == ProfileStatus::Failure {
            assert!(
                result
                    .error_message
                    .as_deref()
                    .unwrap()
                    .contains("capture")
            );
        }
        let steps: Vec<&str> = result.durations.iter().map(|d| d.step.as_str()).collect();
        assert!(steps.contains(&"dev-ready"));
    }
}
