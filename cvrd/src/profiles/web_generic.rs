//! web-generic profile: install → optional build → dev server → capture.
//!
//! Works for any web project with a dev script: the server is started
//! detached, its port inferred (configured → static → dynamic), readiness
//! probed over HTTP, and the rendered page captured from the screen.
//! Diagnostic steps keep running after soft failures so the result is as
//! informative as possible; the dev server is torn down on every path.

use super::{StepTimer, exit_label, first_success, manifest_script_exists, BoxedStrategy,
    StrategyOutcome};
use crate::ports::{self, PortConfidence};
use crate::screenshot;
use cvr_common::{
    LogKind, PipelineError, ProcessHandle, ProfileContext, ProfileResult, ProfileStatus,
    RunLogger, run_with_timeout, spawn_long_running,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

const GENERIC_DEV_PORT: u16 = 3000;

pub(crate) async fn run(ctx: &ProfileContext) -> Result<ProfileResult, PipelineError> {
    let build_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Build);
    let runtime_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Runtime);
    let network_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Network);
    let timeouts = &ctx.build_options.timeouts;
    let env = &ctx.build_options.env;
    let mut timer = StepTimer::new();

    build_log.line(&format!(
        "web-generic run {} for {}@{}",
        ctx.run_id, ctx.repo_full_name, ctx.branch
    ));

    if !ctx.local_path.join("package.json").exists() {
        let message = "package.json not found in working tree; is this a web project?";
        build_log.line(message);
        return Ok(result(
            ProfileStatus::Failure,
            Some(message),
            None,
            &build_log,
            &runtime_log,
            &network_log,
            timer,
        ));
    }

    build_log.line("installing dependencies");
    let install = timer
        .time(
            "install",
            run_with_timeout(install_command(ctx), &ctx.local_path, timeouts.install, env),
        )
        .await?;
    build_log.chunk(&install.combined());
    if !install.success {
        let message = format!("Dependency install failed (exit code {})", exit_label(&install));
        build_log.line(&message);
        return Ok(result(
            ProfileStatus::Failure,
            Some(&message),
            None,
            &build_log,
            &runtime_log,
            &network_log,
            timer,
        ));
    }

    if manifest_script_exists(&ctx.local_path, "build") {
        let build = timer
            .time(
                "build",
                run_with_timeout("npm run build", &ctx.local_path, timeouts.build, env),
            )
            .await?;
        build_log.chunk(&build.combined());
        if !build.success {
            build_log.line("build step failed; continuing (soft failure)");
        }
    }

    let dev_command = ctx
        .build_options
        .dev_command
        .clone()
        .unwrap_or_else(|| "npm run dev".to_string());

    // Port: configured pin beats static inference; dynamic detection is
    // the expensive fallback when static inference is only a guess.
    let port = match ctx.dev_port {
        Some(port) => port,
        None => match ports::detect_port_static(&ctx.local_path) {
            Some(guess) if guess.confidence != PortConfidence::Fallback => guess.port,
            guess => {
                match ports::detect_port_dynamically(&ctx.local_path, &dev_command, timeouts.dev_ready)
                    .await
                {
                    Some(port) => port,
                    None => guess.map(|g| g.port).unwrap_or(GENERIC_DEV_PORT),
                }
            }
        },
    };
    build_log.line(&format!("dev server port: {port}"));
    ports::free_port(port).await;

    let mut handle = spawn_long_running(&dev_command, &ctx.local_path, env)?;
    let ready = timer
        .time(
            "dev-ready",
            wait_http_ready(&mut handle, port, timeouts.dev_ready, &runtime_log, &network_log),
        )
        .await;

    let mut soft_failure = None;
    if !ready {
        let message = format!(
            "Dev server did not respond on port {port} within {}s",
            timeouts.dev_ready.as_secs()
        );
        warn!(repo = %ctx.repo_full_name, port, "dev server never became ready");
        build_log.line(&message);
        soft_failure = Some(message);
    }

    sleep(timeouts.render_delay).await;

    let screenshot_path = timer
        .time("screenshot", capture(ctx, &build_log))
        .await;

    handle.kill().await;

    let status = if soft_failure.is_none() {
        ProfileStatus::Success
    } else {
        ProfileStatus::Failure
    };
    if status == ProfileStatus::Success {
        info!(repo = %ctx.repo_full_name, port, "web-generic run passed");
    }
    Ok(result(
        status,
        soft_failure.as_deref(),
        screenshot_path,
        &build_log,
        &runtime_log,
        &network_log,
        timer,
    ))
}

fn install_command(ctx: &ProfileContext) -> &'static str {
    if ctx.local_path.join("package-lock.json").exists() {
        "npm ci"
    } else {
        "npm install"
    }
}

/// Poll the dev server over HTTP while draining its output into the
/// runtime log. Probe results land in the network log.
async fn wait_http_ready(
    handle: &mut ProcessHandle,
    port: u16,
    deadline: Duration,
    runtime_log: &RunLogger,
    network_log: &RunLogger,
) -> bool {
    let expires = Instant::now() + deadline;
    let url = format!("http://localhost:{port}/");
    let mut next_probe = Instant::now();

    loop {
        if Instant::now() >= expires {
            return false;
        }

        // Drain output for a short window so the log stays live.
        match timeout(Duration::from_millis(250), handle.next_line()).await {
            Ok(Some(line)) => {
                runtime_log.line(&line.line);
                continue;
            }
            Ok(None) => {
                if !handle.is_running() {
                    runtime_log.line("dev process exited before becoming ready");
                    return false;
                }
            }
            Err(_) => {}
        }

        if Instant::now() >= next_probe {
            next_probe = Instant::now() + Duration::from_secs(2);
            let probe = run_with_timeout(
                &format!("curl -s -o /dev/null -w '%{{http_code}}' '{url}'"),
                &std::env::temp_dir(),
                Duration::from_secs(5),
                &[],
            )
            .await;
            if let Ok(probe) = probe {
                let code = probe.stdout.trim().to_string();
                network_log.line(&format!("GET {url} -> {code}"));
                if probe.success && code.starts_with('2') {
                    return true;
                }
            }
        }
    }
}

/// Capture chain: application window by repo name, then the whole screen.
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

    match first_success("page-capture", strategies).await {
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

#[allow(clippy::too_many_arguments)]
fn result(
    status: ProfileStatus,
    error_message: Option<&str>,
    screenshot_path: Option<PathBuf>,
    build_log: &RunLogger,
    runtime_log: &RunLogger,
    network_log: &RunLogger,
    timer: StepTimer,
) -> ProfileResult {
    ProfileResult {
        status,
        screenshot_path,
        build_log_path: build_log.path().to_path_buf(),
        runtime_log_path: Some(runtime_log.path().to_path_buf()),
        network_log_path: Some(network_log.path().to_path_buf()),
        error_message: error_message.map(String::from),
        durations: timer.into_durations(),
        diff_result: None,
    }
}
