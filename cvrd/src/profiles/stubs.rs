//! Placeholder profiles.
//!
//! These write a descriptive log of the intended steps and
//! deterministically return failure with a fixed not-implemented message.
//! Callers treat that status exactly like any other failure.

use cvr_common::{
    LogKind, PipelineError, ProfileContext, ProfileKind, ProfileResult, ProfileStatus, RunLogger,
};

async fn run_stub(
    ctx: &ProfileContext,
    kind: ProfileKind,
    intended_steps: &[&str],
) -> Result<ProfileResult, PipelineError> {
    let build_log = RunLogger::create(&ctx.logs_dir, &ctx.run_id, LogKind::Build);
    build_log.line(&format!(
        "{kind} run {} for {}@{}",
        ctx.run_id, ctx.repo_full_name, ctx.branch
    ));
    build_log.line(&format!("the {kind} profile is a placeholder; intended steps:"));
    for step in intended_steps {
        build_log.line(&format!("  - {step}"));
    }

    let message = PipelineError::NotImplemented {
        profile: kind.to_string(),
    }
    .to_string();
    build_log.line(&message);

    Ok(ProfileResult {
        status: ProfileStatus::Failure,
        screenshot_path: None,
        build_log_path: build_log.path().to_path_buf(),
        runtime_log_path: None,
        network_log_path: None,
        error_message: Some(message),
        durations: Vec::new(),
        diff_result: None,
    })
}

pub(crate) async fn run_android_capacitor(
    ctx: &ProfileContext,
) -> Result<ProfileResult, PipelineError> {
    run_stub(
        ctx,
        ProfileKind::AndroidCapacitor,
        &[
            "verify the android platform folder exists",
            "install dependencies and run `npx cap sync android`",
            "boot an emulator and wait for the device",
            "install and launch the debug apk",
            "capture a screenshot via adb",
        ],
    )
    .await
}

pub(crate) async fn run_custom(ctx: &ProfileContext) -> Result<ProfileResult, PipelineError> {
    run_stub(
        ctx,
        ProfileKind::Custom,
        &[
            "read the custom command list from the repository config",
            "execute each command under the process supervisor",
            "collect declared artifacts and logs",
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stubs_fail_deterministically_with_fixed_message() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = super::super::tests::test_context(tmp.path(), tmp.path());

        let android = run_android_capacitor(&ctx).await.unwrap();
        assert_eq!(android.status, ProfileStatus::Failure);
        assert_eq!(
            android.error_message.as_deref(),
            Some("profile android-capacitor is not implemented")
        );

        let custom = run_custom(&ctx).await.unwrap();
        assert_eq!(
            custom.error_message.as_deref(),
            Some("profile custom is not implemented")
        );
    }

    #[tokio::test]
    async fn stub_writes_descriptive_log() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = super::super::tests::test_context(tmp.path(), tmp.path());

        let result = run_android_capacitor(&ctx).await.unwrap();
        let log = std::fs::read_to_string(&result.build_log_path).unwrap();
        assert!(log.contains("placeholder"));
        assert!(log.contains("emulator"));
    }
}
