//! Unix-socket admission API.
//!
//! JSON-line requests, one response line per request. This is the narrow
//! carrier for external collaborators: the webhook layer calls `trigger`,
//! operators call `reset_repo`, dashboards call `status`. Signature
//! verification and HTTP transport live outside the daemon.

use crate::DaemonContext;
use crate::pipeline::AdmissionDecision;
use crate::queue::QueueSnapshotEntry;
use cvr_common::{BuildJob, Trigger};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Admit a build job (fire-and-forget from the caller's view).
    Trigger {
        repo_full_name: String,
        branch: String,
        #[serde(default)]
        trigger: Option<Trigger>,
        #[serde(default)]
        commit_message: Option<String>,
        #[serde(default)]
        commit_author: Option<String>,
    },
    /// Daemon and queue status.
    Status,
    /// Operator escape hatch: force the working tree back to the default
    /// branch tip.
    ResetRepo { repo_full_name: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApiResponse {
    Queued {
        repo_full_name: String,
        branch: String,
    },
    /// Acknowledged and dropped: not an error.
    Dropped { reason: String },
    Status {
        version: String,
        pid: u32,
        uptime_secs: u64,
        repos: usize,
        active: Vec<QueueSnapshotEntry>,
    },
    Reset {
        repo_full_name: String,
        branch: String,
    },
    Error { message: String },
}

pub async fn handle_connection(stream: UnixStream, ctx: DaemonContext) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ApiRequest>(&line) {
            Ok(request) => handle_request(request, &ctx).await,
            Err(err) => ApiResponse::Error {
                message: format!("invalid request: {err}"),
            },
        };
        let mut serialized = serde_json::to_string(&response)?;
        serialized.push('\n');
        write_half.write_all(serialized.as_bytes()).await?;
    }
    Ok(())
}

async fn handle_request(request: ApiRequest, ctx: &DaemonContext) -> ApiResponse {
    match request {
        ApiRequest::Trigger {
            repo_full_name,
            branch,
            trigger,
            commit_message,
            commit_author,
        } => match ctx.pipeline.admit(&repo_full_name) {
            AdmissionDecision::Admitted => {
                let mut job = BuildJob::new(&repo_full_name, &branch);
                job.trigger = trigger.unwrap_or(Trigger::Push);
                job.commit_message = commit_message;
                job.commit_author = commit_author;
                ctx.queue.enqueue(job);
                ApiResponse::Queued {
                    repo_full_name,
                    branch,
                }
            }
            decision => {
                info!(repo = %repo_full_name, %decision, "trigger acknowledged and dropped");
                ApiResponse::Dropped {
                    reason: decision.to_string(),
                }
            }
        },
        ApiRequest::Status => ApiResponse::Status {
            version: ctx.version.to_string(),
            pid: ctx.pid,
            uptime_secs: ctx.started_at.elapsed().as_secs(),
            repos: ctx.pipeline.store().all_repos().len(),
            active: ctx.queue.snapshot(),
        },
        ApiRequest::ResetRepo { repo_full_name } => {
            let local_path = ctx
                .pipeline
                .store()
                .get_repo_config(&repo_full_name)
                .and_then(|config| config.local_path)
                .filter(|path| path.join(".git").exists());
            match local_path {
                Some(path) => match ctx.pipeline.synchronizer().reset_to_main(&path).await {
                    Ok(branch) => ApiResponse::Reset {
                        repo_full_name,
                        branch,
                    },
                    Err(err) => ApiResponse::Error {
                        message: err.to_string(),
                    },
                },
                None => ApiResponse::Error {
                    message: format!("no working tree for {repo_full_name}"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::pipeline::Pipeline;
    use crate::queue::BuildQueue;
    use crate::store::{ConfigStore, FileStore};
    use cvr_common::{PipelineConfig, ProfileKind, RepoConfig};
    use std::sync::Arc;
    use std::time::Instant;

    fn context(tmp: &std::path::Path) -> DaemonContext {
        let store = Arc::new(FileStore::in_memory());
        store.insert_repo(RepoConfig::new("acme/known", ProfileKind::Custom));
        store.insert_repo(RepoConfig::new("acme/paused", ProfileKind::Custom));
        store.set_paused("acme/paused", true);

        let config = PipelineConfig {
            clone_base_dir: tmp.join("repos"),
            logs_dir: tmp.join("logs"),
            screenshots_dir: tmp.join("screenshots"),
            cache_dir: tmp.join("cache"),
            ..PipelineConfig::default()
        };
        let events = EventBus::default();
        let pipeline = Pipeline::new(config, store as Arc<dyn ConfigStore>, events.clone());
        let queue = BuildQueue::new(Arc::new(pipeline.clone()), 1, events);
        DaemonContext {
            queue,
            pipeline,
            started_at: Instant::now(),
            version: "test",
            pid: std::process::id(),
        }
    }

    #[tokio::test]
    async fn unknown_repo_trigger_is_acknowledged_and_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());

        let response = handle_request(
            ApiRequest::Trigger {
                repo_full_name: "acme/mystery".to_string(),
                branch: "main".to_string(),
                trigger: None,
                commit_message: None,
                commit_author: None,
            },
            &ctx,
        )
        .await;

        match response {
            ApiResponse::Dropped { reason } => assert!(reason.contains("unknown")),
            other => panic!("expected Dropped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn paused_repo_trigger_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());

        let response = handle_request(
            ApiRequest::Trigger {
                repo_full_name: "acme/paused".to_string(),
                branch: "main".to_string(),
                trigger: None,
                commit_message: None,
                commit_author: None,
            },
            &ctx,
        )
        .await;

        assert!(matches!(response, ApiResponse::Dropped { reason } if reason.contains("paused")));
    }

    #[tokio::test]
    async fn status_reports_repo_count() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());

        let response = handle_request(ApiRequest::Status, &ctx).await;
        match response {
            ApiResponse::Status { repos, .. } => assert_eq!(repos, 2),
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_without_working_tree_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());

        let response = handle_request(
            ApiRequest::ResetRepo {
                repo_full_name: "acme/known".to_string(),
            },
            &ctx,
        )
        .await;
        assert!(matches!(response, ApiResponse::Error { .. }));
    }

    #[test]
    fn trigger_request_parses_from_webhook_shape() {
        let request: ApiRequest = serde_json::from_str(
            r#"{"command": "trigger", "repo_full_name": "acme/app", "branch": "feature-x",
                "commit_message": "fix", "commit_author": "dev"}"#,
        )
        .unwrap();
        assert!(matches!(request, ApiRequest::Trigger { .. }));
    }
}
