//! Build queue: admission, per-key serialization, bounded dispatch.
//!
//! Jobs are keyed by `(repo_full_name, branch)`. Two jobs sharing a key
//! never execute concurrently — this is what guarantees the repository
//! synchronizer's working tree is never touched by overlapping operations.
//! A job enqueued while its key is busy is held; holding at most one
//! pending job per key with most-recent-wins replacement is sufficient
//! because only the latest commit state matters. Across keys, execution is
//! bounded by a configurable worker limit.

use crate::events::{EventBus, RunQueuedEvent};
use cvr_common::{BuildJob, JobKey};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub type BoxedJobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Executes one admitted job to completion. Implementations must not
/// panic the queue: failures are their own result's concern.
pub trait JobRunner: Send + Sync + 'static {
    fn run_job(&self, job: BuildJob) -> BoxedJobFuture;
}

#[derive(Default)]
struct KeyState {
    /// Most recently enqueued job waiting for the in-flight run to finish.
    pending: Option<BuildJob>,
}

/// Queue status snapshot for the admission API.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshotEntry {
    pub repo_full_name: String,
    pub branch: String,
    pub has_pending: bool,
}

/// The build queue. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct BuildQueue {
    runner: Arc<dyn JobRunner>,
    slots: Arc<Semaphore>,
    states: Arc<Mutex<HashMap<JobKey, KeyState>>>,
    events: EventBus,
}

impl BuildQueue {
    pub fn new(runner: Arc<dyn JobRunner>, max_concurrent: usize, events: EventBus) -> Self {
        Self {
            runner,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            states: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Fire-and-forget admission. Within one key, runs execute strictly in
    /// submission order; a queued-but-not-started job is replaced by a
    /// newer one for the same key.
    pub fn enqueue(&self, job: BuildJob) {
        let key = job.key();
        self.events.emit(
            "run_queued",
            &RunQueuedEvent {
                repo_full_name: job.repo_full_name.clone(),
                branch: job.branch.clone(),
                trigger: job.trigger,
            },
        );

        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(&key) {
                if let Some(replaced) = state.pending.replace(job) {
                    debug!(key = %key, "coalesced queued job, newest wins");
                    self.events.emit(
                        "run_coalesced",
                        &RunQueuedEvent {
                            repo_full_name: replaced.repo_full_name,
                            branch: replaced.branch,
                            trigger: replaced.trigger,
                        },
                    );
                }
                return;
            }
            states.insert(key.clone(), KeyState::default());
        }

        let queue = self.clone();
        tokio::spawn(async move { queue.drive(key, job).await });
    }

    /// Per-key worker: run the current job, then whatever coalesced in
    /// behind it, then retire the key.
    async fn drive(self, key: JobKey, first: BuildJob) {
        let mut job = first;
        loop {
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                warn!(key = %key, "queue slots closed, abandoning key");
                return;
            };
            debug!(key = %key, "dispatching job");
            self.runner.run_job(job).await;
            drop(permit);

            let next = {
                let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
                match states.get_mut(&key).and_then(|state| state.pending.take()) {
                    Some(next) => Some(next),
                    None => {
                        states.remove(&key);
                        None
                    }
                }
            };
            match next {
                Some(next) => job = next,
                None => return,
            }
        }
    }

    /// Keys currently owned by a worker (in-flight or with a pending job).
    pub fn snapshot(&self) -> Vec<QueueSnapshotEntry> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .iter()
            .map(|(key, state)| QueueSnapshotEntry {
                repo_full_name: key.repo_full_name.clone(),
                branch: key.branch.clone(),
                has_pending: state.pending.is_some(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    struct Span {
        label: String,
        start: Instant,
        end: Instant,
    }

    struct TestRunner {
        spans: Arc<Mutex<Vec<Span>>>,
        hold: Duration,
    }

    impl JobRunner for TestRunner {
        fn run_job(&self, job: BuildJob) -> BoxedJobFuture {
            let spans = Arc::clone(&self.spans);
            let hold = self.hold;
            Box::pin(async move {
                let start = Instant::now();
                tokio::time::sleep(hold).await;
                let label = job.commit_message.unwrap_or_else(|| job.branch.clone());
                spans
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(Span {
                        label,
                        start,
                        end: Instant::now(),
                    });
            })
        }
    }

    fn labelled_job(repo: &str, branch: &str, label: &str) -> BuildJob {
        let mut job = BuildJob::new(repo, branch);
        job.commit_message = Some(label.to_string());
        job
    }

    async fn wait_for_spans(spans: &Arc<Mutex<Vec<Span>>>, count: usize) -> Vec<Span> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            {
                let spans = spans.lock().unwrap_or_else(|e| e.into_inner());
                if spans.len() >= count {
                    return spans.clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for {count} runs");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn overlapping(a: &Span, b: &Span) -> bool {
        a.start < b.end && b.start < a.end
    }

    #[tokio::test]
    async fn same_key_jobs_never_overlap() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(TestRunner {
            spans: Arc::clone(&spans),
            hold: Duration::from_millis(80),
        });
        let queue = BuildQueue::new(runner, 4, EventBus::default());

        queue.enqueue(labelled_job("acme/app", "main", "first"));
        queue.enqueue(labelled_job("acme/app", "main", "second"));

        let spans = wait_for_spans(&spans, 2).await;
        assert!(!overlapping(&spans[0], &spans[1]));
        assert_eq!(spans[0].label, "first");
        assert_eq!(spans[1].label, "second");
    }

    #[tokio::test]
    async fn distinct_keys_overlap_within_worker_limit() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(TestRunner {
            spans: Arc::clone(&spans),
            hold: Duration::from_millis(150),
        });
        let queue = BuildQueue::new(runner, 4, EventBus::default());

        queue.enqueue(labelled_job("acme/app", "main", "a"));
        queue.enqueue(labelled_job("acme/other", "main", "b"));

        let spans = wait_for_spans(&spans, 2).await;
        assert!(overlapping(&spans[0], &spans[1]));
    }

    #[tokio::test]
    async fn worker_limit_of_one_serializes_distinct_keys() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(TestRunner {
            spans: Arc::clone(&spans),
            hold: Duration::from_millis(60),
        });
        let queue = BuildQueue::new(runner, 1, EventBus::default());

        queue.enqueue(labelled_job("acme/app", "main", "a"));
        queue.enqueue(labelled_job("acme/other", "main", "b"));

        let spans = wait_for_spans(&spans, 2).await;
        assert!(!overlapping(&spans[0], &spans[1]));
    }

    #[tokio::test]
    async fn queued_jobs_coalesce_most_recent_wins() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(TestRunner {
            spans: Arc::clone(&spans),
            hold: Duration::from_millis(80),
        });
        let queue = BuildQueue::new(runner, 4, EventBus::default());

        queue.enqueue(labelled_job("acme/app", "main", "first"));
        queue.enqueue(labelled_job("acme/app", "main", "stale"));
        queue.enqueue(labelled_job("acme/app", "main", "latest"));

        wait_for_spans(&spans, 2).await;
        // Give any stray third run a chance to appear before asserting.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let spans = spans.lock().unwrap_or_else(|e| e.into_inner());
        let labels: Vec<&str> = spans.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["first", "latest"]);
    }

    #[tokio::test]
    async fn key_retires_after_drain() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let runner = Arc::new(TestRunner {
            spans: Arc::clone(&spans),
            hold: Duration::from_millis(20),
        });
        let queue = BuildQueue::new(runner, 2, EventBus::default());

        queue.enqueue(labelled_job("acme/app", "main", "only"));
        wait_for_spans(&spans, 1).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.snapshot().is_empty() {
            assert!(Instant::now() < deadline, "key never retired");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
