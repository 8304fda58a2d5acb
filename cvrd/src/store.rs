//! Repository configuration and run-history store.
//!
//! The pipeline consumes the narrow [`ConfigStore`] contract; ownership of
//! the data (pause flags, registry membership, cross-restart durability)
//! belongs to whoever implements it. [`FileStore`] is the daemon's
//! implementation: an in-memory map with best-effort JSON persistence and a
//! ring-bounded run history per repository. A crash mid-run leaves a
//! `running` record stale; reconciling that is the store owner's concern,
//! not the pipeline's.

use cvr_common::{ProfileKind, RepoConfig, RunRecord, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Maximum run records retained per repository.
const MAX_RUNS_PER_REPO: usize = 50;

/// Narrow contract between the pipeline and the configuration owner.
pub trait ConfigStore: Send + Sync {
    fn get_repo_config(&self, name: &str) -> Option<RepoConfig>;

    /// Apply a patch to a repo's config. Returns `false` when the repo is
    /// unknown.
    fn update_repo_config(&self, name: &str, patch: &dyn Fn(&mut RepoConfig)) -> bool;

    /// Most recent successful run for `name`+`branch` that produced a
    /// screenshot, excluding `excluding_run_id`. This is the diff baseline.
    fn previous_successful_run(
        &self,
        name: &str,
        branch: &str,
        excluding_run_id: &str,
    ) -> Option<RunRecord>;

    fn is_repo_paused(&self, name: &str) -> bool;

    /// Append a freshly started run record (ring-bounded).
    fn record_run_started(&self, name: &str, record: RunRecord);

    /// Patch the record with `run_id` in place (status, artifacts, error).
    fn finalize_run(&self, name: &str, run_id: &str, patch: &dyn Fn(&mut RunRecord));

    fn all_repos(&self) -> Vec<RepoConfig>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    repos: BTreeMap<String, RepoConfig>,
    #[serde(default)]
    paused: HashSet<String>,
}

/// Seed file for the repo registry (TOML).
#[derive(Debug, Default, Deserialize)]
pub struct RepoRegistry {
    #[serde(default)]
    pub repos: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RegistryEntry {
    pub repo_full_name: String,
    pub profile: ProfileKind,
    #[serde(default)]
    pub dev_port: Option<u16>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub paused: bool,
}

fn default_enabled() -> bool {
    true
}

/// JSON-file-backed store with in-memory reads.
pub struct FileStore {
    state: RwLock<PersistedState>,
    path: Option<PathBuf>,
}

impl FileStore {
    /// In-memory only store (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(PersistedState::default()),
            path: None,
        }
    }

    /// Load state from `path`, or start fresh when the file is absent or
    /// unreadable.
    pub fn load_or_create(path: PathBuf) -> Self {
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PersistedState>(&content) {
                Ok(state) => {
                    info!(path = %path.display(), repos = state.repos.len(), "loaded store state");
                    state
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "store state unreadable, starting fresh");
                    PersistedState::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "creating new store state");
                PersistedState::default()
            }
        };
        Self {
            state: RwLock::new(state),
            path: Some(path),
        }
    }

    /// Merge registry entries, keeping run history of already-known repos.
    pub fn seed_from_registry(&self, registry: RepoRegistry) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            for entry in registry.repos {
                if entry.paused {
                    state.paused.insert(entry.repo_full_name.clone());
                } else {
                    state.paused.remove(&entry.repo_full_name);
                }
                let config = state
                    .repos
                    .entry(entry.repo_full_name.clone())
                    .or_insert_with(|| {
                        RepoConfig::new(entry.repo_full_name.clone(), entry.profile)
                    });
                config.profile = entry.profile;
                config.enabled = entry.enabled;
                config.dev_port = entry.dev_port;
            }
        }
        self.persist();
    }

    pub fn insert_repo(&self, config: RepoConfig) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.repos.insert(config.repo_full_name.clone(), config);
        }
        self.persist();
    }

    pub fn set_paused(&self, name: &str, paused: bool) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if paused {
                state.paused.insert(name.to_string());
            } else {
                state.paused.remove(name);
            }
        }
        self.persist();
    }

    /// Best-effort snapshot to disk; failures are logged, never propagated.
    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let serialized = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string_pretty(&*state)
        };
        match serialized {
            Ok(json) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(err) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %err, "failed to persist store state");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize store state"),
        }
    }
}

impl ConfigStore for FileStore {
    fn get_repo_config(&self, name: &str) -> Option<RepoConfig> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .get(name)
            .cloned()
    }

    fn update_repo_config(&self, name: &str, patch: &dyn Fn(&mut RepoConfig)) -> bool {
        let updated = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            match state.repos.get_mut(name) {
                Some(config) => {
                    patch(config);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist();
        }
        updated
    }

    fn previous_successful_run(
        &self,
        name: &str,
        branch: &str,
        excluding_run_id: &str,
    ) -> Option<RunRecord> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .get(name)?
            .last_runs
            .iter()
            .rev()
            .find(|run| {
                run.branch == branch
                    && run.run_id != excluding_run_id
                    && run.status == RunStatus::Success
                    && run.screenshot_path.is_some()
            })
            .cloned()
    }

    fn is_repo_paused(&self, name: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .paused
            .contains(name)
    }

    fn record_run_started(&self, name: &str, record: RunRecord) {
        let recorded = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            match state.repos.get_mut(name) {
                Some(config) => {
                    config.last_runs.push(record);
                    let excess = config.last_runs.len().saturating_sub(MAX_RUNS_PER_REPO);
                    if excess > 0 {
                        config.last_runs.drain(..excess);
                    }
                    true
                }
                None => false,
            }
        };
        if recorded {
            self.persist();
        } else {
            debug!(repo = name, "dropping run record for unknown repo");
        }
    }

    fn finalize_run(&self, name: &str, run_id: &str, patch: &dyn Fn(&mut RunRecord)) {
        let finalized = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state
                .repos
                .get_mut(name)
                .and_then(|config| {
                    config
                        .last_runs
                        .iter_mut()
                        .rev()
                        .find(|run| run.run_id == run_id)
                })
                .map(|run| patch(run))
                .is_some()
        };
        if finalized {
            self.persist();
        } else {
            warn!(repo = name, run_id, "finalize for unknown run record");
        }
    }

    fn all_repos(&self) -> Vec<RepoConfig> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .repos
            .values()
            .cloned()
            .collect()
    }
}
