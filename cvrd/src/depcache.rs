//! Per-repository dependency cache.
//!
//! Desktop builds pay a large install cost on every run; this cache keeps
//! a tar snapshot of `node_modules` keyed by repository and lockfile hash,
//! so an unchanged lockfile restores in seconds. Strictly per-repository:
//! no cross-repo sharing. Misses and failures are absorbed and logged —
//! the caller just installs from scratch.

use std::path::{Path, PathBuf};
use std::time::Duration;
use cvr_common::run_with_timeout;
use tracing::{debug, info, warn};

/// Lockfiles consulted for the cache key, most specific first.
const LOCKFILES: [&str; 3] = ["package-lock.json", "npm-shrinkwrap.json", "package.json"];

#[derive(Debug, Clone)]
pub struct DependencyCache {
    cache_dir: PathBuf,
}

impl DependencyCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn sanitize(repo_full_name: &str) -> String {
        repo_full_name.replace('/', "__")
    }

    fn lockfile_hash(local_path: &Path) -> Option<String> {
        for lockfile in LOCKFILES {
            if let Ok(bytes) = std::fs::read(local_path.join(lockfile)) {
                let hex = blake3::hash(&bytes).to_hex();
                return Some(hex.as_str()[..16].to_string());
            }
        }
        None
    }

    fn snapshot_path(&self, repo_full_name: &str, lock_hash: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}-{lock_hash}.tar", Self::sanitize(repo_full_name)))
    }

    /// Restore a cached `node_modules` into the working tree. Returns
    /// whether the restore happened.
    pub async fn restore(
        &self,
        repo_full_name: &str,
        local_path: &Path,
        deadline: Duration,
    ) -> bool {
        let Some(lock_hash) = Self::lockfile_hash(local_path) else {
            debug!(repo = repo_full_name, "no manifest, nothing to restore");
            return false;
        };
        let snapshot = self.snapshot_path(repo_full_name, &lock_hash);
        if !snapshot.exists() {
            debug!(repo = repo_full_name, "dependency cache miss");
            return false;
        }

        let command = format!(
            "tar -xf '{}' -C '{}'",
            snapshot.display(),
            local_path.display()
        );
        match run_with_timeout(&command, local_path, deadline, &[]).await {
            Ok(output) if output.success => {
                info!(repo = repo_full_name, "dependency cache restored");
                true
            }
            Ok(output) => {
                warn!(
                    repo = repo_full_name,
                    exit_code = ?output.exit_code,
                    "dependency cache restore failed, will install from scratch"
                );
                false
            }
            Err(err) => {
                warn!(repo = repo_full_name, error = %err, "dependency cache restore could not run");
                false
            }
        }
    }

    /// Snapshot the working tree's `node_modules` into the cache. Returns
    /// whether a snapshot was written.
    pub async fn populate(
        &self,
        repo_full_name: &str,
        local_path: &Path,
        deadline: Duration,
    ) -> bool {
        if !local_path.join("node_modules").exists() {
            debug!(repo = repo_full_name, "no node_modules to snapshot");
            return false;
        }
        let Some(lock_hash) = Self::lockfile_hash(local_path) else {
            return false;
        };
        if let Err(err) = std::fs::create_dir_all(&self.cache_dir) {
            warn!(error = %err, "could not create cache directory");
            return false;
        }

        let snapshot = self.snapshot_path(repo_full_name, &lock_hash);
        let staging = snapshot.with_extension("tar.partial");
        let command = format!(
            "tar -cf '{}' -C '{}' node_modules",
            staging.display(),
            local_path.display()
        );
        match run_with_timeout(&command, local_path, deadline, &[]).await {
            Ok(output) if output.success => {
                if let Err(err) = std::fs::rename(&staging, &snapshot) {
                    warn!(error = %err, "could not finalize cache snapshot");
                    let _ = std::fs::remove_file(&staging);
                    return false;
                }
                info!(repo = repo_full_name, path = %snapshot.display(), "dependency cache populated");
                true
            }
            Ok(output) => {
                warn!(
                    repo = repo_full_name,
                    exit_code = ?output.exit_code,
                    "dependency cache snapshot failed"
                );
                let _ = std::fs::remove_file(&staging);
                false
            }
            Err(err) => {
                warn!(repo = repo_full_name, error = %err, "dependency cache snapshot could not run");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_tree(dir: &Path) -> PathBuf {
        let tree = dir.join("tree");
        std::fs::create_dir_all(tree.join("node_modules/left-pad")).unwrap();
        std::fs::write(tree.join("node_modules/left-pad/index.js"), "module.exports = 1;\n").unwrap();
        std::fs::write(tree.join("package-lock.json"), r#"{"lockfileVersion": 3}"#).unwrap();
        tree
    }

    #[tokio::test]
    async fn populate_then_restore_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = seeded_tree(tmp.path());
        let cache = DependencyCache::new(tmp.path().join("cache"));

        assert!(cache.populate("acme/app", &tree, Duration::from_secs(30)).await);

        std::fs::remove_dir_all(tree.join("node_modules")).unwrap();
        assert!(cache.restore("acme/app", &tree, Duration::from_secs(30)).await);
        assert!(tree.join("node_modules/left-pad/index.js").exists());
    }

    #[tokio::test]
    async fn changed_lockfile_misses_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = seeded_tree(tmp.path());
        let cache = DependencyCache::new(tmp.path().join("cache"));

        assert!(cache.populate("acme/app", &tree, Duration::from_secs(30)).await);

        std::fs::write(tree.join("package-lock.json"), r#"{"lockfileVersion": 3, "changed": true}"#)
            .unwrap();
        assert!(!cache.restore("acme/app", &tree, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn caches_are_keyed_per_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = seeded_tree(tmp.path());
        let cache = DependencyCache::new(tmp.path().join("cache"));

        assert!(cache.populate("acme/app", &tree, Duration::from_secs(30)).await);
        // Same lockfile contents, different repository: no sharing.
        assert!(!cache.restore("acme/other", &tree, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn missing_node_modules_is_a_quiet_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("bare");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("package.json"), "{}").unwrap();
        let cache = DependencyCache::new(tmp.path().join("cache"));

        assert!(!cache.populate("acme/app", &tree, Duration::from_secs(10)).await);
        assert!(!cache.restore("acme/app", &tree, Duration::from_secs(10)).await);
    }
}
