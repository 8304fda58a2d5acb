//! Append-only timestamped line files for individual runs.
//!
//! Each run gets a build log, optionally a runtime log and a network log.
//! These are operator-facing artifacts, separate from tracing. A logger
//! that cannot create its file degrades to a no-op writer rather than
//! failing the run it was meant to document.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Which artifact a run log file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Build,
    Runtime,
    Network,
}

impl LogKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::Network => "network",
        }
    }
}

/// Append-only, timestamped line writer for one run artifact.
pub struct RunLogger {
    path: PathBuf,
    file: Option<Mutex<File>>,
}

impl RunLogger {
    /// Create `<dir>/<run_id>-<kind>.log`, degrading to a no-op writer when
    /// the file cannot be created.
    pub fn create(dir: &Path, run_id: &str, kind: LogKind) -> Self {
        let path = dir.join(format!("{run_id}-{}.log", kind.suffix()));
        let file = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match file {
            Ok(file) => Self {
                path,
                file: Some(Mutex::new(file)),
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "run log unavailable, lines will be dropped");
                Self { path, file: None }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether lines are actually being persisted.
    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    /// Append one timestamped line.
    pub fn line(&self, message: &str) {
        self.write(&format!(
            "[{}] {message}\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));
    }

    /// Append a multi-line chunk (e.g. tee'd child output), one timestamped
    /// line per input line.
    pub fn chunk(&self, chunk: &str) {
        for line in chunk.lines() {
            self.line(line);
        }
    }

    fn write(&self, formatted: &str) {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
            && let Err(err) = file.write_all(formatted.as_bytes())
        {
            warn!(path = %self.path.display(), error = %err, "failed to append run log line");
        }
    }
}
