//! Dev-server port inference and best-effort port reclamation.
//!
//! Static inference reads the manifest; dynamic inference actually starts
//! the dev command and watches its output. Static is cheap but can be
//! ambiguous; dynamic is the higher-confidence, higher-cost fallback.

use cvr_common::{ProcessHandle, spawn_long_running};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use regex::Regex;
use serde::Serialize;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

/// How the port was determined, ranked by confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortConfidence {
    /// Explicit `--port`/`PORT=` flag in a manifest script.
    Explicit,
    /// Known framework default inferred from dependencies.
    Framework,
    /// Generic dev-server default.
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct PortGuess {
    pub port: u16,
    pub confidence: PortConfidence,
}

/// Framework dependencies and their conventional dev ports, ranked: the
/// first match in manifest dependencies wins.
const FRAMEWORK_PORTS: [(&str, u16); 8] = [
    ("next", 3000),
    ("vite", 5173),
    ("react-scripts", 3000),
    ("astro", 4321),
    ("nuxt", 3000),
    ("@angular/core", 4200),
    ("@remix-run/dev", 3000),
    ("@sveltejs/kit", 5173),
];

const GENERIC_DEV_PORT: u16 = 3000;

fn explicit_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:--port[ =]|-p |PORT=)(\d{2,5})").expect("static regex compiles")
    })
}

fn dev_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{2,5})")
            .expect("static regex compiles")
    })
}

/// Inspect manifest scripts and dependencies for a port.
///
/// Ranking: explicit flag in `dev`/`start`/`serve` scripts > framework
/// convention > generic default. Returns `None` when there is no manifest
/// at all.
pub fn detect_port_static(local_path: &Path) -> Option<PortGuess> {
    let manifest = std::fs::read_to_string(local_path.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&manifest).ok()?;

    if let Some(scripts) = manifest.get("scripts").and_then(|s| s.as_object()) {
        for name in ["dev", "start", "serve"] {
            if let Some(script) = scripts.get(name).and_then(|s| s.as_str())
                && let Some(captures) = explicit_port_re().captures(script)
                && let Ok(port) = captures[1].parse::<u16>()
            {
                debug!(script = name, port, "explicit port flag in manifest script");
                return Some(PortGuess {
                    port,
                    confidence: PortConfidence::Explicit,
                });
            }
        }
    }

    for deps_key in ["dependencies", "devDependencies"] {
        if let Some(deps) = manifest.get(deps_key).and_then(|d| d.as_object()) {
            for (framework, port) in FRAMEWORK_PORTS {
                if deps.contains_key(framework) {
                    debug!(framework, port, "framework convention port");
                    return Some(PortGuess {
                        port,
                        confidence: PortConfidence::Framework,
                    });
                }
            }
        }
    }

    Some(PortGuess {
        port: GENERIC_DEV_PORT,
        confidence: PortConfidence::Fallback,
    })
}

/// Start the dev command and scan its combined output for a local URL.
/// The process is torn down regardless of outcome.
pub async fn detect_port_dynamically(
    local_path: &Path,
    dev_command: &str,
    deadline: Duration,
) -> Option<u16> {
    let mut handle = match spawn_long_running(dev_command, local_path, &[]) {
        Ok(handle) => handle,
        Err(err) => {
            warn!(error = %err, "dev command could not start for port detection");
            return None;
        }
    };

    let port = scan_for_port(&mut handle, deadline).await;
    handle.kill().await;
    port
}

async fn scan_for_port(handle: &mut ProcessHandle, deadline: Duration) -> Option<u16> {
    let expires = Instant::now() + deadline;
    loop {
        let remaining = expires.checked_duration_since(Instant::now())?;
        match timeout(remaining, handle.next_line()).await {
            Ok(Some(line)) => {
                if let Some(captures) = dev_url_re().captures(&line.line)
                    && let Ok(port) = captures[1].parse::<u16>()
                {
                    debug!(port, "dev server announced its port");
                    return Some(port);
                }
            }
            Ok(None) => return None,
            Err(_) => return None,
        }
    }
}

/// Best-effort reclamation of a TCP port before reuse: find owning PIDs
/// via lsof, TERM them, then KILL stragglers.
pub async fn free_port(port: u16) {
    let pids = pids_on_port(port).await;
    if pids.is_empty() {
        return;
    }
    warn!(port, ?pids, "port busy, terminating owners");
    for pid in &pids {
        let _ = tokio::process::Command::new("kill")
            .args(["-s", "TERM", pid])
            .status()
            .await;
    }
    sleep(Duration::from_millis(500)).await;
    for pid in pids_on_port(port).await {
        let _ = tokio::process::Command::new("kill")
            .args(["-s", "KILL", &pid])
            .status()
            .await;
    }
}

async fn pids_on_port(port: u16) -> Vec<String> {
    let Ok(output) = tokio::process::Command::new("lsof")
        .arg(format!("-ti:{port}"))
        .output()
        .await
    else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, content: &str) {
        std::fs::write(dir.join("package.json"), content).unwrap();
    }

    #[test]
    fn explicit_flag_beats_framework_convention() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "scripts": {"dev": "vite --port 8085"},
                "devDependencies": {"vite": "^5.0.0"}
            }"#,
        );
        let guess = detect_port_static(dir.path()).unwrap();
        assert_eq!(guess.port, 8085);
        assert_eq!(guess.confidence, PortConfidence::Explicit);
    }

    #[test]
    fn framework_dependency_maps_to_convention() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{"scripts": {"dev": "vite"}, "devDependencies": {"vite": "^5.0.0"}}"#,
        );
        let guess = detect_port_static(dir.path()).unwrap();
        assert_eq!(guess.port, 5173);
        assert_eq!(guess.confidence, PortConfidence::Framework);
    }

    #[test]
    fn env_port_in_start_script_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{"scripts": {"start": "PORT=4100 node server.js"}}"#,
        );
        let guess = detect_port_static(dir.path()).unwrap();
        assert_eq!(guess.port, 4100);
        assert_eq!(guess.confidence, PortConfidence::Explicit);
    }

    #[test]
    fn bare_manifest_gets_generic_default() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), r#"{"name": "plain"}"#);
        let guess = detect_port_static(dir.path()).unwrap();
        assert_eq!(guess.port, GENERIC_DEV_PORT);
        assert_eq!(guess.confidence, PortConfidence::Fallback);
    }

    #[test]
    fn missing_manifest_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_port_static(dir.path()).is_none());
    }

    #[tokio::test]
    async fn dynamic_detection_reads_announced_url() {
        let dir = tempfile::tempdir().unwrap();
        let port = detect_port_dynamically(
            dir.path(),
            "echo '  ➜  Local:   http://localhost:5173/'; sleep 30",
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(port, Some(5173));
    }

    #[tokio::test]
    async fn dynamic_detection_times_out_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let port = detect_port_dynamically(
            dir.path(),
            "echo 'starting up...'; sleep 30",
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(port, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn url_regex_matches_all_local_hosts() {
        for line in [
            "Server running at http://127.0.0.1:8080",
            "listening on http://0.0.0.0:3001/",
            "ready - started server on http://localhost:3000",
        ] {
            assert!(dev_url_re().is_match(line), "no match for {line}");
        }
        assert!(!dev_url_re().is_match("https://example.com:443"));
    }
}
