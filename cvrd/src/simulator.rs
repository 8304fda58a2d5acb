//! iOS simulator control as an injected service.
//!
//! Device discovery is cached with a TTL so repeated runs do not hammer
//! `simctl`; tests substitute fixture JSON and control time by
//! constructing the service with a zero TTL. Device selection is an
//! ordered strategy chain: ranked preferred names, then any iPhone, then
//! a hard-coded default.

use cvr_common::{PipelineError, RunLogger, run_with_timeout, spawn_long_running};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Ranked device names tried first during selection.
const PREFERRED_DEVICES: [&str; 5] = [
    "iPhone 16 Pro",
    "iPhone 16",
    "iPhone 15 Pro",
    "iPhone 15",
    "iPhone 14",
];

/// Last-resort device name when discovery finds nothing usable.
const DEFAULT_DEVICE: &str = "iPhone 15";

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// One available simulator device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorDevice {
    pub udid: String,
    pub name: String,
    pub state: String,
}

/// Selection outcome. `udid` is `None` only for the hard-coded fallback,
/// in which case commands address the device by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorTarget {
    pub name: String,
    pub udid: Option<String>,
}

impl SimulatorTarget {
    /// Identifier usable in `simctl` invocations.
    fn ident(&self) -> &str {
        self.udid.as_deref().unwrap_or(&self.name)
    }
}

struct CachedDevices {
    devices: Vec<SimulatorDevice>,
    fetched_at: Instant,
}

/// TTL-cached simulator control.
pub struct SimulatorService {
    ttl: Duration,
    cache: RwLock<Option<CachedDevices>>,
}

impl Default for SimulatorService {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl SimulatorService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: RwLock::new(None),
        }
    }

    fn workdir() -> std::path::PathBuf {
        std::env::temp_dir()
    }

    /// Fail fast with a remediation hint when the simulator toolchain is
    /// absent.
    pub async fn ensure_available(&self) -> Result<(), PipelineError> {
        match run_with_timeout("xcrun --version", &Self::workdir(), Duration::from_secs(10), &[])
            .await
        {
            Ok(output) if output.success => Ok(()),
            _ => Err(PipelineError::tool_unavailable(
                "xcrun",
                "simulator control requires macOS with the Xcode command line tools installed",
            )),
        }
    }

    /// Installed, available simulator devices (cached).
    pub async fn list_devices(&self) -> Result<Vec<SimulatorDevice>, PipelineError> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.ttl
            {
                debug!(count = cached.devices.len(), "simulator list served from cache");
                return Ok(cached.devices.clone());
            }
        }

        let output = run_with_timeout(
            "xcrun simctl list devices available --json",
            &Self::workdir(),
            Duration::from_secs(30),
            &[],
        )
        .await?;
        if !output.success {
            return Err(PipelineError::step_failed(
                "simulator-discovery",
                format!("simctl list failed (exit {:?})", output.exit_code),
            ));
        }

        let devices = parse_device_list(&output.stdout);
        debug!(count = devices.len(), "simulator list refreshed");
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedDevices {
            devices: devices.clone(),
            fetched_at: Instant::now(),
        });
        Ok(devices)
    }

    /// Drop the cached device list (state changed underneath us).
    pub fn invalidate(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }

    /// Pick a device: ranked preferred names, then any iPhone, then the
    /// hard-coded default.
    pub async fn pick_device(&self) -> Result<SimulatorTarget, PipelineError> {
        let devices = self.list_devices().await?;
        let target = choose_device(&devices);
        info!(device = %target.name, udid = ?target.udid, "simulator selected");
        Ok(target)
    }

    /// Idempotent boot: shutdown-then-boot, ignoring "already in that
    /// state" errors from either step.
    pub async fn boot(&self, target: &SimulatorTarget) -> Result<(), PipelineError> {
        let ident = target.ident();
        let shutdown = run_with_timeout(
            &format!("xcrun simctl shutdown '{ident}'"),
            &Self::workdir(),
            Duration::from_secs(30),
            &[],
        )
        .await?;
        if !shutdown.success && !is_state_noise(&shutdown.stderr) {
            debug!(device = ident, stderr = %shutdown.stderr.trim(), "pre-boot shutdown reported an error");
        }

        let boot = run_with_timeout(
            &format!("xcrun simctl boot '{ident}'"),
            &Self::workdir(),
            Duration::from_secs(60),
            &[],
        )
        .await?;
        if boot.success || is_state_noise(&boot.stderr) {
            self.invalidate();
            Ok(())
        } else {
            Err(PipelineError::step_failed(
                "simulator-boot",
                format!("could not boot {ident}: {}", boot.stderr.trim()),
            ))
        }
    }

    /// Block until boot completes, bounded by `deadline`.
    pub async fn wait_for_boot(
        &self,
        target: &SimulatorTarget,
        deadline: Duration,
    ) -> Result<(), PipelineError> {
        let ident = target.ident();
        let output = run_with_timeout(
            &format!("xcrun simctl bootstatus '{ident}' -b"),
            &Self::workdir(),
            deadline,
            &[],
        )
        .await?;
        if output.timed_out {
            return Err(PipelineError::CommandTimeout {
                command: format!("simctl bootstatus {ident}"),
                timeout_secs: deadline.as_secs(),
            });
        }
        if !output.success {
            return Err(PipelineError::step_failed(
                "simulator-boot",
                format!("bootstatus failed for {ident}"),
            ));
        }
        Ok(())
    }

    /// Capture the booted simulator's screen.
    pub async fn screenshot(&self, path: &Path, deadline: Duration) -> Result<(), PipelineError> {
        let output = run_with_timeout(
            &format!("xcrun simctl io booted screenshot '{}'", path.display()),
            &Self::workdir(),
            deadline,
            &[],
        )
        .await?;
        if output.success {
            Ok(())
        } else {
            Err(PipelineError::step_failed(
                "simulator-screenshot",
                format!("screenshot failed (exit {:?})", output.exit_code),
            ))
        }
    }

    /// Stream structured simulator logs into the runtime log for a fixed
    /// window, killing the streaming subprocess on timeout or early exit.
    pub async fn stream_logs(&self, window: Duration, logger: &RunLogger) {
        let mut handle = match spawn_long_running(
            "xcrun simctl spawn booted log stream --style compact",
            &Self::workdir(),
            &[],
        ) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "log streaming could not start");
                return;
            }
        };

        let expires = Instant::now() + window;
        loop {
            let Some(remaining) = expires.checked_duration_since(Instant::now()) else {
                break;
            };
            match timeout(remaining, handle.next_line()).await {
                Ok(Some(line)) => logger.line(&line.line),
                Ok(None) => {
                    debug!("log stream closed early");
                    break;
                }
                Err(_) => break,
            }
        }
        handle.kill().await;
    }
}

/// Parse `simctl list devices --json` output into a flat device list,
/// keeping only available devices.
fn parse_device_list(json: &str) -> Vec<SimulatorDevice> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
        return Vec::new();
    };
    let Some(runtimes) = value.get("devices").and_then(|d| d.as_object()) else {
        return Vec::new();
    };

    let mut devices = Vec::new();
    for runtime_devices in runtimes.values() {
        let Some(list) = runtime_devices.as_array() else {
            continue;
        };
        for device in list {
            if !device
                .get("isAvailable")
                .and_then(|a| a.as_bool())
                .unwrap_or(false)
            {
                continue;
            }
            let (Some(udid), Some(name)) = (
                device.get("udid").and_then(|u| u.as_str()),
                device.get("name").and_then(|n| n.as_str()),
            ) else {
                continue;
            };
            devices.push(SimulatorDevice {
                udid: udid.to_string(),
                name: name.to_string(),
                state: device
                    .get("state")
                    .and_then(|s| s.as_str())
                    .unwrap_or("Unknown")
                    .to_string(),
            });
        }
    }
    devices
}

/// Ordered selection: ranked preferred names → any iPhone → hard default.
fn choose_device(devices: &[SimulatorDevice]) -> SimulatorTarget {
    for preferred in PREFERRED_DEVICES {
        if let Some(device) = devices.iter().find(|d| d.name == preferred) {
            return SimulatorTarget {
                name: device.name.clone(),
                udid: Some(device.udid.clone()),
            };
        }
    }
    if let Some(device) = devices.iter().find(|d| d.name.contains("iPhone")) {
        return SimulatorTarget {
            name: device.name.clone(),
            udid: Some(device.udid.clone()),
        };
    }
    SimulatorTarget {
        name: DEFAULT_DEVICE.to_string(),
        udid: None,
    }
}

/// `simctl` errors that just mean "already in the requested state".
fn is_state_noise(stderr: &str) -> bool {
    stderr.contains("current state") || stderr.contains("Unable to shutdown")
}
