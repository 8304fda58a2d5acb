//! Screenshot regression diffing.
//!
//! Best-effort telemetry, never pipeline-fatal: missing inputs yield `None`
//! rather than an error. Primary strategy delegates to ImageMagick's
//! `compare` for an exact differing-pixel count; when the tool is
//! unavailable the differ degrades to a content-hash check with a
//! file-size-based percentage estimate (pixel count unknown).

use cvr_common::{DiffResult, run_with_timeout};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ScreenshotDiffer {
    use_tool: bool,
}

impl Default for ScreenshotDiffer {
    fn default() -> Self {
        Self { use_tool: true }
    }
}

impl ScreenshotDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the hash fallback (tests, or hosts known to lack ImageMagick).
    pub fn with_tool_disabled() -> Self {
        Self { use_tool: false }
    }

    /// Compare `current` against `previous`, writing a visual diff to
    /// `output` when the tool is available.
    pub async fn diff(
        &self,
        current: &Path,
        previous: &Path,
        output: &Path,
        deadline: Duration,
    ) -> Option<DiffResult> {
        if !current.exists() || !previous.exists() {
            debug!(
                current = %current.display(),
                previous = %previous.display(),
                "diff skipped, input missing"
            );
            return None;
        }

        if self.use_tool
            && let Some(result) = self.tool_diff(current, previous, output, deadline).await
        {
            return Some(result);
        }
        self.hash_diff(current, previous)
    }

    /// ImageMagick absolute-error comparison. `None` means the tool is
    /// unusable here and the caller should fall back.
    async fn tool_diff(
        &self,
        current: &Path,
        previous: &Path,
        output: &Path,
        deadline: Duration,
    ) -> Option<DiffResult> {
        let workdir = std::env::temp_dir();
        let command = format!(
            "compare -metric AE '{}' '{}' '{}'",
            current.display(),
            previous.display(),
            output.display()
        );
        let compared = run_with_timeout(&command, &workdir, deadline, &[]).await.ok()?;

        // compare: 0 = identical, 1 = images differ, anything else
        // (2 = error, 127 = missing binary) disqualifies the tool.
        if compared.timed_out || !matches!(compared.exit_code, Some(0) | Some(1)) {
            debug!(exit_code = ?compared.exit_code, "image tool unusable, using hash fallback");
            return None;
        }

        // The AE metric lands on stderr; scientific notation for huge counts.
        let pixel_count = compared
            .stderr
            .split_whitespace()
            .next()
            .and_then(|token| token.parse::<f64>().ok())
            .map(|count| count.max(0.0) as u64)?;

        let dims = run_with_timeout(
            &format!("identify -format '%w %h' '{}'", current.display()),
            &workdir,
            deadline,
            &[],
        )
        .await
        .ok()?;
        let mut parts = dims.stdout.split_whitespace();
        let width: u64 = parts.next()?.parse().ok()?;
        let height: u64 = parts.next()?.parse().ok()?;
        let area = (width * height).max(1);

        let diff_percentage = (pixel_count as f64 / area as f64 * 100.0).clamp(0.0, 100.0);
        debug!(pixel_count, diff_percentage, "tool diff complete");

        Some(DiffResult {
            diff_percentage,
            diff_pixel_count: Some(pixel_count),
            diff_image_path: output.exists().then(|| output.to_path_buf()),
            previous_screenshot_path: Some(previous.to_path_buf()),
        })
    }

    /// Content-hash fallback: identical hash means no diff; differing hash
    /// yields an estimate from the relative file-size delta. Explicitly an
    /// estimate: pixel count is reported unknown.
    fn hash_diff(&self, current: &Path, previous: &Path) -> Option<DiffResult> {
        let current_bytes = match std::fs::read(current) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %current.display(), error = %err, "could not read screenshot for hashing");
                return None;
            }
        };
        let previous_bytes = match std::fs::read(previous) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %previous.display(), error = %err, "could not read baseline for hashing");
                return None;
            }
        };

        if blake3::hash(&current_bytes) == blake3::hash(&previous_bytes) {
            return Some(DiffResult {
                diff_percentage: 0.0,
                diff_pixel_count: Some(0),
                diff_image_path: None,
                previous_screenshot_path: Some(previous.to_path_buf()),
            });
        }

        let larger = current_bytes.len().max(previous_bytes.len()).max(1) as f64;
        let delta = current_bytes.len().abs_diff(previous_bytes.len()) as f64;
        // Differing content with near-equal sizes still reports a non-zero
        // estimate.
        let diff_percentage = (delta / larger * 100.0).clamp(1.0, 100.0);
        debug!(diff_percentage, "hash fallback diff (estimated)");

        Some(DiffResult {
            diff_percentage,
            diff_pixel_count: None,
            diff_image_path: None,
            previous_screenshot_path: Some(previous.to_path_buf()),
        })
    }
}
