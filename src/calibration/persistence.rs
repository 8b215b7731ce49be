// src/calibration/persistence.rs
//
// Disk cache for calibration data, keyed by camera id. A cached
// calibration lets a session start tracking in table coordinates
// before the first in-video calibration completes. Entries past the
// age limit or failing revalidation are ignored.

use crate::types::CalibrationData;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const DEFAULT_MAX_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Serialize, Deserialize)]
struct CachedCalibration {
    saved_at_unix: u64,
    camera_id: String,
    data: CalibrationData,
}

pub struct CalibrationCache {
    dir: PathBuf,
    max_age_secs: u64,
}

impl CalibrationCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }

    pub fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    fn path_for(&self, camera_id: &str) -> PathBuf {
        // Camera ids come from config; sanitize anyway so a path-ish id
        // cannot escape the cache directory.
        let safe: String = camera_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("calibration_{safe}.json"))
    }

    pub fn store(&self, camera_id: &str, data: &CalibrationData) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating calibration cache dir {}", self.dir.display()))?;

        let entry = CachedCalibration {
            saved_at_unix: unix_now(),
            camera_id: camera_id.to_string(),
            data: data.clone(),
        };
        let json = serde_json::to_string_pretty(&entry)?;
        let path = self.path_for(camera_id);
        fs::write(&path, json)
            .with_context(|| format!("writing calibration cache {}", path.display()))?;

        info!(camera_id, path = %path.display(), "calibration cached");
        Ok(())
    }

    /// Load a cached calibration if present, fresh, and still valid.
    pub fn load(&self, camera_id: &str) -> Option<CalibrationData> {
        let path = self.path_for(camera_id);
        let json = fs::read_to_string(&path).ok()?;

        let entry: CachedCalibration = match serde_json::from_str(&json) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt calibration cache");
                return None;
            }
        };

        if entry.camera_id != camera_id {
            warn!(path = %path.display(), "calibration cache camera id mismatch, ignoring");
            return None;
        }

        let age = unix_now().saturating_sub(entry.saved_at_unix);
        if age > self.max_age_secs {
            debug!(camera_id, age_secs = age, "calibration cache too old, ignoring");
            return None;
        }

        if !entry.data.is_valid || entry.data.homography.try_inverse().is_none() {
            warn!(camera_id, "cached calibration fails revalidation, ignoring");
            return None;
        }

        info!(camera_id, age_secs = age, "loaded cached calibration");
        Some(entry.data)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
