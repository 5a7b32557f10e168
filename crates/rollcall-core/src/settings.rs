use crate::embedder::DetectionMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Recognition settings shared by enrollment, matching and sessions.
///
/// Constructed once by the caller and passed down by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum Euclidean distance accepted as the same identity.
    pub tolerance: f32,
    /// Detector trade-off used for enrollment and sessions.
    pub detection_mode: DetectionMode,
    /// Enrollment images larger than this (on their longer side) are downscaled.
    pub max_dimension: u32,
    /// Only every Nth video frame is analysed.
    pub frame_interval: usize,
    /// Root of the `<identity>/<image>` enrollment corpus.
    pub corpus_dir: PathBuf,
    /// Directory holding `attendance_<date>.csv` segments.
    pub ledger_dir: PathBuf,
    /// Directory holding per-day failure archives.
    pub failures_dir: PathBuf,
    /// Where the built encoding cache is persisted.
    pub cache_path: PathBuf,
}

pub const DEFAULT_TOLERANCE: f32 = 0.55;
pub const DEFAULT_MAX_DIMENSION: u32 = 800;
pub const DEFAULT_FRAME_INTERVAL: usize = 30;

impl Default for Settings {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            detection_mode: DetectionMode::Fast,
            max_dimension: DEFAULT_MAX_DIMENSION,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            corpus_dir: PathBuf::from("enrollment_images"),
            ledger_dir: PathBuf::from("attendance_logs"),
            failures_dir: PathBuf::from("failures"),
            cache_path: PathBuf::from("encodings.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.tolerance, 0.55);
        assert_eq!(s.detection_mode, DetectionMode::Fast);
        assert_eq!(s.max_dimension, 800);
        assert_eq!(s.frame_interval, 30);
        assert_eq!(s.ledger_dir, PathBuf::from("attendance_logs"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let s: Settings = serde_json::from_str(r#"{"tolerance": 0.4, "detection_mode": "accurate"}"#).unwrap();
        assert_eq!(s.tolerance, 0.4);
        assert_eq!(s.detection_mode, DetectionMode::Accurate);
        assert_eq!(s.frame_interval, 30);
    }
}
