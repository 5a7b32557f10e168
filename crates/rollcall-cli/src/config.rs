use rollcall_core::{DetectionMode, Settings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default Euclidean tolerance for the unit-length ArcFace embeddings.
///
/// Distance `d` between unit vectors corresponds to cosine `1 - d²/2`, so
/// 1.10 accepts matches at cosine similarity of about 0.40.
pub const ARCFACE_TOLERANCE: f32 = 1.10;
/// Below this the ArcFace matcher rejects most genuine faces (cosine ~0.68).
pub const ARCFACE_TOLERANCE_FLOOR: f32 = 0.8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// CLI configuration: recognition settings plus model and device locations.
///
/// Loaded from an optional TOML file (`ROLLCALL_CONFIG`), then overridden by
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub settings: Settings,
    /// Directory containing the ONNX model files.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// V4L2 device used by `video --device` when none is given.
    #[serde(default = "default_camera_device")]
    pub camera_device: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings {
                tolerance: ARCFACE_TOLERANCE,
                ..Settings::default()
            },
            model_dir: default_model_dir(),
            camera_device: default_camera_device(),
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut cfg = match lookup("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(lookup);
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |source: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let mut cfg: Config = toml::from_str(&raw).map_err(parse_err)?;
        let table: toml::Table = toml::from_str(&raw).map_err(parse_err)?;
        if !table.contains_key("tolerance") {
            cfg.settings.tolerance = ARCFACE_TOLERANCE;
        }
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(cfg)
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable values keep the current setting.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `ROLLCALL_TOLERANCE` | `tolerance` |
    /// | `ROLLCALL_DETECTION_MODE` | `detection_mode` |
    /// | `ROLLCALL_MAX_DIMENSION` | `max_dimension` |
    /// | `ROLLCALL_FRAME_INTERVAL` | `frame_interval` |
    /// | `ROLLCALL_CORPUS_DIR` | `corpus_dir` |
    /// | `ROLLCALL_LEDGER_DIR` | `ledger_dir` |
    /// | `ROLLCALL_FAILURES_DIR` | `failures_dir` |
    /// | `ROLLCALL_CACHE_PATH` | `cache_path` |
    /// | `ROLLCALL_MODEL_DIR` | `model_dir` |
    /// | `ROLLCALL_CAMERA_DEVICE` | `camera_device` |
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let s = &mut self.settings;
        s.tolerance = env_f32(&lookup, "ROLLCALL_TOLERANCE", s.tolerance);
        s.max_dimension = env_u32(&lookup, "ROLLCALL_MAX_DIMENSION", s.max_dimension);
        s.frame_interval = env_usize(&lookup, "ROLLCALL_FRAME_INTERVAL", s.frame_interval);
        if let Some(mode) = lookup("ROLLCALL_DETECTION_MODE") {
            match mode.parse::<DetectionMode>() {
                Ok(mode) => s.detection_mode = mode,
                Err(e) => tracing::warn!(error = %e, "ignoring ROLLCALL_DETECTION_MODE"),
            }
        }
        for (key, field) in [
            ("ROLLCALL_CORPUS_DIR", &mut s.corpus_dir),
            ("ROLLCALL_LEDGER_DIR", &mut s.ledger_dir),
            ("ROLLCALL_FAILURES_DIR", &mut s.failures_dir),
            ("ROLLCALL_CACHE_PATH", &mut s.cache_path),
            ("ROLLCALL_MODEL_DIR", &mut self.model_dir),
        ] {
            if let Some(v) = lookup(key) {
                *field = PathBuf::from(v);
            }
        }
        if let Some(device) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = device;
        }
    }

    /// Whether the tolerance is too strict for the ArcFace embedding space.
    pub fn tolerance_below_model_range(&self) -> bool {
        self.settings.tolerance < ARCFACE_TOLERANCE_FLOOR
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(ARCFACE_MODEL_FILE)
    }
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

fn default_camera_device() -> String {
    "/dev/video0".to_string()
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.settings.tolerance, ARCFACE_TOLERANCE);
        assert_eq!(cfg.settings.frame_interval, Settings::default().frame_interval);
        assert!(!cfg.tolerance_below_model_range());
        assert!(cfg.scrfd_model_path().ends_with("det_10g.onnx"));
        assert!(cfg.arcface_model_path().ends_with("w600k_r50.onnx"));
        assert_eq!(cfg.camera_device, "/dev/video0");
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "tolerance = 0.45\ndetection_mode = \"accurate\"\nledger_dir = \"/srv/attendance\"\nmodel_dir = \"/opt/models\"\n",
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.settings.tolerance, 0.45);
        assert_eq!(cfg.settings.detection_mode, DetectionMode::Accurate);
        assert_eq!(cfg.settings.ledger_dir, PathBuf::from("/srv/attendance"));
        assert_eq!(cfg.settings.frame_interval, 30);
        assert_eq!(cfg.scrfd_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert!(cfg.tolerance_below_model_range());
    }

    #[test]
    fn test_toml_without_tolerance_uses_arcface_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "frame_interval = 15
").unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.settings.tolerance, ARCFACE_TOLERANCE);
        assert_eq!(cfg.settings.frame_interval, 15);
    }

    #[test]
    fn test_unit_vectors_at_cosine_point_six_match() {
        use rollcall_core::{Embedding, EuclideanMatcher, Identity, Matcher};

        let cfg = Config::default();
        let gallery = [Identity {
            name: "alice".into(),
            embedding: Embedding::new(vec![1.0, 0.0]),
        }];
        let face = Embedding::new(vec![0.6, 0.8]);
        let result = EuclideanMatcher.compare(&face, &gallery, cfg.settings.tolerance);
        assert_eq!(result.name(), Some("alice"));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "tolerance = \"close\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(env(&[
            ("ROLLCALL_TOLERANCE", "0.6"),
            ("ROLLCALL_FRAME_INTERVAL", "10"),
            ("ROLLCALL_DETECTION_MODE", "cnn"),
            ("ROLLCALL_FAILURES_DIR", "/tmp/failed"),
            ("ROLLCALL_MODEL_DIR", "/models"),
        ]));
        assert_eq!(cfg.settings.tolerance, 0.6);
        assert_eq!(cfg.settings.frame_interval, 10);
        assert_eq!(cfg.settings.detection_mode, DetectionMode::Accurate);
        assert_eq!(cfg.settings.failures_dir, PathBuf::from("/tmp/failed"));
        assert_eq!(cfg.model_dir, PathBuf::from("/models"));
    }

    #[test]
    fn test_unparseable_env_keeps_value() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(env(&[
            ("ROLLCALL_TOLERANCE", "loose"),
            ("ROLLCALL_DETECTION_MODE", "turbo"),
        ]));
        assert_eq!(cfg.settings.tolerance, ARCFACE_TOLERANCE);
        assert_eq!(cfg.settings.detection_mode, DetectionMode::Fast);
    }
}
