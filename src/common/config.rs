use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{UnlockError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub unlock: UnlockConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    /// 999 means auto-detect, preferring IR/grayscale devices.
    #[serde(default = "default_device_index")]
    pub device_index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
}

fn default_device_index() -> u32 { 999 }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 360 }
fn default_warmup_frames() -> u32 { 3 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: default_device_index(),
            width: default_width(),
            height: default_height(),
            warmup_frames: default_warmup_frames(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    /// Minimum per-box score for a face to count as detected.
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            detection_confidence: default_detection_confidence(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_recognizer_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization_value")]
    pub normalization_value: f32,
}

fn default_recognizer_input() -> u32 { 112 }
fn default_normalization_value() -> f32 { 127.5 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_recognizer_input(),
            normalization_value: default_normalization_value(),
        }
    }
}

/// Session-scoped thresholds and timing for one unlock attempt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UnlockConfig {
    #[serde(default = "default_presence_threshold")]
    pub presence_threshold: f32,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    #[serde(default = "default_liveness_threshold")]
    pub liveness_threshold: f32,
    /// Below this the matcher's own comparison is not trusted.
    #[serde(default = "default_min_comparison_confidence")]
    pub min_comparison_confidence: f32,
    #[serde(default = "default_dwell_count")]
    pub dwell_count: u32,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_inconclusive_retries")]
    pub max_inconclusive_retries: u32,
    #[serde(default = "default_stale_frame_timeout")]
    pub stale_frame_timeout_ms: u64,
    #[serde(default = "default_detection_timeout")]
    pub detection_timeout_ms: u64,
    #[serde(default = "default_max_stall_recoveries")]
    pub max_stall_recoveries: u32,
}

fn default_presence_threshold() -> f32 { 0.6 }
fn default_match_threshold() -> f32 { 0.8 }
fn default_liveness_threshold() -> f32 { 0.7 }
fn default_min_comparison_confidence() -> f32 { 0.5 }
fn default_dwell_count() -> u32 { 2 }
fn default_sample_interval() -> u64 { 1000 }
fn default_session_timeout() -> u64 { 30_000 }
fn default_max_inconclusive_retries() -> u32 { 3 }
fn default_stale_frame_timeout() -> u64 { 2000 }
fn default_detection_timeout() -> u64 { 500 }
fn default_max_stall_recoveries() -> u32 { 1 }

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            presence_threshold: default_presence_threshold(),
            match_threshold: default_match_threshold(),
            liveness_threshold: default_liveness_threshold(),
            min_comparison_confidence: default_min_comparison_confidence(),
            dwell_count: default_dwell_count(),
            sample_interval_ms: default_sample_interval(),
            session_timeout_ms: default_session_timeout(),
            max_inconclusive_retries: default_max_inconclusive_retries(),
            stale_frame_timeout_ms: default_stale_frame_timeout(),
            detection_timeout_ms: default_detection_timeout(),
            max_stall_recoveries: default_max_stall_recoveries(),
        }
    }
}

impl UnlockConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn stale_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_frame_timeout_ms)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("presence_threshold", self.presence_threshold),
            ("match_threshold", self.match_threshold),
            ("liveness_threshold", self.liveness_threshold),
            ("min_comparison_confidence", self.min_comparison_confidence),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(UnlockError::Config(format!(
                    "{} must be between 0.0 and 1.0, got {}", name, value
                )));
            }
        }

        if self.dwell_count == 0 {
            return Err(UnlockError::Config("dwell_count must be at least 1".into()));
        }

        if self.sample_interval_ms == 0 || self.detection_timeout_ms == 0 || self.stale_frame_timeout_ms == 0 {
            return Err(UnlockError::Config(
                "sample_interval_ms, detection_timeout_ms and stale_frame_timeout_ms must be non-zero".into()
            ));
        }

        if self.session_timeout_ms == 0 || self.session_timeout_ms > 300_000 {
            return Err(UnlockError::Config(format!(
                "session_timeout_ms must be between 1 and 300000, got {}", self.session_timeout_ms
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Directory holding `<identity>.bincode` reference blobs. Dev or system location when unset.
    #[serde(default)]
    pub reference_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PerformanceConfig {
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_optimization_level() -> u32 { 3 }

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { optimization_level: default_optimization_level() }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let system = crate::common::paths::system_config_file();
        if system.exists() {
            return Self::load_from_path(&system);
        }
        Self::load_from_path(&PathBuf::from("configs/faceunlock.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(UnlockError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::debug!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| UnlockError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(UnlockError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(UnlockError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if !(0.0..=1.0).contains(&self.detector.detection_confidence) {
            return Err(UnlockError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.detection_confidence
            )));
        }
        if self.detector.input_width == 0 || self.detector.input_width > 4096
            || self.detector.input_height == 0 || self.detector.input_height > 4096
        {
            return Err(UnlockError::Config(format!(
                "Detector input must be between 1 and 4096 pixels per side, got {}x{}",
                self.detector.input_width, self.detector.input_height
            )));
        }

        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(UnlockError::Config(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }

        self.unlock.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [models]
        detector_path = "models/detector.onnx"
        recognizer_path = "models/recognizer.onnx"
    "#;

    #[test]
    fn test_minimal_config_uses_recommended_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.unlock, UnlockConfig::default());
        assert_eq!(config.unlock.presence_threshold, 0.6);
        assert_eq!(config.unlock.dwell_count, 2);
        assert_eq!(config.unlock.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.unlock.stale_frame_timeout(), Duration::from_secs(2));
        assert_eq!(config.camera.device_index, 999);
    }

    #[test]
    fn test_unlock_overrides_are_parsed() {
        let toml = format!(
            "{}\n[unlock]\npresence_threshold = 0.75\ndwell_count = 4\nsample_interval_ms = 250\n",
            MINIMAL
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.unlock.presence_threshold, 0.75);
        assert_eq!(config.unlock.dwell_count, 4);
        assert_eq!(config.unlock.sample_interval(), Duration::from_millis(250));
        assert_eq!(config.unlock.match_threshold, 0.8);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut unlock = UnlockConfig::default();
        unlock.match_threshold = 1.2;
        assert!(matches!(unlock.validate(), Err(UnlockError::Config(_))));
    }

    #[test]
    fn test_zero_dwell_rejected() {
        let unlock = UnlockConfig { dwell_count: 0, ..UnlockConfig::default() };
        assert!(unlock.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/faceunlock.toml")).unwrap_err();
        assert!(matches!(err, UnlockError::Config(_)));
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/faceunlock.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.unlock, UnlockConfig::default());
        assert!(config.storage.reference_dir.is_none());
    }

    #[test]
    fn test_load_from_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faceunlock.toml");
        std::fs::write(&path, format!("{}\n[unlock]\nsession_timeout_ms = 0\n", MINIMAL)).unwrap();
        assert!(matches!(Config::load_from_path(&path), Err(UnlockError::Config(_))));
    }
}
