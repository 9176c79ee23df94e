use std::path::PathBuf;

use facematch_core::pipeline::DEFAULT_MATCH_THRESHOLD;
use facematch_core::{PipelineConfig, ScrfdConfig};

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Similarity at or above which two faces match.
    pub match_threshold: f64,
    /// Minimum SCRFD score for a detection to count.
    pub detection_threshold: f32,
    /// Give up on a comparison after this many seconds.
    pub timeout_secs: u64,
    /// Skip the ID photo quality gate.
    pub skip_quality: bool,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir().join("models"));

        Self {
            model_dir,
            match_threshold: env_parse("FACEMATCH_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            detection_threshold: env_parse(
                "FACEMATCH_DETECTION_THRESHOLD",
                ScrfdConfig::default().confidence_threshold,
            ),
            timeout_secs: env_parse("FACEMATCH_TIMEOUT_SECS", 30),
            skip_quality: std::env::var("FACEMATCH_SKIP_QUALITY")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    pub fn scrfd_config(&self) -> ScrfdConfig {
        ScrfdConfig {
            confidence_threshold: self.detection_threshold,
            ..ScrfdConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            match_threshold: self.match_threshold,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
