use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::source::SourceKind;

const DEFAULT_CONFIG_PATH: &str = "vigil.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_history() -> i32 {
    500
}

fn default_var_threshold() -> f64 {
    16.0
}

fn default_learning_rate() -> f64 {
    -1.0
}

fn default_kernel_size() -> i32 {
    5
}

fn default_min_blob_area() -> f64 {
    500.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default = "default_history")]
    pub history: i32,
    #[serde(default = "default_var_threshold")]
    pub var_threshold: f64,
    #[serde(default)]
    pub detect_shadows: bool,
    /// Negative lets the subtractor pick its own rate from `history`.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: i32,
    #[serde(default = "default_min_blob_area")]
    pub min_blob_area: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            history: default_history(),
            var_threshold: default_var_threshold(),
            detect_shadows: false,
            learning_rate: default_learning_rate(),
            kernel_size: default_kernel_size(),
            min_blob_area: default_min_blob_area(),
        }
    }
}

fn default_confidence() -> f32 {
    0.5
}

fn default_nms() -> f32 {
    0.4
}

fn default_input_size() -> i32 {
    416
}

fn default_adult_min_height() -> f32 {
    150.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// ONNX model path or URL, or Darknet weights when `model_config` is set.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_config: Option<PathBuf>,
    #[serde(default)]
    pub labels: Option<PathBuf>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_nms")]
    pub nms: f32,
    #[serde(default = "default_input_size")]
    pub input_size: i32,
    #[serde(default = "default_adult_min_height")]
    pub adult_min_height: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: None,
            model_config: None,
            labels: None,
            confidence: default_confidence(),
            nms: default_nms(),
            input_size: default_input_size(),
            adult_min_height: default_adult_min_height(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    4
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            queue_capacity: default_queue_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_tick_ms() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub detection: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            background: false,
            detection: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub locator: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub source: Option<SourceConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f32| {
            if v > 0.0 && v <= 1.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be in (0, 1], got {v}")))
            }
        };
        unit("detection.confidence", self.detection.confidence)?;
        unit("detection.nms", self.detection.nms)?;

        if self.detection.input_size <= 0 {
            return Err(ConfigError::Invalid("detection.input_size must be positive".into()));
        }
        if self.motion.kernel_size <= 0 || self.motion.kernel_size % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "motion.kernel_size must be a positive odd number, got {}",
                self.motion.kernel_size
            )));
        }
        if self.motion.min_blob_area < 0.0 {
            return Err(ConfigError::Invalid("motion.min_blob_area must not be negative".into()));
        }
        if self.runner.tick_ms == 0 {
            return Err(ConfigError::Invalid("runner.tick_ms must be positive".into()));
        }
        if self.stream.queue_capacity == 0 {
            return Err(ConfigError::Invalid("stream.queue_capacity must be positive".into()));
        }
        if self.stream.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("stream.connect_timeout_secs must be positive".into()));
        }
        if self.stream.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("stream.max_frame_bytes must be positive".into()));
        }
        Ok(())
    }
}
