//! Configuration for the extraction tool.
//!
//! Shares the layered sources of the storage tools (`config/kata.*`,
//! `KATA__…` variables, `DATABASE_URL`) and adds an `extraction` section.

use kata_storage::config::{
    load_layered, CatalogConfig, ConfigValidationError, DatabaseConfig, IngestionConfig,
    LoggingConfig,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the extraction tool
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

/// What the Frame Walker does with a frame it cannot decode or estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Record the frame as `pose_detected = false` and continue
    #[default]
    MarkUndetected,
    /// Stop the walk with an error
    Abort,
}

/// Frame walking configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub decode_failure_policy: DecodeFailurePolicy,

    /// Frames buffered between the decoder thread and the ingestion task
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Seconds to wait for the decoder to preroll
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    #[serde(default)]
    pub model: ModelConfig,
}

/// Pose model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// ONNX model file
    pub path: Option<PathBuf>,

    /// Square input edge in pixels
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Minimum pose-presence score for a detection
    #[serde(default = "default_presence_threshold")]
    pub presence_threshold: f32,

    /// Intra-op threads for inference
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Landmark tensor name (defaults to the first output)
    #[serde(default)]
    pub landmark_output: Option<String>,

    /// Presence score tensor name (defaults to the second output, if any)
    #[serde(default)]
    pub presence_output: Option<String>,
}

fn default_channel_capacity() -> usize {
    64
}

fn default_open_timeout_secs() -> u64 {
    10
}

fn default_input_size() -> u32 {
    256
}

fn default_presence_threshold() -> f32 {
    0.5
}

fn default_num_threads() -> usize {
    4
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            decode_failure_policy: DecodeFailurePolicy::default(),
            channel_capacity: default_channel_capacity(),
            open_timeout_secs: default_open_timeout_secs(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            input_size: default_input_size(),
            presence_threshold: default_presence_threshold(),
            num_threads: default_num_threads(),
            landmark_output: None,
            presence_output: None,
        }
    }
}

impl ExtractionConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "extraction.channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.model.input_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "extraction.model.input_size",
                reason: "must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.model.presence_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "extraction.model.presence_threshold",
                reason: format!("{} is outside 0..=1", self.model.presence_threshold),
            });
        }

        Ok(())
    }
}

impl ExtractConfig {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, config::ConfigError> {
        load_layered()
    }

    /// Checks needed before ingesting into the store
    pub fn validate_storage(&self) -> Result<(), ConfigValidationError> {
        self.database.validate()?;
        self.ingestion.validate()
    }
}
