use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Largest accepted ingestion batch
pub const MAX_BATCH_SIZE: usize = 5000;

/// Main configuration for the storage tools
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Ingestion configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Video catalog configuration
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (`postgres://…` or `sqlite:…`)
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// How keypoints are laid out in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One `pose_keypoints` row per landmark
    #[default]
    Normalized,
    /// Keypoints embedded as JSON on the sequence row
    Denormalized,
}

/// What to do when a video already has pose data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExistingDataPolicy {
    /// Delete existing sequences and write the new set
    #[default]
    Replace,
    /// Leave existing data untouched and write nothing
    Skip,
}

/// Ingestion configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Storage strategy
    #[serde(default)]
    pub strategy: Strategy,
    /// Frames buffered per flush, also the row limit per INSERT
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Existing-data policy
    #[serde(default)]
    pub on_existing: ExistingDataPolicy,
}

/// Defaults for videos created by the catalog resolver
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_category")]
    pub default_category: String,
    #[serde(default = "default_difficulty")]
    pub default_difficulty: String,
    /// Description of a created video; `{source}` becomes the source name
    #[serde(default = "default_description_template")]
    pub description_template: String,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// Default value functions
fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

fn default_category() -> String {
    "taekwondo".to_string()
}

fn default_difficulty() -> String {
    "beginner".to_string()
}

fn default_description_template() -> String {
    "Extracted from {source}".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl DatabaseConfig {
    /// Defaults with the given connection URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Connection URL, which every store command requires
    pub fn require_url(&self) -> Result<&str, ConfigValidationError> {
        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url),
            _ => Err(ConfigValidationError::MissingField(
                "database.url (or DATABASE_URL)",
            )),
        }
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.require_url()?;

        if self.max_connections == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.max_connections",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.min_connections",
                reason: format!("exceeds max_connections ({})", self.max_connections),
            });
        }

        Ok(())
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            batch_size: default_batch_size(),
            on_existing: ExistingDataPolicy::default(),
        }
    }
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingestion.batch_size",
                reason: format!("{} is outside 1..={MAX_BATCH_SIZE}", self.batch_size),
            });
        }
        Ok(())
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_category: default_category(),
            default_difficulty: default_difficulty(),
            description_template: default_description_template(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl StorageConfig {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, config::ConfigError> {
        load_layered()
    }

    /// Check everything a store command needs
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.database.validate()?;
        self.ingestion.validate()?;
        Ok(())
    }
}

/// Load any configuration shape from the shared layered sources.
///
/// Order, lowest precedence first: `config/kata.*`, `/etc/kata/kata.*`,
/// `KATA__SECTION__KEY` variables, then `DATABASE_URL` for `database.url`.
/// A `.env` file in the working directory is read into the environment first.
pub fn load_layered<T: DeserializeOwned>() -> Result<T, config::ConfigError> {
    dotenvy::dotenv().ok();

    let config = config::Config::builder()
        // Add config file if present
        .add_source(config::File::with_name("config/kata").required(false))
        .add_source(config::File::with_name("/etc/kata/kata").required(false))
        // Override with environment variables
        // KATA__INGESTION__BATCH_SIZE -> ingestion.batch_size
        .add_source(
            config::Environment::with_prefix("KATA")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = StorageConfig::default();
        assert_eq!(config.ingestion.batch_size, 1000);
        assert_eq!(config.ingestion.strategy, Strategy::Normalized);
        assert_eq!(config.ingestion.on_existing, ExistingDataPolicy::Replace);
        assert_eq!(config.catalog.default_category, "taekwondo");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.database.run_migrations);
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let config = StorageConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));

        let blank = DatabaseConfig::with_url("   ");
        assert!(blank.require_url().is_err());
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut ingestion = IngestionConfig::default();
        ingestion.batch_size = 0;
        assert!(ingestion.validate().is_err());
        ingestion.batch_size = MAX_BATCH_SIZE + 1;
        assert!(ingestion.validate().is_err());
        ingestion.batch_size = MAX_BATCH_SIZE;
        assert!(ingestion.validate().is_ok());
    }

    #[test]
    fn test_pool_bounds() {
        let mut database = DatabaseConfig::with_url("sqlite::memory:");
        database.min_connections = 8;
        database.max_connections = 4;
        assert!(matches!(
            database.validate(),
            Err(ConfigValidationError::InvalidValue { field: "database.min_connections", .. })
        ));
    }

    #[test]
    fn test_enums_deserialize_snake_case() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"ingestion": {"strategy": "denormalized", "on_existing": "skip"},
                "logging": {"format": "pretty"}}"#,
        )
        .unwrap();
        assert_eq!(config.ingestion.strategy, Strategy::Denormalized);
        assert_eq!(config.ingestion.on_existing, ExistingDataPolicy::Skip);
        assert_eq!(config.ingestion.batch_size, 1000);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }
}
