//! Configuration management
//!
//! This module handles loading, validation, and management of the Pulse
//! configuration. Configuration is stored in TOML format at
//! ~/.pulse/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory, log level
//! - **pipeline**: Session grouping and batch scheduling thresholds
//! - **classifier**: Completion service endpoint, model, retry policy, rates
//! - **registry**: Conservative project creation and merge rules
//!
//! The API key for the completion service is never stored in the file; it
//! is read from the `PULSE_API_KEY` environment variable.
//!
//! # Path Expansion
//!
//! Paths support ~ expansion to the user's home directory. The data
//! directory is created on first load if it doesn't exist.

use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable holding the completion service API key.
pub const API_KEY_ENV: &str = "PULSE_API_KEY";

/// Main configuration structure
///
/// Constructed once at startup and passed by reference into each
/// component; no component performs implicit global lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Session grouping and batch scheduling settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Completion service settings
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Project registry settings
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Session grouping and batch scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Inactivity gap that closes a session, in minutes
    #[serde(default = "default_session_gap_minutes")]
    pub session_gap_minutes: u64,

    /// Minimum time between processing runs, in hours
    #[serde(default = "default_processing_interval_hours")]
    pub processing_interval_hours: u64,

    /// Minimum estimated token count for a batch to be worth running
    #[serde(default = "default_min_batch_tokens")]
    pub min_batch_tokens: i64,

    /// Alternative floor: minimum pending event count
    #[serde(default = "default_min_batch_events")]
    pub min_batch_events: usize,

    /// Character budget for one batch's context
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Cap on the cooldown interval multiplier after consecutive failures
    #[serde(default = "default_cooldown_max_multiplier")]
    pub cooldown_max_multiplier: u32,

    /// Age after which a running batch is considered abandoned, in minutes
    #[serde(default = "default_stale_batch_minutes")]
    pub stale_batch_minutes: u64,

    /// Scheduler tick period, in seconds
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

/// Completion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Base URL for the OpenAI-compatible completion API
    #[serde(default = "default_classifier_base_url")]
    pub base_url: String,

    /// Model identifier
    #[serde(default = "default_classifier_model")]
    pub model: String,

    /// Maximum attempts for transient failures
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Base delay for exponential backoff in ms
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay between retries in ms
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter factor 0.0-1.0
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bounded "ask the service to reformat" attempts on malformed output
    #[serde(default = "default_max_reformat_attempts")]
    pub max_reformat_attempts: u32,

    /// Cost per 1000 input tokens in USD
    #[serde(default = "default_input_cost_per_1k")]
    pub input_cost_per_1k: f64,

    /// Cost per 1000 output tokens in USD
    #[serde(default = "default_output_cost_per_1k")]
    pub output_cost_per_1k: f64,
}

/// Project registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Name similarity at or above which a proposal folds into an
    /// existing project
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Minimum accumulated activities before a project is created
    #[serde(default = "default_min_activities_for_project")]
    pub min_activities_for_project: usize,

    /// Minimum distinct calendar days those activities must span
    #[serde(default = "default_min_distinct_days_for_project")]
    pub min_distinct_days_for_project: usize,

    /// Bucket that receives activities of unproven proposals
    #[serde(default = "default_project_bucket")]
    pub default_project_bucket: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.pulse")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_session_gap_minutes() -> u64 {
    60
}

fn default_processing_interval_hours() -> u64 {
    6
}

fn default_min_batch_tokens() -> i64 {
    1000
}

fn default_min_batch_events() -> usize {
    10
}

fn default_max_context_chars() -> usize {
    50_000
}

fn default_cooldown_max_multiplier() -> u32 {
    8
}

fn default_stale_batch_minutes() -> u64 {
    120
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_classifier_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_classifier_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_reformat_attempts() -> u32 {
    2
}

fn default_input_cost_per_1k() -> f64 {
    0.000_15
}

fn default_output_cost_per_1k() -> f64 {
    0.000_6
}

fn default_similarity_threshold() -> f64 {
    0.75
}

fn default_min_activities_for_project() -> usize {
    3
}

fn default_min_distinct_days_for_project() -> usize {
    2
}

fn default_project_bucket() -> String {
    "misc".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session_gap_minutes: default_session_gap_minutes(),
            processing_interval_hours: default_processing_interval_hours(),
            min_batch_tokens: default_min_batch_tokens(),
            min_batch_events: default_min_batch_events(),
            max_context_chars: default_max_context_chars(),
            cooldown_max_multiplier: default_cooldown_max_multiplier(),
            stale_batch_minutes: default_stale_batch_minutes(),
            tick_seconds: default_tick_seconds(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: default_classifier_base_url(),
            model: default_classifier_model(),
            max_retry_attempts: default_max_retry_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            request_timeout_secs: default_request_timeout_secs(),
            max_reformat_attempts: default_max_reformat_attempts(),
            input_cost_per_1k: default_input_cost_per_1k(),
            output_cost_per_1k: default_output_cost_per_1k(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_activities_for_project: default_min_activities_for_project(),
            min_distinct_days_for_project: default_min_distinct_days_for_project(),
            default_project_bucket: default_project_bucket(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            pipeline: PipelineConfig::default(),
            classifier: ClassifierConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.pulse/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default one.
    /// Validates the configuration after loading.
    pub fn load_or_create() -> Result<Self, PipelineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PipelineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| PipelineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.pulse/config.toml)
    fn default_config_path() -> Result<PathBuf, PipelineError> {
        let home = dirs::home_dir().ok_or_else(|| {
            PipelineError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(".pulse").join("config.toml"))
    }

    /// Path to the SQLite database file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("pulse.db")
    }

    /// Read the completion service API key from the environment.
    ///
    /// A missing key is a configuration error surfaced at startup of the
    /// classifier, never inside the retry path.
    pub fn api_key(&self) -> Result<String, PipelineError> {
        std::env::var(API_KEY_ENV).map_err(|_| {
            PipelineError::Config(format!(
                "Missing completion service API key: set the {} environment variable",
                API_KEY_ENV
            ))
        })
    }

    /// Validate and process configuration
    ///
    /// Validates field ranges, expands ~ in the data directory, and
    /// creates the data directory if it doesn't exist.
    fn validate_and_process(&mut self) -> Result<(), PipelineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(PipelineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !["pretty", "json"].contains(&self.core.log_format.as_str()) {
            return Err(PipelineError::Config(format!(
                "Invalid log format '{}'. Must be 'pretty' or 'json'",
                self.core.log_format
            )));
        }

        if self.classifier.model.trim().is_empty() {
            return Err(PipelineError::Config(
                "classifier.model must not be empty".to_string(),
            ));
        }

        if self.classifier.jitter_factor < 0.0 || self.classifier.jitter_factor > 1.0 {
            return Err(PipelineError::Config(
                "classifier.jitter_factor must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.classifier.max_retry_attempts == 0 {
            return Err(PipelineError::Config(
                "classifier.max_retry_attempts must be at least 1".to_string(),
            ));
        }

        if self.registry.similarity_threshold < 0.0 || self.registry.similarity_threshold > 1.0 {
            return Err(PipelineError::Config(
                "registry.similarity_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.registry.default_project_bucket.trim().is_empty() {
            return Err(PipelineError::Config(
                "registry.default_project_bucket must not be empty".to_string(),
            ));
        }

        if self.pipeline.session_gap_minutes == 0 {
            return Err(PipelineError::Config(
                "pipeline.session_gap_minutes must be at least 1".to_string(),
            ));
        }

        if self.pipeline.cooldown_max_multiplier == 0 {
            return Err(PipelineError::Config(
                "pipeline.cooldown_max_multiplier must be at least 1".to_string(),
            ));
        }

        // Expand and create the data directory
        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                PipelineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| PipelineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            PipelineError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| PipelineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
