//! Configuration module for currency-telemetry
//!
//! Handles loading and parsing of the YAML telemetry configuration with
//! support for environment variable expansion, environment overrides and
//! validation. No endpoint or credential has a built-in value: they come
//! from the file or from the environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Connection string override (`InstrumentationKey=...;IngestionEndpoint=...`)
pub const ENV_CONNECTION_STRING: &str = "APPINSIGHT_CONNECTION_STRING";
/// OTLP collector address override
pub const ENV_OTLP_SERVICE_ADDR: &str = "OTLP_SERVICE_ADDR";
/// Service name override
pub const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Sampling ratio override
pub const ENV_SAMPLE_RATIO: &str = "TRACE_SAMPLE_RATIO";
/// Any non-empty value disables tracing
pub const ENV_DISABLE_TRACING: &str = "DISABLE_TRACING";

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Whether `s` still holds an unexpanded `${VAR}` placeholder
fn is_unexpanded(s: &str) -> bool {
    s.contains("${")
}

/// Validate that a URL starts with http:// or https://
pub(crate) fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Tracing pipeline configuration for one service.
///
/// # Example
///
/// ```yaml
/// enabled: true
/// service_name: "currencyservice"
/// exporter:
///   kind: "azure_monitor"
///   connection_string: "${APPINSIGHT_CONNECTION_STRING}"
/// sampling:
///   strategy: "application_insights"
///   ratio: 0.1
/// processor:
///   mode: "batch"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable or disable tracing. Default: true
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// `service.name` resource attribute. Default: "currencyservice"
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Extra static resource attributes attached to every span
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,

    /// Keep the process running without telemetry when initialization fails
    #[serde(default)]
    pub fail_open: bool,

    #[serde(default)]
    pub exporter: ExporterConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            service_name: default_service_name(),
            resource_attributes: HashMap::new(),
            fail_open: false,
            exporter: ExporterConfig::default(),
            sampling: SamplingConfig::default(),
            processor: ProcessorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_service_name() -> String {
    "currencyservice".to_string()
}

impl TelemetryConfig {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized environment variables on top of this configuration
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = non_empty_env(ENV_CONNECTION_STRING) {
            self.exporter.connection_string = Some(value);
        }

        if let Some(value) = non_empty_env(ENV_OTLP_SERVICE_ADDR) {
            self.exporter.otlp_endpoint = value;
        }

        if let Some(value) = non_empty_env(ENV_SERVICE_NAME) {
            self.service_name = value;
        }

        if let Some(value) = non_empty_env(ENV_SAMPLE_RATIO) {
            self.sampling.ratio = value.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "{} must be a number between 0.0 and 1.0, got '{}'",
                    ENV_SAMPLE_RATIO, value
                ))
            })?;
        }

        if non_empty_env(ENV_DISABLE_TRACING).is_some() {
            self.enabled = false;
        }

        Ok(())
    }

    /// Validate the configuration
    ///
    /// A disabled configuration is always valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.service_name.trim().is_empty() || is_unexpanded(&self.service_name) {
            return Err(ConfigError::ValidationError(
                "Service name cannot be empty when tracing is enabled".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.sampling.ratio) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid sampling ratio {}: must be between 0.0 and 1.0",
                self.sampling.ratio
            )));
        }

        if self.exporter.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "Exporter timeout must be at least one second".into(),
            ));
        }

        match self.exporter.kind {
            ExporterKind::AzureMonitor => match self.exporter.connection_string.as_deref() {
                Some(cs) if !cs.trim().is_empty() && !is_unexpanded(cs) => {}
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "Azure Monitor exporter requires a connection string (set exporter.connection_string or {})",
                        ENV_CONNECTION_STRING
                    )))
                }
            },
            ExporterKind::Otlp => {
                if !is_valid_http_url(&self.exporter.otlp_endpoint) {
                    return Err(ConfigError::ValidationError(
                        "Invalid OTLP endpoint: must start with http:// or https://".into(),
                    ));
                }
            }
            ExporterKind::None => {}
        }

        if self.processor.mode == ProcessorMode::Batch {
            let batch = &self.processor.batch;
            if batch.max_queue_size == 0 || batch.max_export_batch_size == 0 {
                return Err(ConfigError::ValidationError(
                    "Batch queue and export sizes must be greater than zero".into(),
                ));
            }
            if batch.max_export_batch_size > batch.max_queue_size {
                return Err(ConfigError::ValidationError(format!(
                    "max_export_batch_size ({}) cannot exceed max_queue_size ({})",
                    batch.max_export_batch_size, batch.max_queue_size
                )));
            }
        }

        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Span exporter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExporterKind {
    /// Application Insights ingestion over HTTPS
    AzureMonitor,
    /// OTLP over gRPC
    Otlp,
    /// Spans are sampled and processed but not shipped anywhere
    None,
}

/// Exporter destination and credential.
///
/// ```yaml
/// exporter:
///   kind: "azure_monitor"
///   connection_string: "${APPINSIGHT_CONNECTION_STRING}"
///   timeout_seconds: 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Default: azure_monitor
    #[serde(default = "default_exporter_kind")]
    pub kind: ExporterKind,

    /// Application Insights connection string. Supports ${VAR} expansion.
    #[serde(default)]
    pub connection_string: Option<String>,

    /// OTLP collector endpoint, used when `kind` is `otlp`
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Timeout for a single export in seconds. Default: 10
    #[serde(default = "default_export_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            kind: default_exporter_kind(),
            connection_string: None,
            otlp_endpoint: default_otlp_endpoint(),
            timeout_seconds: default_export_timeout(),
        }
    }
}

fn default_exporter_kind() -> ExporterKind {
    ExporterKind::AzureMonitor
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_export_timeout() -> u64 {
    10
}

/// Sampling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    Always,
    Never,
    /// Trace ID ratio, ignoring the parent decision
    Ratio,
    /// Follow the parent decision, trace ID ratio for roots
    ParentBased,
    /// Application Insights compatible trace ID hash
    ApplicationInsights,
}

/// Trace sampling configuration.
///
/// ```yaml
/// sampling:
///   strategy: "application_insights"
///   ratio: 0.1  # Keep 10% of traces
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Default: application_insights
    #[serde(default = "default_sampling_strategy")]
    pub strategy: SamplingStrategy,

    /// Fraction of traces kept (0.0 to 1.0). Default: 0.1
    #[serde(default = "default_sampling_ratio")]
    pub ratio: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: default_sampling_strategy(),
            ratio: default_sampling_ratio(),
        }
    }
}

fn default_sampling_strategy() -> SamplingStrategy {
    SamplingStrategy::ApplicationInsights
}

fn default_sampling_ratio() -> f64 {
    0.1
}

/// How finished spans reach the exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorMode {
    /// Each span is exported on its own as soon as it ends
    Simple,
    /// Spans are queued and exported in batches on the Tokio runtime
    Batch,
}

/// Span processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Default: batch
    #[serde(default = "default_processor_mode")]
    pub mode: ProcessorMode,

    #[serde(default)]
    pub batch: BatchConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            mode: default_processor_mode(),
            batch: BatchConfig::default(),
        }
    }
}

fn default_processor_mode() -> ProcessorMode {
    ProcessorMode::Batch
}

/// Batch span processor configuration.
///
/// The processor exports when either the batch size or the scheduled delay
/// is reached. Spans beyond `max_queue_size` are dropped.
///
/// ```yaml
/// batch:
///   max_queue_size: 2048
///   scheduled_delay_millis: 5000
///   max_export_batch_size: 512
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Default: 2048
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Default: 5000 (5 seconds)
    #[serde(default = "default_scheduled_delay")]
    pub scheduled_delay_millis: u64,

    /// Default: 512
    #[serde(default = "default_max_export_batch_size")]
    pub max_export_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            scheduled_delay_millis: default_scheduled_delay(),
            max_export_batch_size: default_max_export_batch_size(),
        }
    }
}

fn default_max_queue_size() -> usize {
    2048
}

fn default_scheduled_delay() -> u64 {
    5000
}

fn default_max_export_batch_size() -> usize {
    512
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Console logging configuration. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}
