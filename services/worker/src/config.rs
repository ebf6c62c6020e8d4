use plate_capture::CaptureConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the plate worker
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Plate validation policy
    #[serde(default)]
    pub region: RegionConfig,
    /// Vehicle registry client configuration
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Feature switches
    #[serde(default)]
    pub features: FeatureFlags,
    /// Segment buffer and clip extraction configuration
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
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
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// API configuration for the webhook and playback endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body (webhooks carry base64 thumbnails)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// How registry results decide whether a detection is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionMode {
    /// Registry is authoritative; unknown plates are dropped
    Strict,
    /// Every sanitized plate is kept; the registry only enriches
    Permissive,
}

/// Plate validation policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    #[serde(default = "default_region_mode")]
    pub mode: RegionMode,
}

/// Vehicle registry (DVLA vehicle enquiry) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Vehicle enquiry endpoint
    #[serde(default = "default_registry_url")]
    pub api_url: String,
    /// API key sent as `x-api-key`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_registry_timeout_secs")]
    pub timeout_secs: u64,
}

/// Feature switches
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureFlags {
    /// Record the camera stream and cut clips for persisted detections
    #[serde(default)]
    pub video_capture: bool,
    /// Look up permissive-mode plates in the registry for vehicle details
    #[serde(default)]
    pub registry_enrichment: bool,
}

// Default value functions
fn default_service_name() -> String {
    "plate-worker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_region_mode() -> RegionMode {
    RegionMode::Strict
}

fn default_registry_url() -> String {
    "https://driver-vehicle-licensing.api.gov.uk/vehicle-enquiry/v1/vehicles".to_string()
}

fn default_registry_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "plate-worker")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/worker").required(false))
            .add_source(config::File::with_name("/etc/plate-tracker/worker").required(false))
            // Override with environment variables
            // PLATE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("PLATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.region.mode == RegionMode::Strict && self.registry.key().is_none() {
            return Err(ConfigValidationError::MissingField(
                "registry.api_key (required in strict region mode)".to_string(),
            ));
        }

        if self.registry.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "registry.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.features.video_capture {
            self.capture.validate()?;
        }

        Ok(())
    }

    /// Whether a registry client should be built at all.
    pub fn registry_enabled(&self) -> bool {
        self.registry.key().is_some()
            && (self.region.mode == RegionMode::Strict || self.features.registry_enrichment)
    }
}

impl RegistryConfig {
    /// API key, ignoring blank values.
    pub fn key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            mode: default_region_mode(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            api_url: default_registry_url(),
            api_key: None,
            timeout_secs: default_registry_timeout_secs(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid capture configuration: {0}")]
    Capture(#[from] plate_capture::ConfigValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/plates".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_secs: 30,
                idle_timeout_secs: 600,
                run_migrations: true,
            },
            api: ApiConfig::default(),
            region: RegionConfig::default(),
            registry: RegistryConfig {
                api_key: Some("test-key".to_string()),
                ..RegistryConfig::default()
            },
            features: FeatureFlags::default(),
            capture: CaptureConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_region_mode(), RegionMode::Strict);
        assert_eq!(default_max_body_bytes(), 10 * 1024 * 1024);
        assert_eq!(default_registry_timeout_secs(), 10);
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_strict_mode_requires_api_key() {
        let mut config = create_test_config();
        config.registry.api_key = Some("   ".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_permissive_mode_without_api_key() {
        let mut config = create_test_config();
        config.region.mode = RegionMode::Permissive;
        config.registry.api_key = None;
        config.features.registry_enrichment = true;
        assert!(config.validate().is_ok());
        assert!(!config.registry_enabled());
    }

    #[test]
    fn test_registry_enabled_follows_policy() {
        let mut config = create_test_config();
        assert!(config.registry_enabled());

        config.region.mode = RegionMode::Permissive;
        assert!(!config.registry_enabled());

        config.features.registry_enrichment = true;
        assert!(config.registry_enabled());
    }

    #[test]
    fn test_video_capture_validates_capture_section() {
        let mut config = create_test_config();
        config.features.video_capture = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::Capture(_))
        ));

        config.capture.stream.url = "rtsp://camera:554/stream".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_region_mode_deserializes_lowercase() {
        let mode: RegionMode = serde_json::from_str("\"permissive\"").unwrap();
        assert_eq!(mode, RegionMode::Permissive);
    }
}
