use std::collections::HashSet;
use std::time::Duration;

use config::{Config, Environment, File};
use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_aux::field_attributes::deserialize_number_from_string;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use validator::{Validate, ValidationError};

use crate::error::{AppError, ErrorExposure};
use crate::models::City;

static LOG_LEVEL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(trace|debug|info|warn|error|TRACE|DEBUG|INFO|WARN|ERROR)$")
        .expect("Invalid regex pattern")
});

#[derive(Debug, Clone, Validate, Deserialize)]
pub struct AppConfig {
    #[validate(nested)]
    pub app: AppMetadata,

    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub database: DatabaseConfig,

    #[validate(length(min = 1), nested)]
    pub cities: Vec<CityDatabaseConfig>,

    #[validate(nested)]
    pub cors: CorsConfig,

    #[validate(nested)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default = "default_environment")]
    #[serde(skip)]
    pub environment: EnvironmentType,
}

impl AppConfig {
    /// Raw error messages are only shown during development.
    pub fn error_exposure(&self) -> ErrorExposure {
        match self.environment {
            EnvironmentType::Development => ErrorExposure::Debug,
            _ => ErrorExposure::Safe,
        }
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
pub struct AppMetadata {
    #[validate(length(min = 1, max = 100))]
    pub name: String,

    #[validate(length(min = 1, max = 20))]
    pub version: String,
}

#[derive(Debug, Clone, Validate, Deserialize)]
pub struct ServerConfig {
    #[validate(range(min = 1024, max = 65535))]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,

    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 300))]
    pub request_timeout_seconds: u64,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Pool settings shared by every city database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout_seconds")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub acquire_timeout_seconds: u64,

    #[serde(default = "default_max_lifetime")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_lifetime_seconds: u64,

    #[serde(default = "default_idle_timeout")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub idle_timeout_seconds: u64,

    #[serde(default = "default_health_check_timeout_seconds")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub health_check_timeout_seconds: u64,

    #[serde(default = "default_health_check_acquire_timeout_ms")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub health_check_acquire_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }

    pub fn health_check_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_acquire_timeout_ms)
    }
}

impl Validate for DatabaseConfig {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        if self.max_connections < 1 || self.max_connections > 100 {
            errors.add("max_connections", ValidationError::new("range"));
        }

        if self.acquire_timeout_seconds == 0 {
            errors.add("acquire_timeout_seconds", ValidationError::new("range"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CityDatabaseConfig {
    pub code: String,

    #[serde(skip_serializing, deserialize_with = "deserialize_secret_string")]
    pub url: SecretString,
}

impl CityDatabaseConfig {
    pub fn city(&self) -> Result<City, AppError> {
        City::new(&self.code)
    }
}

impl Validate for CityDatabaseConfig {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        if City::new(&self.code).is_err() {
            errors.add("code", ValidationError::new("city_code"));
        }

        if self.url.expose_secret().is_empty() {
            errors.add("url", ValidationError::new("database_url_empty"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
pub struct CorsConfig {
    #[validate(length(min = 1))]
    pub allowed_origins: String,

    #[serde(default = "default_true")]
    pub allow_credentials: bool,

    #[validate(range(min = 0, max = 86400))]
    #[serde(default = "default_max_age")]
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_age_seconds: u64,

    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,
}

impl CorsConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }

    pub fn is_wildcard(&self) -> bool {
        self.allowed_origins.trim() == "*"
    }

    pub fn validate_production_origins(&self) -> Result<Vec<String>, AppError> {
        if self.is_wildcard() {
            return Err(AppError::ConfigError("Wildcard not allowed".into()));
        }

        let origins: Vec<String> = self
            .allowed_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if origins.is_empty() {
            return Err(AppError::ConfigError("No valid origins found".into()));
        }

        for origin in &origins {
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                return Err(AppError::ConfigError(format!(
                    "Origin must start with http:// or https://: {}",
                    origin
                )));
            }
        }

        Ok(origins)
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
pub struct ObservabilityConfig {
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,

    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVEL_REGEX.is_match(level) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Staff user ids allowed to call the API. Empty disables the check.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub white_list: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EnvironmentType {
    #[serde(rename = "development")]
    Development,
    #[serde(rename = "staging")]
    Staging,
    #[serde(rename = "production")]
    Production,
    #[serde(rename = "test")]
    Test,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Test => "test",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

fn default_environment() -> EnvironmentType {
    EnvironmentType::Development
}

fn deserialize_secret_string<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s.trim().is_empty() {
        return Err(serde::de::Error::custom("database url cannot be empty"));
    }
    Ok(SecretString::from(s))
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    0
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_acquire_timeout_seconds() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_age() -> u64 {
    3600
}

fn default_health_check_timeout_seconds() -> u64 {
    3
}

fn default_health_check_acquire_timeout_ms() -> u64 {
    500
}

fn default_cors_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

pub fn environment_from_env() -> EnvironmentType {
    let environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "development".into())
        .to_lowercase();

    match environment.as_str() {
        "production" | "prod" => EnvironmentType::Production,
        "staging" | "stg" => EnvironmentType::Staging,
        "test" | "testing" => EnvironmentType::Test,
        _ => EnvironmentType::Development,
    }
}

pub fn load_config() -> Result<AppConfig, AppError> {
    let env_type = environment_from_env();

    tracing::info!(
        "Loading configuration for environment: {}",
        env_type.as_str()
    );

    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{}", env_type.as_str())).required(false))
        .add_source(File::with_name("config/local").required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("security.white_list")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to build config: {}", e)))?;

    let mut app_config: AppConfig = config
        .try_deserialize()
        .map_err(|e| AppError::ConfigError(format!("Failed to deserialize config: {}", e)))?;

    app_config.environment = env_type;

    app_config
        .validate()
        .map_err(|e| AppError::ConfigError(format!("Configuration validation failed: {}", e)))?;

    validate_business_rules(&app_config)?;

    log_config_loaded(&app_config);

    Ok(app_config)
}

fn validate_business_rules(config: &AppConfig) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for city in &config.cities {
        let code = city.city()?;
        if !seen.insert(code.clone()) {
            return Err(AppError::ConfigError(format!(
                "City {} is configured more than once",
                code
            )));
        }
    }

    if config.environment.is_production() {
        if config.cors.is_wildcard() {
            return Err(AppError::ConfigError(
                "CORS wildcard (*) is strictly forbidden in production. \
                     Configure specific allowed origins in APP__CORS__ALLOWED_ORIGINS \
                     or config/production.yaml"
                    .into(),
            ));
        }

        if config.security.white_list.is_empty() {
            tracing::warn!(
                "Security white list is empty in production; every caller will be accepted."
            );
        }
    }

    if config.database.max_connections <= config.database.min_connections {
        return Err(AppError::ConfigError(
            "database.max_connections must be greater than database.min_connections".into(),
        ));
    }

    Ok(())
}

fn log_config_loaded(config: &AppConfig) {
    let cities: Vec<&str> = config.cities.iter().map(|c| c.code.as_str()).collect();

    tracing::info!(
        environment = %config.environment.as_str(),
        server_host = %config.server.host,
        server_port = %config.server.port,
        cities = ?cities,
        database_max_connections = %config.database.max_connections,
        white_list_size = %config.security.white_list.len(),
        log_level = %config.observability.log_level,
        metrics_enabled = %config.observability.enable_metrics,
        "Configuration loaded successfully"
    );
}

pub fn create_cors_layer(config: &CorsConfig) -> Result<CorsLayer, AppError> {
    let allowed_origins = if config.is_wildcard() {
        AllowOrigin::any()
    } else {
        let origins = config.validate_production_origins()?;
        let parsed: Vec<_> = origins
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::ConfigError(format!("Invalid CORS origin format: {}", e)))?;
        AllowOrigin::list(parsed)
    };

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();

    // Credentials cannot be combined with wildcard origins or headers.
    let allow_credentials = config.allow_credentials && !config.is_wildcard();
    let allowed_headers = if allow_credentials {
        AllowHeaders::mirror_request()
    } else {
        AllowHeaders::any()
    };

    Ok(CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods(methods)
        .allow_headers(allowed_headers)
        .allow_credentials(allow_credentials)
        .max_age(config.max_age()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cors(origins: &str) -> CorsConfig {
        CorsConfig {
            allowed_origins: origins.to_string(),
            allow_credentials: true,
            max_age_seconds: 60,
            allowed_methods: default_cors_methods(),
        }
    }

    #[test]
    fn production_origins_must_be_http() {
        assert!(cors("*").validate_production_origins().is_err());
        assert!(cors("ftp://stats.local").validate_production_origins().is_err());

        let origins = cors("https://stats.local, http://localhost:3000")
            .validate_production_origins()
            .unwrap();
        assert_eq!(origins, vec!["https://stats.local", "http://localhost:3000"]);
    }

    #[test]
    fn city_database_requires_valid_code() {
        let city = CityDatabaseConfig {
            code: "vlg".into(),
            url: SecretString::from("postgres://localhost/vlg"),
        };
        assert!(city.validate().is_ok());
        assert_eq!(city.city().unwrap().as_str(), "VLG");

        let bad = CityDatabaseConfig {
            code: "volgograd-1".into(),
            url: SecretString::from("postgres://localhost/vlg"),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn log_level_is_checked() {
        assert!(validate_log_level("debug").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }
}
