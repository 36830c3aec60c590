//! Service configuration, read once at startup.
//!
//! Values come from the process environment, with a `.env` file filling in
//! anything unset. Every variable has a development default, so an empty
//! environment yields a working local setup.
//!
//! # Rate Limiting
//!
//! - `API_RATE_LIMIT_WINDOW_SECS` / `API_RATE_LIMIT_MAX`: general API profile (default 100 per 15 min)
//! - `CUSTOM_QUERY_RATE_LIMIT_WINDOW_SECS` / `CUSTOM_QUERY_RATE_LIMIT_MAX`: custom query profile
//!   (default 20 per 5 min)
//!
//! # Security Configuration
//!
//! - `APP_ENV`: `development`, `production` or `test`. Internal error messages are only
//!   returned to clients in development.
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated origins for the strict CORS profile
//!
//! # Query Limits
//!
//! - `QUERY_TIMEOUT_MS`: Upper bound for one data store call (default: 30000)
//! - `CUSTOM_QUERY_MAX_LIMIT` / `CUSTOM_QUERY_DEFAULT_LIMIT`: limit clamp (default: 100 / 20)

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Window and cap for one rate limiter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitProfile {
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitProfile {
    pub const fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// General API profile: 100 requests per 15 minutes.
    pub const fn api() -> Self {
        Self::new(Duration::from_secs(15 * 60), 100)
    }

    /// Custom query profile: 20 requests per 5 minutes.
    pub const fn custom_query() -> Self {
        Self::new(Duration::from_secs(5 * 60), 20)
    }
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Runtime settings for the gateway.
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// let state = AppState::new(config, Arc::new(MemoryStore::new()));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment environment (default: development)
    pub environment: Environment,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Profile for catalog and listing endpoints
    pub api_rate_limit: RateLimitProfile,

    /// Stricter profile for the custom query endpoint
    pub custom_query_rate_limit: RateLimitProfile,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Origins accepted by the strict CORS profile.
    /// Example: `<https://app.example.com>,<https://admin.example.com>`
    pub cors_allowed_origins: Vec<String>,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Query Configuration
    // =========================================================================
    /// Timeout for a single data store call (default: 30 seconds)
    pub query_timeout: Duration,

    /// Upper bound for `options.limit` on custom queries (default: 100)
    pub custom_query_max_limit: u32,

    /// Limit applied when `options.limit` is absent or zero (default: 20)
    pub custom_query_default_limit: u32,

    // =========================================================================
    // Data Store Configuration
    // =========================================================================
    /// JSON file `{collection: [documents]}` loaded at startup
    pub seed_file: Option<PathBuf>,

    /// Create text and geospatial indexes at startup (default: true)
    pub ensure_indexes_on_startup: bool,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level filter (e.g., "info", "debug", "query_gateway=trace")
    pub log_level: String,

    /// Human-readable or JSON log lines
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value fails to parse or the combination
    /// is inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let environment: Environment = Self::parse_env("APP_ENV", Environment::Development)?;

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            environment,

            // Rate limiting
            api_rate_limit: RateLimitProfile::new(
                Duration::from_secs(Self::parse_env("API_RATE_LIMIT_WINDOW_SECS", 900)?),
                Self::parse_env("API_RATE_LIMIT_MAX", 100)?,
            ),
            custom_query_rate_limit: RateLimitProfile::new(
                Duration::from_secs(Self::parse_env(
                    "CUSTOM_QUERY_RATE_LIMIT_WINDOW_SECS",
                    300,
                )?),
                Self::parse_env("CUSTOM_QUERY_RATE_LIMIT_MAX", 20)?,
            ),

            // Security
            cors_allowed_origins: Self::parse_cors_origins(environment),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,

            // Queries
            query_timeout: Duration::from_millis(Self::parse_env("QUERY_TIMEOUT_MS", 30_000)?),
            custom_query_max_limit: Self::parse_env("CUSTOM_QUERY_MAX_LIMIT", 100)?,
            custom_query_default_limit: Self::parse_env("CUSTOM_QUERY_DEFAULT_LIMIT", 20)?,

            // Data store
            seed_file: env::var("SEED_FILE")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            ensure_indexes_on_startup: Self::parse_env("ENSURE_INDEXES_ON_STARTUP", true)?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Inconsistent` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in [
            ("API_RATE_LIMIT", &self.api_rate_limit),
            ("CUSTOM_QUERY_RATE_LIMIT", &self.custom_query_rate_limit),
        ] {
            if profile.window.is_zero() {
                return Err(ConfigError::Inconsistent(format!(
                    "{name}_WINDOW_SECS must be greater than 0"
                )));
            }
            if profile.max_requests == 0 {
                return Err(ConfigError::Inconsistent(format!(
                    "{name}_MAX must be greater than 0"
                )));
            }
        }

        if self.custom_query_max_limit == 0 {
            return Err(ConfigError::Inconsistent(
                "CUSTOM_QUERY_MAX_LIMIT must be greater than 0".to_string(),
            ));
        }

        if self.custom_query_default_limit == 0
            || self.custom_query_default_limit > self.custom_query_max_limit
        {
            return Err(ConfigError::Inconsistent(format!(
                "CUSTOM_QUERY_DEFAULT_LIMIT ({}) must be between 1 and CUSTOM_QUERY_MAX_LIMIT ({})",
                self.custom_query_default_limit, self.custom_query_max_limit
            )));
        }

        if self.query_timeout.is_zero() {
            return Err(ConfigError::Inconsistent(
                "QUERY_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        // Validate max request body size is reasonable
        if self.max_request_body_size == 0 {
            return Err(ConfigError::Inconsistent(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Ok(default),
        }
    }

    /// Parse strict-profile CORS origins, falling back to local dev origins in development.
    fn parse_cors_origins(environment: Environment) -> Vec<String> {
        match env::var("CORS_ALLOWED_ORIGINS") {
            Ok(raw) => split_origins(&raw),
            Err(_) => default_origins(environment),
        }
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_origins(environment: Environment) -> Vec<String> {
    match environment {
        Environment::Production => Vec::new(),
        Environment::Development | Environment::Test => vec![
            "http://localhost:3000".to_string(),
            "http://127.0.0.1:3000".to_string(),
        ],
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: Environment::Development,
            api_rate_limit: RateLimitProfile::api(),
            custom_query_rate_limit: RateLimitProfile::custom_query(),
            cors_allowed_origins: default_origins(Environment::Development),
            max_request_body_size: 1024 * 1024,
            query_timeout: Duration::from_secs(30),
            custom_query_max_limit: 100,
            custom_query_default_limit: 20,
            seed_file: None,
            ensure_indexes_on_startup: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.api_rate_limit.max_requests, 100);
        assert_eq!(config.api_rate_limit.window, Duration::from_secs(900));
        assert_eq!(config.custom_query_rate_limit.max_requests, 20);
        assert_eq!(config.custom_query_rate_limit.window, Duration::from_secs(300));
        assert_eq!(config.custom_query_max_limit, 100);
        assert_eq!(config.custom_query_default_limit, 20);
        assert!(config.environment.is_development());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "localhost".to_string(),
            port: 3000,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "localhost:3000");
    }

    #[test]
    fn test_metrics_addr_disabled() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("production".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!("Dev".parse::<Environment>(), Ok(Environment::Development));
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_split_origins() {
        let origins = split_origins(" https://a.example.com/ , ,https://b.example.com");
        assert_eq!(origins, vec!["https://a.example.com", "https://b.example.com"]);
    }

    #[test]
    fn test_production_has_no_default_origins() {
        assert!(default_origins(Environment::Production).is_empty());
        assert!(!default_origins(Environment::Development).is_empty());
    }

    #[test]
    fn test_validate_zero_window() {
        let config = Config {
            api_rate_limit: RateLimitProfile::new(Duration::ZERO, 10),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("API_RATE_LIMIT_WINDOW_SECS")
        );
    }

    #[test]
    fn test_validate_default_limit_above_max() {
        let config = Config {
            custom_query_default_limit: 200,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("CUSTOM_QUERY_DEFAULT_LIMIT")
        );
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
