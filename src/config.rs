//! Gateway configuration loaded from environment variables.
//!
//! All settings default to sensible development values; production deploys
//! configure via environment variables or a `.env` file.
//!
//! # Admission control
//!
//! - `GLOBAL_MAX_REQUESTS` / `GLOBAL_WINDOW_MS`: the process-wide ceiling
//! - `DEFAULT_TIER`: tier applied to anonymous and unknown-tier clients
//! - `IP_FILTER_MODE`: `allowlist` or `blocklist`
//! - `IP_ALLOWLIST` / `IP_BLOCKLIST`: comma-separated IPs
//!
//! # Persistence and logging
//!
//! - `DEVICE_STORE_PATH`: JSON document for the device registry
//! - `LOG_DIR`: enables JSONL request-log files when set
//! - `LOG_MAX_LINES`: rotation threshold per log file

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use crate::error::{GatewayError, GatewayResult};
use crate::limiter::RateLimitConfig;
use crate::middleware::{FilterMode, IpRules};

/// Service name stamped into file-log records and filenames.
pub const SERVICE_NAME: &str = "apigate";

#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 4000)
    pub port: u16,

    /// Tier table, default tier, and global ceiling.
    pub rate_limits: RateLimitConfig,

    /// IP allow/block rules applied after authentication.
    pub ip_rules: IpRules,

    /// Location of the device registry document.
    pub device_store_path: PathBuf,

    /// Directory for JSONL request logs; `None` disables file logging.
    pub log_dir: Option<PathBuf>,

    /// Rotation threshold for request-log files.
    pub log_max_lines: usize,

    /// Comma-separated CORS origins, `*` for any.
    pub cors_allowed_origins: Vec<String>,

    /// Port for the Prometheus endpoint (0 = disabled).
    pub metrics_port: u16,

    /// Log level for the tracing subscriber.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` on unparseable values or when the
    /// rate-limit invariants do not hold.
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let mut rate_limits = RateLimitConfig::default();
        rate_limits.global_limit.max_requests = Self::parse_env("GLOBAL_MAX_REQUESTS", 10_000)?;
        rate_limits.global_limit.window_ms = Self::parse_env("GLOBAL_WINDOW_MS", 60_000)?;
        if let Ok(tier) = env::var("DEFAULT_TIER")
            && !tier.is_empty()
        {
            rate_limits.default_tier = tier;
        }

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 4000)?,
            rate_limits,
            ip_rules: Self::parse_ip_rules()?,
            device_store_path: env::var("DEVICE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/devices.json")),
            log_dir: env::var("LOG_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            log_max_lines: Self::parse_env("LOG_MAX_LINES", crate::logging::DEFAULT_MAX_LINES)?,
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            metrics_port: Self::parse_env("METRICS_PORT", 0)?,
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants before use.
    pub fn validate(&self) -> GatewayResult<()> {
        self.rate_limits
            .validate()
            .map_err(GatewayError::Config)?;
        if self.log_max_lines == 0 {
            return Err(GatewayError::Config(
                "LOG_MAX_LINES must be greater than 0".to_string(),
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

    /// Get the metrics endpoint address, `None` when disabled.
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

    /// Parse an environment variable into the specified type with a default.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| GatewayError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_ip_rules() -> GatewayResult<IpRules> {
        let mode = match env::var("IP_FILTER_MODE").as_deref() {
            Ok("allowlist") => FilterMode::Allowlist,
            Ok("blocklist") | Err(_) => FilterMode::Blocklist,
            Ok(other) => {
                return Err(GatewayError::Config(format!(
                    "Invalid IP_FILTER_MODE '{other}', expected allowlist or blocklist"
                )));
            }
        };
        Ok(IpRules {
            allowlist: Self::parse_set("IP_ALLOWLIST"),
            blocklist: Self::parse_set("IP_BLOCKLIST"),
            mode,
        })
    }

    fn parse_set(name: &str) -> HashSet<String> {
        env::var(name)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            rate_limits: RateLimitConfig::default(),
            ip_rules: IpRules::default(),
            device_store_path: PathBuf::from("data/devices.json"),
            log_dir: None,
            log_max_lines: crate::logging::DEFAULT_MAX_LINES,
            cors_allowed_origins: vec!["*".to_string()],
            metrics_port: 0,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limits.default_tier, "free");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn metrics_disabled_by_default() {
        let config = Config::default();
        assert!(!config.metrics_enabled());
        assert!(config.metrics_addr().is_none());
    }

    #[test]
    fn metrics_addr_when_enabled() {
        let config = Config {
            metrics_port: 9090,
            ..Config::default()
        };
        assert_eq!(config.metrics_addr().unwrap().port(), 9090);
    }

    #[test]
    fn validate_rejects_missing_default_tier() {
        let mut config = Config::default();
        config.rate_limits.default_tier = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_log_lines() {
        let config = Config {
            log_max_lines: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
