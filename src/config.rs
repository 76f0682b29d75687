//! Configuration management for Quotagate.
//!
//! Configuration comes from an optional YAML file, layered with environment
//! variables of the form `QUOTAGATE__LIMITER__DEFAULT_LIMIT=20`.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::error::{QuotaGateError, Result};
use crate::ratelimit::{RuleConfig, TimeUnit, WindowConfig};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting rules and store
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// HTTP middleware behavior
    #[serde(default)]
    pub middleware: MiddlewareSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the demo HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// What to decide when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Let the request through
    #[default]
    Open,
    /// Reject the request
    Closed,
}

impl FailPolicy {
    pub fn allows(&self) -> bool {
        matches!(self, FailPolicy::Open)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Rules, in evaluation order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Limit applied to requests no rule matches
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window for the default rule and for rules without their own
    #[serde(default = "default_window")]
    pub default_window: WindowConfig,

    /// Namespace of every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Decision to make while the store is unavailable
    #[serde(default)]
    pub fail_policy: FailPolicy,

    /// Counter store connection
    #[serde(default)]
    pub store: StoreSettings,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_limit: default_limit(),
            default_window: default_window(),
            key_prefix: default_key_prefix(),
            fail_policy: FailPolicy::default(),
            store: StoreSettings::default(),
        }
    }
}

fn default_limit() -> u64 {
    10
}

fn default_window() -> WindowConfig {
    WindowConfig::Unit(TimeUnit::Second)
}

fn default_key_prefix() -> String {
    "throttle".to_string()
}

/// Counter store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// `redis://host:port/db`, `rediss://…` or `memory://`
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Budget for one increment, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Budget for opening the connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Retry once when the connection is refused
    #[serde(default = "default_retry_on_refused")]
    pub retry_on_refused: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            timeout_ms: default_store_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            retry_on_refused: default_retry_on_refused(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout() -> u64 {
    100
}

fn default_connect_timeout() -> u64 {
    500
}

fn default_retry_on_refused() -> bool {
    true
}

/// HTTP middleware configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareSettings {
    /// Clients that are never rate limited
    #[serde(default)]
    pub ip_whitelist: Vec<IpAddr>,

    /// Identify clients by `X-Forwarded-For` / `X-Real-IP`. Only enable
    /// behind a proxy that sets these headers.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| QuotaGateError::Config(format!("Failed to load configuration: {}", e)))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.server.listen_addr.port(), 3000);
        assert_eq!(config.limiter.default_limit, 10);
        assert_eq!(config.limiter.key_prefix, "throttle");
        assert_eq!(config.limiter.fail_policy, FailPolicy::Open);
        assert_eq!(config.limiter.default_window, WindowConfig::Unit(TimeUnit::Second));
        assert_eq!(config.limiter.store.url, "redis://127.0.0.1:6379");
        assert!(config.middleware.ip_whitelist.is_empty());
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:8080
limiter:
  key_prefix: demo
  default_limit: 20
  default_window: minute
  fail_policy: closed
  store:
    url: memory://
    timeout_ms: 25
  rules:
    - method: POST
      limit: 5
    - method: GET
      limit: 10
    - method: GET
      path: /hello
      limit: 1
middleware:
  ip_whitelist: ["127.0.0.1", "::1"]
  trust_forwarded_for: true
logging:
  level: debug
  json: true
"#;
        let config = GateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.limiter.key_prefix, "demo");
        assert_eq!(config.limiter.default_limit, 20);
        assert_eq!(config.limiter.default_window, WindowConfig::Unit(TimeUnit::Minute));
        assert_eq!(config.limiter.fail_policy, FailPolicy::Closed);
        assert_eq!(config.limiter.store.url, "memory://");
        assert_eq!(config.limiter.store.timeout_ms, 25);
        assert_eq!(config.limiter.store.connect_timeout_ms, 500);
        assert_eq!(config.limiter.rules.len(), 3);
        assert_eq!(config.limiter.rules[2].path.as_deref(), Some("/hello"));
        assert_eq!(config.middleware.ip_whitelist.len(), 2);
        assert!(config.middleware.trust_forwarded_for);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_fail_policy_rejected() {
        let err = GateConfig::from_yaml("limiter:\n  fail_policy: sometimes\n").unwrap_err();
        assert!(matches!(err, QuotaGateError::Config(_)));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("quotagate-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "limiter:\n  default_limit: 7\n  key_prefix: from_file\n",
        )
        .unwrap();
        std::env::set_var("QUOTAGATE__LOGGING__LEVEL", "warn");

        let config = GateConfig::load(Some(&path)).unwrap();
        std::env::remove_var("QUOTAGATE__LOGGING__LEVEL");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiter.default_limit, 7);
        assert_eq!(config.limiter.key_prefix, "from_file");
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("quotagate-does-not-exist.yaml");
        assert!(GateConfig::load(Some(&path)).is_err());
    }
}
