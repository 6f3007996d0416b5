use std::{net::SocketAddr, str::FromStr, time::Duration};

use parley_coord::CoordSettings;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

/// Bearer-token key material. Token issuance belongs to the auth service;
/// this server only needs a signing key for the operator CLI and the
/// verifying side for connections.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Base64 (URL-safe, unpadded) ed25519 signing key. When absent an
    /// ephemeral key is generated at startup and its verifying key logged.
    pub signing_key: Option<String>,
    /// Additional accepted verifying keys, for rotation.
    pub fallback_verifying_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MessagingConfig {
    /// Fixed-window send quota per sender.
    pub max_sends_per_window: u64,
    pub rate_limit_window_secs: u64,
    pub max_content_chars: usize,
    pub history_page_size: i64,
    pub conversations_page_size: i64,
    pub presence_ttl_secs: u64,
    pub typing_ttl_secs: u64,
    pub offline_retention_days: u64,
    pub cache_retention_days: u64,
    pub cache_max_entries: usize,
    pub max_ws_connections: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_sends_per_window: 10,
            rate_limit_window_secs: 60,
            max_content_chars: parley_core::MAX_CONTENT_CHARS,
            history_page_size: 50,
            conversations_page_size: 20,
            presence_ttl_secs: 3600,
            typing_ttl_secs: 5,
            offline_retention_days: 7,
            cache_retention_days: 7,
            cache_max_entries: 500,
            max_ws_connections: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub auth: AuthConfig,
    pub messaging: MessagingConfig,
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            redis_url: None,
            auth: AuthConfig::default(),
            messaging: MessagingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Values supplied on the command line; they win over files and environment.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub auth_signing_key: Option<String>,
    pub auth_fallback_verifying_keys: Option<Vec<String>>,
    pub max_sends_per_window: Option<u64>,
    pub rate_limit_window_secs: Option<u64>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "PARLEY_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(url) = &overrides.redis_url {
            self.redis_url = Some(url.clone());
        }
        if let Some(key) = &overrides.auth_signing_key {
            self.auth.signing_key = Some(key.clone());
        }
        if let Some(keys) = &overrides.auth_fallback_verifying_keys {
            self.auth.fallback_verifying_keys = keys.clone();
        }
        if let Some(limit) = overrides.max_sends_per_window {
            self.messaging.max_sends_per_window = limit;
        }
        if let Some(window) = overrides.rate_limit_window_secs {
            self.messaging.rate_limit_window_secs = window;
        }
        self.validate()
    }

    /// PARLEY_SERVER__* variables currently present in the environment,
    /// logged at startup so operators can see what won.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Expiry policy handed to whichever coordination backend is in use.
    pub fn coord_settings(&self) -> CoordSettings {
        let messaging = &self.messaging;
        CoordSettings {
            presence_ttl: Duration::from_secs(messaging.presence_ttl_secs),
            typing_ttl: Duration::from_secs(messaging.typing_ttl_secs),
            offline_retention: Duration::from_secs(messaging.offline_retention_days * 24 * 3600),
            cache_retention: Duration::from_secs(messaging.cache_retention_days * 24 * 3600),
            cache_max_entries: messaging.cache_max_entries,
            rate_window: Duration::from_secs(messaging.rate_limit_window_secs),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.messaging.max_sends_per_window == 0 {
            return Err(ConfigError::InvalidValue(
                "messaging.max_sends_per_window must be at least 1".into(),
            ));
        }
        if self.messaging.rate_limit_window_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "messaging.rate_limit_window_secs must be at least 1".into(),
            ));
        }
        if self.messaging.history_page_size <= 0 || self.messaging.conversations_page_size <= 0 {
            return Err(ConfigError::InvalidValue(
                "messaging page sizes must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn defaults_match_expectations() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
        assert_eq!(config.messaging.max_sends_per_window, 10);
        assert_eq!(config.messaging.rate_limit_window_secs, 60);
        assert!(!config.metrics.enabled);
    }

    #[test]
    #[serial]
    fn environment_overrides_take_effect() {
        env::set_var("PARLEY_SERVER__HOST", "127.0.0.1");
        env::set_var("PARLEY_SERVER__PORT", "9090");
        env::set_var("PARLEY_SERVER__LOG_FORMAT", "json");
        env::set_var("PARLEY_SERVER__MESSAGING__MAX_SENDS_PER_WINDOW", "3");

        let config = ServerConfig::load().expect("config loads");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.messaging.max_sends_per_window, 3);

        env::remove_var("PARLEY_SERVER__HOST");
        env::remove_var("PARLEY_SERVER__PORT");
        env::remove_var("PARLEY_SERVER__LOG_FORMAT");
        env::remove_var("PARLEY_SERVER__MESSAGING__MAX_SENDS_PER_WINDOW");
    }

    #[test]
    #[serial]
    fn listener_addr_prefers_bind_addr() {
        env::set_var("PARLEY_SERVER__BIND_ADDR", "192.168.1.20:5555");

        let config = ServerConfig::load().expect("config loads");
        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "192.168.1.20:5555");

        env::remove_var("PARLEY_SERVER__BIND_ADDR");
    }

    #[test]
    fn listener_addr_composes_host_and_port() {
        let config = ServerConfig {
            host: "10.0.0.2".into(),
            port: 7000,
            ..ServerConfig::default()
        };

        let addr = config.listener_addr().expect("valid addr");
        assert_eq!(addr.to_string(), "10.0.0.2:7000");
    }

    #[test]
    #[serial]
    fn invalid_bind_addr_returns_error() {
        env::set_var("PARLEY_SERVER__BIND_ADDR", "::invalid::");

        let config = ServerConfig::load().expect("config loads");
        let err = config.listener_addr().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddr(_)));

        env::remove_var("PARLEY_SERVER__BIND_ADDR");
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = ServerConfig::default();
        let overrides = CliOverrides {
            port: Some(9999),
            redis_url: Some("redis://127.0.0.1:6379".into()),
            max_sends_per_window: Some(2),
            ..CliOverrides::default()
        };
        config.apply_overrides(&overrides).expect("valid overrides");
        assert_eq!(config.port, 9999);
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.messaging.max_sends_per_window, 2);
    }

    #[test]
    fn zero_rate_limit_window_is_rejected() {
        let mut config = ServerConfig::default();
        let overrides = CliOverrides {
            rate_limit_window_secs: Some(0),
            ..CliOverrides::default()
        };
        let err = config.apply_overrides(&overrides).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn coord_settings_reflect_messaging_config() {
        let mut config = ServerConfig::default();
        config.messaging.presence_ttl_secs = 120;
        config.messaging.typing_ttl_secs = 3;
        config.messaging.offline_retention_days = 2;

        let settings = config.coord_settings();
        assert_eq!(settings.presence_ttl, Duration::from_secs(120));
        assert_eq!(settings.typing_ttl, Duration::from_secs(3));
        assert_eq!(settings.offline_retention, Duration::from_secs(2 * 24 * 3600));
    }
}
