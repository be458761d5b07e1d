use config::ConfigError as ConfigLibError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Config library error: {0}")]
    ConfigLibError(#[from] ConfigLibError),
    #[error("Failed to render config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Environment variable prefix, e.g. `TINYSOCKS_LISTEN_ADDRESS`.
const ENV_PREFIX: &str = "TINYSOCKS";

/// Server configuration, built once at startup and shared read-only by
/// every connection worker.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Expected username; authentication is disabled when unset or empty
    #[serde(default)]
    pub username: Option<String>,
    /// Expected password
    #[serde(default)]
    pub password: Option<String>,
    /// Outbound dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Permit relaying to destinations on the proxy's own host
    #[serde(default)]
    pub allow_loopback: bool,
    /// Log configuration
    #[serde(default)]
    pub log: LoggerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggerConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path; empty logs to stderr only
    #[serde(default)]
    pub path: String,
    /// Log file archive pattern
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    /// Number of log files to keep
    #[serde(default = "default_file_count")]
    pub file_count: u32,
    /// Size of each log file (MB)
    #[serde(default = "default_file_size")]
    pub file_size: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: String::new(),
            archive_pattern: default_archive_pattern(),
            file_count: default_file_count(),
            file_size: default_file_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            username: None,
            password: None,
            connect_timeout: default_connect_timeout(),
            max_connections: default_max_connections(),
            allow_loopback: false,
            log: LoggerConfig::default(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:1080".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1024
}

fn default_log_level() -> String {
    "Info".to_string()
}

fn default_archive_pattern() -> String {
    "logs/archive/tinysocks-{}.log".to_string()
}

fn default_file_count() -> u32 {
    5
}

fn default_file_size() -> u64 {
    10
}

impl Config {
    /// Load configuration from an optional TOML file layered under
    /// `TINYSOCKS_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Whether clients must complete username/password authentication.
    pub fn auth_required(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Address handed to `bind`. Accepts `host:port`, IP literals and a
    /// bare `:port`, which listens on every interface.
    pub fn bind_address(&self) -> Result<String, ConfigError> {
        let invalid = || {
            ConfigError::InvalidConfig(format!(
                "Invalid listen address format: {}",
                self.listen_address
            ))
        };

        let (host, port) = self.listen_address.rsplit_once(':').ok_or_else(invalid)?;
        port.parse::<u16>().map_err(|_| invalid())?;

        if host.is_empty() {
            Ok(format!("0.0.0.0:{}", port))
        } else if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            // Bare IPv6 literals need brackets.
            Err(invalid())
        } else {
            Ok(self.listen_address.clone())
        }
    }

    /// Validate if configuration is valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Listen address cannot be empty".to_string(),
            ));
        }
        self.bind_address()?;

        if !self.auth_required() && self.password.as_deref().is_some_and(|p| !p.is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "Password is set but username is empty".to_string(),
            ));
        }

        // RFC 1929 carries both fields behind a single length byte.
        for (field, value) in [("username", &self.username), ("password", &self.password)] {
            if let Some(value) = value {
                if value.len() > u8::MAX as usize {
                    return Err(ConfigError::InvalidConfig(format!(
                        "{} is longer than 255 bytes",
                        field
                    )));
                }
            }
        }

        if self.connect_timeout == 0 {
            return Err(ConfigError::InvalidConfig(
                "Connect timeout must be at least 1 second".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max connections must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML with the password masked.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.password.is_some() {
            shown.password = Some("********".to_string());
        }
        Ok(toml::to_string(&shown)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir()
            .join(format!("tinysocks-{}-{}.toml", name, std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_address, "0.0.0.0:1080");
        assert_eq!(config.connect_timeout, 10);
        assert!(!config.auth_required());
        assert!(!config.allow_loopback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let path = write_temp(
            "full",
            r#"
listen_address = "127.0.0.1:9050"
username = "alice"
password = "secret"
connect_timeout = 3

[log]
level = "debug"
"#,
        );
        let config = Config::load(Some(path.as_path())).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.listen_address, "127.0.0.1:9050");
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.connect_timeout, 3);
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.log.level, "debug");
        assert!(config.auth_required());
    }

    #[test]
    fn test_from_file_rejects_invalid_address() {
        let path = write_temp("badaddr", "listen_address = \"nowhere\"\n");
        let result = Config::load(Some(path.as_path())).and_then(|c| c.validate());
        fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_bind_address_forms() {
        let with = |addr: &str| Config {
            listen_address: addr.to_string(),
            ..Config::default()
        };

        assert_eq!(with(":1080").bind_address().unwrap(), "0.0.0.0:1080");
        assert_eq!(with("localhost:1080").bind_address().unwrap(), "localhost:1080");
        assert_eq!(with("127.0.0.1:9050").bind_address().unwrap(), "127.0.0.1:9050");
        assert_eq!(with("[::1]:1080").bind_address().unwrap(), "[::1]:1080");
        assert!(with(":1080").validate().is_ok());
        assert!(with("localhost:1080").validate().is_ok());

        for bad in ["nowhere", "localhost:", "host:99999", "::1:1080", "host:port"] {
            assert!(
                matches!(with(bad).validate(), Err(ConfigError::InvalidConfig(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_empty_username_disables_auth() {
        let config = Config {
            username: Some(String::new()),
            ..Config::default()
        };
        assert!(!config.auth_required());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let orphan_password = Config {
            password: Some("secret".to_string()),
            ..Config::default()
        };
        assert!(orphan_password.validate().is_err());

        let long_username = Config {
            username: Some("u".repeat(256)),
            ..Config::default()
        };
        assert!(long_username.validate().is_err());

        let zero_timeout = Config {
            connect_timeout: 0,
            ..Config::default()
        };
        assert!(zero_timeout.validate().is_err());

        let zero_connections = Config {
            max_connections: 0,
            ..Config::default()
        };
        assert!(zero_connections.validate().is_err());
    }

    #[test]
    fn test_to_toml_masks_password() {
        let config = Config {
            username: Some("alice".to_string()),
            password: Some("secret".to_string()),
            ..Config::default()
        };
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("secret"));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.listen_address, config.listen_address);
        assert_eq!(parsed.connect_timeout, config.connect_timeout);
    }
}
