use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Bluetooth adapter control
    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    /// REST API server settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bluetooth backend configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BluetoothConfig {
    /// Probe the adapter at startup (a missing adapter only disables the backend)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Adapter name under /org/bluez
    #[serde(default = "default_adapter")]
    pub adapter: String,

    /// Upper bound for every call to bluetoothd
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u32,

    /// How long a pairing session accepts new devices
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u32,

    /// Power the adapter off after this long with nothing connected (0 = never)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u32,

    /// Adapter-side DiscoverableTimeout (0 = pairing timeout + 10 s)
    #[serde(default)]
    pub discoverable_timeout_secs: u32,

    /// Adapter-side PairableTimeout (0 = pairing timeout + 10 s)
    #[serde(default)]
    pub pairable_timeout_secs: u32,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            adapter: default_adapter(),
            call_timeout_secs: default_call_timeout(),
            pairing_timeout_secs: default_pairing_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            discoverable_timeout_secs: 0,
            pairable_timeout_secs: 0,
        }
    }
}

fn default_adapter() -> String {
    "hci0".to_string()
}

fn default_call_timeout() -> u32 {
    5
}

fn default_pairing_timeout() -> u32 {
    60
}

fn default_idle_timeout() -> u32 {
    300
}

/// REST API server configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ApiConfig {
    /// Serve the REST API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: 127.0.0.1:8380 - localhost only)
    #[serde(default = "default_api_bind")]
    pub bind: String,

    /// API key hash (SHA-256) for authentication.
    /// Generate with: `deskctl api-key generate`
    #[serde(default)]
    pub api_key_hash: Option<String>,

    /// Enable Swagger UI at /swagger-ui/
    #[serde(default = "default_true")]
    pub swagger_ui: bool,

    /// Allowed CORS origins (empty = same-origin only)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_api_bind(),
            api_key_hash: None,
            swagger_ui: true,
            cors_origins: vec![],
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8380".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
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

fn default_true() -> bool {
    true
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("com", "deskctl", "deskctl")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            Self::parse(&contents)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Parse and validate TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bt = &self.bluetooth;

        if bt.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "bluetooth.call_timeout_secs must be positive".into(),
            ));
        }

        if bt.pairing_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "bluetooth.pairing_timeout_secs must be positive".into(),
            ));
        }

        // The adapter name becomes part of an object path
        if bt.adapter.is_empty()
            || !bt
                .adapter
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::ValidationError(format!(
                "bluetooth.adapter '{}' is not a valid adapter name",
                bt.adapter
            )));
        }

        if self.api.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "api.bind '{}' is not a valid socket address",
                self.api.bind
            )));
        }

        if let Some(ref hash) = self.api.api_key_hash {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::ValidationError(
                    "api.api_key_hash must be a hex-encoded SHA-256 digest".into(),
                ));
            }
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;

        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

/// Show current configuration
pub fn show() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = Config::config_path()?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid(config: &Config) -> String {
        match config.validate() {
            Err(ConfigError::ValidationError(msg)) => msg,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.bluetooth.enabled);
        assert_eq!(config.bluetooth.adapter, "hci0");
        assert_eq!(config.bluetooth.call_timeout_secs, 5);
        assert_eq!(config.bluetooth.pairing_timeout_secs, 60);
        assert_eq!(config.bluetooth.idle_timeout_secs, 300);
        assert_eq!(config.api.bind, "127.0.0.1:8380");
        assert!(config.api.api_key_hash.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_section() {
        let config = Config::parse(
            r#"
            [bluetooth]
            adapter = "hci1"
            idle_timeout_secs = 0

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.bluetooth.adapter, "hci1");
        assert_eq!(config.bluetooth.idle_timeout_secs, 0);
        assert_eq!(config.bluetooth.pairing_timeout_secs, 60);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = Config::default();
        config.bluetooth.pairing_timeout_secs = 120;
        config.api.cors_origins = vec!["http://localhost:3000".into()];

        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let mut config = Config::default();
        config.bluetooth.call_timeout_secs = 0;
        assert!(invalid(&config).contains("call_timeout_secs"));

        let mut config = Config::default();
        config.bluetooth.pairing_timeout_secs = 0;
        assert!(invalid(&config).contains("pairing_timeout_secs"));
    }

    #[test]
    fn test_validate_adapter_name() {
        for bad in ["", "hci0/dev", "../hci0", "hci 0"] {
            let mut config = Config::default();
            config.bluetooth.adapter = bad.to_string();
            assert!(invalid(&config).contains("adapter"), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_validate_bind() {
        let mut config = Config::default();
        config.api.bind = "localhost".into();
        assert!(invalid(&config).contains("api.bind"));

        config.api.bind = "[::1]:9000".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_api_key_hash() {
        let mut config = Config::default();
        config.api.api_key_hash = Some("not-a-hash".into());
        assert!(invalid(&config).contains("api_key_hash"));

        config.api.api_key_hash = Some("a".repeat(64));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_error() {
        let err = Config::parse("[bluetooth]\nadapter = 3").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
