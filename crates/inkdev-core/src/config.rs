/*!
 * Configuration management for inkdev.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for the ink device client: application identity, handshake timeouts,
 * file transfer cadence and logging.
 */
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::millis_to_duration;

/// Core configuration for inkdev
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Client identity and connection policy
    #[serde(default)]
    pub client: ClientConfig,

    /// Connection handshake timing
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// File transfer behaviour
    #[serde(default)]
    pub file_transfer: FileTransferConfig,

    /// Real-time ink behaviour
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Data directory, holds the persisted device descriptor
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, "inkdev_devices=debug", ...)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Whether to use ANSI colors
    #[serde(default = "default_true")]
    pub ansi: bool,
}

/// Client identity and connection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Application identity presented to devices, 12 hex digits
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// File name (inside the data directory) of the last connected device
    #[serde(default = "default_descriptor_file")]
    pub descriptor_file: String,

    /// Ask the user to confirm a first connection on the device
    #[serde(default = "default_true")]
    pub require_user_confirmation: bool,

    /// Accept devices whose identity cannot be verified
    #[serde(default)]
    pub allow_untrusted: bool,
}

/// Handshake timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Timeout for opening the transport link in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long the device may wait for a physical confirmation, in milliseconds
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
}

/// File transfer behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferConfig {
    /// Poll cadence for completed pages in milliseconds
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Retries a caller-side handler grants a failing unit before moving on
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Deliver documents whose transfer was incomplete
    #[serde(default)]
    pub allow_partial: bool,
}

/// Real-time ink behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Report hover samples while the pen is in proximity
    #[serde(default)]
    pub hover: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            ansi: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            descriptor_file: default_descriptor_file(),
            require_user_confirmation: true,
            allow_untrusted: false,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
        }
    }
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
            max_retries: default_max_retries(),
            allow_partial: false,
        }
    }
}

impl Config {
    /// Path of the persisted device descriptor
    pub fn descriptor_path(&self) -> PathBuf {
        Path::new(&self.general.data_dir).join(&self.client.descriptor_file)
    }

    /// Render this configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check values that serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        let hex = self.client.app_id.replace([':', '-'], "");
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::config(format!(
                "client.app_id must be 6 hex bytes, got {:?}",
                self.client.app_id
            )));
        }
        if self.file_transfer.sync_interval_ms == 0 {
            return Err(Error::config("file_transfer.sync_interval_ms must be positive"));
        }
        if self.handshake.confirmation_timeout_ms == 0 {
            return Err(Error::config("handshake.confirmation_timeout_ms must be positive"));
        }
        Ok(())
    }
}

impl HandshakeConfig {
    /// Link open timeout
    pub fn connect_timeout(&self) -> Duration {
        millis_to_duration(self.connect_timeout_ms)
    }

    /// Physical confirmation timeout
    pub fn confirmation_timeout(&self) -> Duration {
        millis_to_duration(self.confirmation_timeout_ms)
    }
}

impl FileTransferConfig {
    /// Poll cadence
    pub fn sync_interval(&self) -> Duration {
        millis_to_duration(self.sync_interval_ms)
    }
}

fn default_app_name() -> String {
    "inkdev".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_app_id() -> String {
    "FA:AB:C1:E0:F1:77".to_string()
}

fn default_descriptor_file() -> String {
    "SavedData".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_confirmation_timeout_ms() -> u64 {
    30_000
}

fn default_sync_interval_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    3
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "inkdev");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.client.descriptor_file, "SavedData");
        assert_eq!(config.file_transfer.max_retries, 3);
        assert!(config.client.require_user_confirmation);
        assert!(!config.client.allow_untrusted);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "inkdev");
        assert_eq!(config.handshake.confirmation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("config.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                data_dir = "/var/lib/inkdev"

                [logging]
                level = "debug"

                [client]
                allow_untrusted = true

                [file_transfer]
                sync_interval_ms = 500
                max_retries = 5

                [realtime]
                hover = true
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.general.data_dir, "/var/lib/inkdev");
        assert_eq!(config.logging.level, "debug");
        assert!(config.client.allow_untrusted);
        assert_eq!(config.file_transfer.sync_interval(), Duration::from_millis(500));
        assert_eq!(config.file_transfer.max_retries, 5);
        assert!(config.realtime.hover);
        assert_eq!(
            config.descriptor_path(),
            Path::new("/var/lib/inkdev").join("SavedData")
        );

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("INKDEVTEST__GENERAL__APP_NAME", "env-app");
        env::set_var("INKDEVTEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("inkdevtest")
            .build()?;

        assert_eq!(config.general.app_name, "env-app");
        assert_eq!(config.logging.level, "trace");

        env::remove_var("INKDEVTEST__GENERAL__APP_NAME");
        env::remove_var("INKDEVTEST__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_invalid_app_id_rejected() {
        let mut config = Config::default();
        config.client.app_id = "xyz".to_string();
        let err = ConfigBuilder::new().override_with(config).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_to_toml_contains_sections() -> Result<()> {
        let rendered = Config::default().to_toml()?;
        assert!(rendered.contains("[client]"));
        assert!(rendered.contains("descriptor_file = \"SavedData\""));
        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "inkdev");
        assert_eq!(shared.as_ref().client.app_id, "FA:AB:C1:E0:F1:77");
    }
}
