//! Node configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (JUNCTION_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use junction_protocol::ByteOrder;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Endpoint id of the channel services register on.
    #[serde(default = "default_service_channel")]
    pub service_channel: String,

    /// Endpoint id of the channel clients connect on.
    #[serde(default = "default_client_channel")]
    pub client_channel: String,

    /// Byte order of envelope length prefixes: "big" or "little".
    #[serde(default = "default_byte_order")]
    pub byte_order: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_service_channel() -> String {
    std::env::var("JUNCTION_SERVICE_CHANNEL").unwrap_or_else(|_| "junction-services".to_string())
}

fn default_client_channel() -> String {
    std::env::var("JUNCTION_CLIENT_CHANNEL").unwrap_or_else(|_| "junction-clients".to_string())
}

fn default_byte_order() -> String {
    std::env::var("JUNCTION_BYTE_ORDER").unwrap_or_else(|_| "big".to_string())
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_channel: default_service_channel(),
            client_channel: default_client_channel(),
            byte_order: default_byte_order(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "junction.toml",
            "/etc/junction/junction.toml",
            "~/.config/junction/junction.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Parse the configured envelope byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is neither "big" nor "little".
    pub fn byte_order(&self) -> Result<ByteOrder> {
        match self.bus.byte_order.to_ascii_lowercase().as_str() {
            "big" => Ok(ByteOrder::Big),
            "little" => Ok(ByteOrder::Little),
            other => bail!("Invalid byte_order {:?}: expected \"big\" or \"little\"", other),
        }
    }
}
