//! Configuration file support for flashup.
//!
//! Configuration is loaded from multiple sources with the following priority
//! (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FLASHUP_*)
//! 3. Local config file (./flashup.toml)
//! 4. Global config file (~/.config/flashup/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Device selection defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Default target device id (e.g. "serial:/dev/ttyUSB0").
    pub default: Option<String>,
}

/// Known network endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Registered device hosts, as `host[:port]` specs.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device selection settings.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Network endpoint settings.
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global);
                }
            }
        }

        if let Some(local) = Self::load_from_file(Path::new("flashup.toml")) {
            debug!("Loaded local config from flashup.toml");
            config.merge(local);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Invalid config file {}: {e}", path.display());
                    None
                }
            },
            Err(e) => {
                warn!("Could not read config file {}: {e}", path.display());
                None
            }
        }
    }

    /// Overlay `other` onto `self`; set values win, host lists are unioned.
    fn merge(&mut self, other: Self) {
        if other.device.default.is_some() {
            self.device.default = other.device.default;
        }
        for host in other.network.hosts {
            if !self.network.hosts.contains(&host) {
                self.network.hosts.push(host);
            }
        }
    }

    fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "flashup", "flashup")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
