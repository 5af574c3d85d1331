//! Configuration loading.
//!
//! Settings come from `wsbus/config.json` in the platform config directory,
//! then from environment variables. Every field has a default, so a missing
//! file is not an error.
//!
//! # Environment Variables
//!
//! - `WSBUS_CONFIG_DIR` - directory holding `config.json` (overrides the platform dir)
//! - `WSBUS_BIND_ADDRESS` - overrides [`Config::bind_address`]
//! - `WSBUS_RELAY` - `1`/`true` enables [`Config::relay_targeted_notify`]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default listening address: loopback, ephemeral port.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:0";

/// Default maximum WebSocket message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const CONFIG_FILE: &str = "config.json";

/// Settings shared by hub and peer endpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address the hub binds when none is given explicitly.
    pub bind_address: String,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Forward peer notifies carrying a `targetId` to the named peer instead
    /// of dispatching them to the hub's own handlers.
    pub relay_targeted_notify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            relay_targeted_notify: false,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `WSBUS_CONFIG_DIR` wins; otherwise the platform config dir joined
    /// with `wsbus`.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("WSBUS_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        dirs::config_dir()
            .map(|dir| dir.join("wsbus"))
            .context("could not determine config directory")
    }

    /// Load from the config directory, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            log::debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load from an explicit file, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("invalid config: {}", path.display()))
    }

    /// Write this config as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config: {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("WSBUS_BIND_ADDRESS") {
            self.bind_address = addr;
        }
        if let Ok(relay) = std::env::var("WSBUS_RELAY") {
            self.relay_targeted_notify = parse_flag(&relay);
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
