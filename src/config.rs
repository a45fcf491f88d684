//! Configuration for the bridge
//!
//! Every timeout and retry count used by the bridge is read from here; the
//! values in [`crate::constants`] are only the defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result, ValidationError};
use crate::protocol::{validate_port, ServerAddress};

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    pub debounce: DebounceConfig,
    pub session: SessionConfig,
    pub discovery: DiscoveryConfig,
}

/// Last used server address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> std::result::Result<ServerAddress, ValidationError> {
        ServerAddress::new(self.url.clone(), self.port as i64)
    }

    pub fn set_address(&mut self, address: &ServerAddress) {
        self.url = address.url.clone();
        self.port = address.port;
    }
}

/// Transport and request timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub request_timeout_ms: u64,
    pub heartbeat_wait_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            heartbeat_wait_ms: HEARTBEAT_WAIT_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_wait(&self) -> Duration {
        Duration::from_millis(self.heartbeat_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Debounce delay classes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub normal_ms: u64,
    pub slow_ms: u64,
    pub fast_ms: u64,
    pub super_fast_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            normal_ms: DEBOUNCE_NORMAL_MS,
            slow_ms: DEBOUNCE_SLOW_MS,
            fast_ms: DEBOUNCE_FAST_MS,
            super_fast_ms: DEBOUNCE_SUPER_FAST_MS,
        }
    }
}

impl DebounceConfig {
    pub fn normal(&self) -> Duration {
        Duration::from_millis(self.normal_ms)
    }

    pub fn slow(&self) -> Duration {
        Duration::from_millis(self.slow_ms)
    }

    pub fn fast(&self) -> Duration {
        Duration::from_millis(self.fast_ms)
    }

    pub fn super_fast(&self) -> Duration {
        Duration::from_millis(self.super_fast_ms)
    }
}

/// Connection retry and liveness settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_heartbeat_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: CONNECT_ATTEMPTS,
            retry_delay_ms: RETRY_DELAY_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            max_heartbeat_retries: MAX_HEARTBEAT_RETRIES,
        }
    }
}

impl SessionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// UDP broadcast discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub broadcast_port: u16,
    pub timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_port: DISCOVERY_PORT,
            timeout_ms: DISCOVERY_TIMEOUT_MS,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    /// Default location: `<config dir>/volume-bridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "volume-bridge").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::warn!("No config directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("No config directory available".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, text)?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        validate_port(self.server.port as i64)?;
        if self.session.connect_attempts == 0 {
            return Err(Error::Config("session.connect_attempts must be at least 1".into()));
        }
        if self.bridge.request_timeout_ms == 0 || self.bridge.heartbeat_wait_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
