//! Tracker Configuration
//!
//! Loaded from a TOML file, then overridden by environment variables and
//! command-line flags.
//!
//! ```toml
//! filter = "google.com"
//! group_dir = "/var/lib/netrack"
//!
//! [proxy]
//! listen_addr = "127.0.0.1:8899"
//! max_flows = 256
//! ```

use netrack_filter::{FlowClassifier, DEFAULT_FILTER};
use netrack_provider::{ListenerConfig, ProxyProviderConfig};
use netrack_store::{StoreConfig, DEFAULT_DB_FILE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Proxy listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Address the TCP proxy listens on
    pub listen_addr: SocketAddr,
    /// Read buffer per flow (bytes)
    pub read_buffer: usize,
    /// Maximum flows read concurrently
    pub max_flows: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8899)),
            read_buffer: 16 * 1024,
            max_flows: 256,
        }
    }
}

/// Complete tracker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Hostname substring that marks a request as loggable
    pub filter: String,
    /// Directory shared by interceptor and viewer
    pub group_dir: PathBuf,
    /// Store file name inside `group_dir`
    pub db_file: String,
    /// Wait for another process holding the store lock (ms)
    pub busy_timeout_ms: u64,
    /// Poll interval for changes made by other processes (ms)
    pub watch_interval_ms: u64,
    /// Emit user notifications for logged requests
    pub notifications: bool,
    /// Default log level when `RUST_LOG` is unset
    pub log_level: String,
    pub proxy: ProxySettings,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            group_dir: PathBuf::from("./netrack-group"),
            db_file: DEFAULT_DB_FILE.to_string(),
            busy_timeout_ms: 5000,
            watch_interval_ms: 500,
            notifications: true,
            log_level: "info".to_string(),
            proxy: ProxySettings::default(),
        }
    }
}

impl TrackerConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse TOML. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from the environment or the command line.
    pub fn apply_overrides(&mut self, filter: Option<String>, group_dir: Option<PathBuf>) {
        if let Some(filter) = filter {
            self.filter = filter;
        }
        if let Some(dir) = group_dir {
            self.group_dir = dir;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filter.trim().is_empty() {
            return Err(ConfigError::EmptyFilter);
        }
        if self.db_file.trim().is_empty() {
            return Err(ConfigError::EmptyDbFile);
        }
        if self.watch_interval_ms == 0 {
            return Err(ConfigError::InvalidWatchInterval);
        }
        if self.proxy.read_buffer == 0 {
            return Err(ConfigError::InvalidReadBuffer);
        }
        if self.proxy.max_flows == 0 {
            return Err(ConfigError::InvalidMaxFlows);
        }
        Ok(())
    }

    pub fn classifier(&self) -> FlowClassifier {
        FlowClassifier::new(&self.filter)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            dir: self.group_dir.clone(),
            file_name: self.db_file.clone(),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            ..StoreConfig::default()
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            listen_addr: self.proxy.listen_addr,
            read_buffer: self.proxy.read_buffer,
        }
    }

    pub fn proxy_provider_config(&self) -> ProxyProviderConfig {
        ProxyProviderConfig {
            max_flows: self.proxy.max_flows,
        }
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Filter must not be empty")]
    EmptyFilter,

    #[error("Store file name must not be empty")]
    EmptyDbFile,

    #[error("Watch interval must be positive")]
    InvalidWatchInterval,

    #[error("Proxy read buffer must be positive")]
    InvalidReadBuffer,

    #[error("Proxy max_flows must be positive")]
    InvalidMaxFlows,
}
