//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where clients connect and socket timeouts.
    pub network: NetworkConfig,
    /// Client connection-core settings.
    pub client: ClientConfig,
    /// Relay server settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Network settings shared by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Relay host name or literal IP address.
    pub server_address: String,
    /// Relay port.
    pub server_port: u16,
    /// Per-address connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-connection write timeout in milliseconds.
    pub write_timeout_ms: u64,
}

/// Client connection-core settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Display name sent with Join and Ready.
    pub display_name: String,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// A link is considered silently dead after this many heartbeat intervals
    /// without a Ping reply.
    pub heartbeat_timeout_factor: f64,
    /// Upper bound on the item-assignment exchange, in milliseconds.
    pub exchange_timeout_ms: u64,
    /// Capacity of the inbound hand-off queue.
    pub inbound_capacity: usize,
    /// First delay between failed reconnect attempts, in milliseconds.
    pub reconnect_initial_delay_ms: u64,
    /// Cap on the delay between failed reconnect attempts, in milliseconds.
    pub reconnect_max_delay_ms: u64,
}

/// Relay server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (IP literal).
    pub bind_address: String,
    /// Listen port.
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Drop a connection that sends nothing for this long, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Interval between confirmable-message resends, in milliseconds.
    pub resend_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "debug,courier_net=trace").
    pub log_level: String,
    /// Directory for the JSON log file. No file logging when unset.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 38281,
            connect_timeout_ms: 2_000,
            write_timeout_ms: 2_000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            display_name: "player".to_string(),
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_factor: 3.5,
            exchange_timeout_ms: 60_000,
            inbound_capacity: 1024,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 38281,
            max_connections: 256,
            idle_timeout_ms: 60_000,
            resend_interval_ms: 10_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

// --- Duration accessors ---

impl NetworkConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Write timeout as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl ClientConfig {
    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Time without a Ping reply after which the link is treated as dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval()
            .mul_f64(self.heartbeat_timeout_factor.max(1.0))
    }

    /// Exchange timeout as a [`Duration`].
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

impl ServerConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Resend interval as a [`Duration`].
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }
}

/// Platform config directory for Courier (`<config_dir>/courier`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("courier"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
