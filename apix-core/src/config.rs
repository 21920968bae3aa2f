//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via APIX_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Poll loop tuning.
    pub poll: PollConfig,
    /// Per-descriptor buffer limits.
    pub buffer: BufferConfig,
    /// SRRP mode timers.
    pub srrp: SrrpConfig,
    /// Listening addresses and node identity (used by the hub).
    pub network: NetworkConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("APIX_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.poll.apply_env_overrides();
        self.buffer.apply_env_overrides();
        self.srrp.apply_env_overrides();
        self.network.apply_env_overrides();
    }

    /// Checks that every size and interval is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("poll.event_capacity", self.poll.event_capacity),
            ("poll.read_chunk_size", self.poll.read_chunk_size),
            ("poll.read_budget", self.poll.read_budget),
            ("buffer.max_read_buffer", self.buffer.max_read_buffer),
            ("srrp.payload_limit", self.srrp.payload_limit),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.srrp.sync_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "srrp.sync_interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.poll.read_chunk_size > self.poll.read_budget {
            return Err(ConfigError::ValidationError(format!(
                "poll.read_chunk_size ({}) exceeds poll.read_budget ({})",
                self.poll.read_chunk_size, self.poll.read_budget
            )));
        }

        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Poll loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Readiness events fetched per poll.
    pub event_capacity: usize,
    /// Bytes requested from a transport per receive call.
    pub read_chunk_size: usize,
    /// Bytes read from one descriptor per poll before moving on.
    pub read_budget: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            read_chunk_size: 4096,
            read_budget: 64 * 1024,
        }
    }
}

impl PollConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("APIX_EVENT_CAPACITY") {
            self.event_capacity = n;
        }
        if let Some(n) = env_parse("APIX_READ_CHUNK_SIZE") {
            self.read_chunk_size = n;
        }
        if let Some(n) = env_parse("APIX_READ_BUDGET") {
            self.read_budget = n;
        }
    }
}

/// Per-descriptor buffer limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum bytes held in a read buffer. Reading pauses when full.
    pub max_read_buffer: usize,
    /// Maximum bytes held in a write queue (0 = unbounded).
    pub max_write_queue: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_read_buffer: 1024 * 1024,
            max_write_queue: 0,
        }
    }
}

impl BufferConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("APIX_MAX_READ_BUFFER") {
            self.max_read_buffer = n;
        }
        if let Some(n) = env_parse("APIX_MAX_WRITE_QUEUE") {
            self.max_write_queue = n;
        }
    }

    /// Returns the write queue limit, if any.
    pub fn write_limit(&self) -> Option<usize> {
        if self.max_write_queue == 0 {
            None
        } else {
            Some(self.max_write_queue)
        }
    }
}

/// SRRP mode timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrrpConfig {
    /// Seconds between `/sync` control packets.
    pub sync_interval_secs: u64,
    /// Milliseconds a partial frame may sit without progress before it is dropped.
    pub parse_timeout_ms: u64,
    /// Largest payload sent in one frame; bigger payloads are fragmented.
    pub payload_limit: usize,
}

impl Default for SrrpConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 5,
            parse_timeout_ms: 1000,
            payload_limit: 1400,
        }
    }
}

impl SrrpConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("APIX_SYNC_INTERVAL") {
            self.sync_interval_secs = n;
        }
        if let Some(n) = env_parse("APIX_PARSE_TIMEOUT_MS") {
            self.parse_timeout_ms = n;
        }
        if let Some(n) = env_parse("APIX_PAYLOAD_LIMIT") {
            self.payload_limit = n;
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_millis(self.parse_timeout_ms)
    }
}

/// Listening addresses and node identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Node id announced in `/sync` packets.
    pub node_id: u16,
    /// TCP address to listen on, e.g. `127.0.0.1:3824`.
    pub tcp_listen: Option<String>,
    /// Unix socket path to listen on.
    pub unix_listen: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_id: 0xf000,
            tcp_listen: Some("127.0.0.1:3824".to_string()),
            unix_listen: None,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("APIX_NODE_ID") {
            if let Some(parsed) = parse_node_id(&id) {
                self.node_id = parsed;
            }
        }
        if let Ok(addr) = std::env::var("APIX_TCP_LISTEN") {
            self.tcp_listen = if addr.is_empty() { None } else { Some(addr) };
        }
        if let Ok(path) = std::env::var("APIX_UNIX_LISTEN") {
            self.unix_listen = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
    }
}

/// Parses a node id given in decimal or `0x` hex.
pub fn parse_node_id(s: &str) -> Option<u16> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
