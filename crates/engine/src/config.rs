//! Engine configuration via `tessera.toml`
//!
//! On first open a default `tessera.toml` is written to the data directory.
//! To change settings, edit the file and reopen. The protocol and isolation
//! level are fixed for the lifetime of an open database.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_concurrency::{TransactionManagerConfig, DEFAULT_LOCK_TIMEOUT};
use tessera_core::{ConcurrencyProtocol, IsolationLevel};
use tessera_durability::mode::{DEFAULT_FLUSH_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_MS};
use tessera_durability::DurabilityMode;
use thiserror::Error;

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Default number of backend loggers
pub const DEFAULT_BACKEND_LOGGERS: usize = 4;

/// Default number of tuple slots per tile group
pub const DEFAULT_TILE_GROUP_CAPACITY: u32 = 1024;

/// Errors from loading or validating `tessera.toml`
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file could not be written
    #[error("failed to write config file '{path}': {source}")]
    Write {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("failed to parse config file '{path}': {message}")]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// The config could not be serialized
    #[error("failed to serialize config: {0}")]
    Serialize(String),

    /// A field holds a value outside its domain
    #[error("invalid value for '{field}': {message}")]
    InvalidValue {
        /// Field name as spelled in the file
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

impl From<ConfigError> for tessera_core::Error {
    fn from(e: ConfigError) -> Self {
        tessera_core::Error::InvalidConfig(e.to_string())
    }
}

/// Engine configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// protocol = "timestamp_ordering"
/// isolation = "serializable"
/// durability = "standard"
/// flush_interval_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `"timestamp_ordering"`, `"two_phase_locking"` or `"optimistic_copy"`
    #[serde(default = "default_protocol_str")]
    pub protocol: String,
    /// `"serializable"`, `"snapshot"` or `"read_committed"`
    #[serde(default = "default_isolation_str")]
    pub isolation: String,
    /// `"cache"`, `"always"` or `"standard"`
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Maximum time between flush cycles in standard mode
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Queued records that trigger an early flush cycle in standard mode
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    /// Number of backend log queues
    #[serde(default = "default_backend_loggers")]
    pub backend_loggers: usize,
    /// Bound on a single lock wait under two-phase locking
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Tuple slots per tile group
    #[serde(default = "default_tile_group_capacity")]
    pub tile_group_capacity: u32,
}

fn default_protocol_str() -> String {
    ConcurrencyProtocol::default().name().to_string()
}

fn default_isolation_str() -> String {
    "serializable".to_string()
}

fn default_durability_str() -> String {
    "standard".to_string()
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_flush_batch_size() -> usize {
    DEFAULT_FLUSH_BATCH_SIZE
}

fn default_backend_loggers() -> usize {
    DEFAULT_BACKEND_LOGGERS
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_millis() as u64
}

fn default_tile_group_capacity() -> u32 {
    DEFAULT_TILE_GROUP_CAPACITY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol_str(),
            isolation: default_isolation_str(),
            durability: default_durability_str(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_batch_size: default_flush_batch_size(),
            backend_loggers: default_backend_loggers(),
            lock_timeout_ms: default_lock_timeout_ms(),
            tile_group_capacity: default_tile_group_capacity(),
        }
    }
}

impl EngineConfig {
    /// Set the concurrency-control protocol
    pub fn with_protocol(mut self, protocol: ConcurrencyProtocol) -> Self {
        self.protocol = protocol.name().to_string();
        self
    }

    /// Set the default isolation level
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = match isolation {
            IsolationLevel::Serializable => "serializable",
            IsolationLevel::SnapshotIsolation => "snapshot",
            IsolationLevel::ReadCommitted => "read_committed",
        }
        .to_string();
        self
    }

    /// Set the durability mode, including its flush parameters
    pub fn with_durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = match mode {
            DurabilityMode::Cache => "cache",
            DurabilityMode::Always => "always",
            DurabilityMode::Standard {
                interval_ms,
                batch_size,
            } => {
                self.flush_interval_ms = interval_ms;
                self.flush_batch_size = batch_size;
                "standard"
            }
        }
        .to_string();
        self
    }

    /// Set the number of backend log queues
    pub fn with_backend_loggers(mut self, count: usize) -> Self {
        self.backend_loggers = count;
        self
    }

    /// Set the lock wait bound in milliseconds
    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// Set the number of slots per tile group
    pub fn with_tile_group_capacity(mut self, capacity: u32) -> Self {
        self.tile_group_capacity = capacity;
        self
    }

    /// Parse the protocol string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string names no known protocol.
    pub fn protocol(&self) -> Result<ConcurrencyProtocol, ConfigError> {
        ConcurrencyProtocol::parse(&self.protocol).ok_or_else(|| ConfigError::InvalidValue {
            field: "protocol",
            message: format!(
                "'{}'; expected \"timestamp_ordering\", \"two_phase_locking\" or \"optimistic_copy\"",
                self.protocol
            ),
        })
    }

    /// Parse the isolation string.
    pub fn isolation_level(&self) -> Result<IsolationLevel, ConfigError> {
        IsolationLevel::parse(&self.isolation).ok_or_else(|| ConfigError::InvalidValue {
            field: "isolation",
            message: format!(
                "'{}'; expected \"serializable\", \"snapshot\" or \"read_committed\"",
                self.isolation
            ),
        })
    }

    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"cache"`, `"always"` or
    /// `"standard"`.
    pub fn durability_mode(&self) -> Result<DurabilityMode, ConfigError> {
        match self.durability.as_str() {
            "cache" => Ok(DurabilityMode::Cache),
            "always" => Ok(DurabilityMode::Always),
            "standard" => Ok(DurabilityMode::Standard {
                interval_ms: self.flush_interval_ms,
                batch_size: self.flush_batch_size,
            }),
            other => Err(ConfigError::InvalidValue {
                field: "durability",
                message: format!(
                    "'{}'; expected \"cache\", \"always\" or \"standard\"",
                    other
                ),
            }),
        }
    }

    /// Lock wait bound
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Transaction manager settings derived from this config
    pub fn manager_config(&self) -> Result<TransactionManagerConfig, ConfigError> {
        Ok(TransactionManagerConfig::new(self.protocol()?)
            .with_isolation(self.isolation_level()?)
            .with_lock_timeout(self.lock_timeout()))
    }

    /// Check every field
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol()?;
        self.isolation_level()?;
        self.durability_mode()?;

        let positive: [(&'static str, u64); 5] = [
            ("flush_interval_ms", self.flush_interval_ms),
            ("flush_batch_size", self.flush_batch_size as u64),
            ("backend_loggers", self.backend_loggers as u64),
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("tile_group_capacity", u64::from(self.tile_group_capacity)),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera engine configuration
#
# Concurrency-control protocol, fixed while the database is open:
#   "timestamp_ordering" (default), "two_phase_locking" or "optimistic_copy"
protocol = "timestamp_ordering"

# Default isolation level: "serializable" (default), "snapshot" or "read_committed"
isolation = "serializable"

# Durability mode: "standard" (default), "always" or "cache"
#   "standard" = group commit on a timer or record threshold
#   "always"   = every commit triggers a flush cycle
#   "cache"    = no log, all data lost on exit
durability = "standard"

# Group commit parameters for "standard"
flush_interval_ms = 100
flush_batch_size = 1000

# Number of backend log queues
backend_loggers = 4

# Bound on a single lock wait under two_phase_locking
lock_timeout_ms = 1000

# Tuple slots per tile group
tile_group_capacity = 1024
"#
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
