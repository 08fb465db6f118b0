//! Configuration management for Lanshare.
//!
//! This module handles loading, saving, and managing engine configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/lanshare/config.toml` |
//! | macOS | `~/Library/Application Support/Lanshare/config.toml` |
//! | Windows | `%APPDATA%\Lanshare\config.toml` |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name announced on the network
    pub display_name: String,
    /// Default directory for received files
    pub save_directory: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            display_name: hostname::get().map_or_else(
                |_| "Lanshare Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            save_directory: None,
        }
    }
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Discovery port (UDP broadcast)
    pub discovery_port: u16,
    /// Handshake port (TCP)
    pub handshake_port: u16,
    /// Transfer base port (TCP); chunk ports default to base + 1 + index
    pub transfer_port: u16,
    /// Dynamic port range searched when a default chunk port is taken
    pub dynamic_port_range: (u16, u16),
    /// Broadcast interval in milliseconds
    pub broadcast_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: crate::DEFAULT_DISCOVERY_PORT,
            handshake_port: crate::DEFAULT_HANDSHAKE_PORT,
            transfer_port: crate::DEFAULT_TRANSFER_PORT,
            dynamic_port_range: (
                crate::DYNAMIC_PORT_RANGE.start,
                crate::DYNAMIC_PORT_RANGE.end,
            ),
            broadcast_interval_ms: 1000,
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Single-chunk threshold and chunk size floor, in bytes
    pub base_chunk_size: u64,
    /// Chunk size ceiling, in bytes
    pub max_chunk_size: u64,
    /// Concurrent chunk transfers per file
    pub parallel_chunks: usize,
    /// Per-chunk send attempts before the file fails
    pub chunk_retries: u32,
    /// Base delay between chunk retries, in milliseconds (doubles per retry)
    pub retry_backoff_ms: u64,
    /// Seconds without forward progress before a chunk is declared stalled
    pub stall_timeout_secs: u64,
    /// Handshake / READY / accept timeout, in seconds
    pub io_timeout_secs: u64,
    /// How long a transfer request may wait for the human on the other
    /// side to decide, in seconds
    pub decision_timeout_secs: u64,
    /// Grace period for in-flight work during shutdown, in seconds
    pub shutdown_grace_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            base_chunk_size: crate::BASE_CHUNK_SIZE,
            max_chunk_size: crate::MAX_CHUNK_SIZE,
            parallel_chunks: crate::DEFAULT_PARALLEL_CHUNKS,
            chunk_retries: crate::DEFAULT_CHUNK_RETRIES,
            retry_backoff_ms: 2000,
            stall_timeout_secs: 60,
            io_timeout_secs: 30,
            decision_timeout_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl TransferConfig {
    /// Bounded I/O timeout as a [`Duration`].
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Stall interval as a [`Duration`].
    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// Window for the remote user to answer a transfer request.
    #[must_use]
    pub const fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    /// Backoff before retry `n` (1-based): base delay doubled per retry.
    #[must_use]
    pub const fn retry_backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms << retry.saturating_sub(1))
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read
    /// or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Path of the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("com", "lanshare", "Lanshare").map_or_else(
            || PathBuf::from("config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}
