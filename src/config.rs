//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/edge_link.toml` (or a path given on the command line)
//! 2. Environment variables prefixed with `EDGE_LINK_`, nested keys separated
//!    by a double underscore
//!
//! Every field has a default, so a missing file yields a working setup.
//!
//! # Example
//! ```no_run
//! use edge_link::config::LinkConfig;
//!
//! // EDGE_LINK_UPLOAD__CHUNK_DELAY_MS=10 overrides upload.chunk_delay_ms
//! let config = LinkConfig::load()?;
//! config.validate()?;
//! println!("Scanning for {}", config.discovery.name_prefix);
//! # Ok::<(), edge_link::error::LinkError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppResult, LinkError};
use crate::protocol::{upload::chunk_payload_len, DEVICE_NAME_PREFIX, SERVICE_UUID};
use crate::transport::DeviceFilter;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/edge_link.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "EDGE_LINK_";

/// Largest ATT write any supported stack negotiates.
const MAX_ATT_WRITE: usize = 512;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Device discovery
    pub discovery: DiscoveryConfig,
    /// Silent reconnect policy
    pub reconnect: ReconnectConfig,
    /// Model upload pacing
    pub upload: UploadConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

/// Which devices to offer in the chooser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Advertised name prefix
    pub name_prefix: String,
    /// Primary service the device must expose
    pub service_uuid: Uuid,
    /// Scan duration for backends that scan instead of showing a chooser
    pub scan_window_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            service_uuid: SERVICE_UUID,
            scan_window_ms: 4000,
        }
    }
}

/// Silent reconnect attempts after an unexpected drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts before asking the user to re-pair
    pub max_attempts: u32,
    /// Delay before each attempt; the last entry repeats
    pub delays_ms: Vec<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delays_ms: vec![500, 1500],
        }
    }
}

/// Upload pacing and status polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Largest single write the link accepts (opcode + offset + payload)
    pub max_write_size: usize,
    /// Pause between chunk writes
    pub chunk_delay_ms: u64,
    /// Pause after Complete before the first status read
    pub settle_delay_ms: u64,
    /// Pause between status reads while the device is still busy
    pub status_poll_interval_ms: u64,
    /// Status reads before giving up
    pub status_poll_attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_write_size: 244,
            chunk_delay_ms: 20,
            settle_delay_ms: 1000,
            status_poll_interval_ms: 250,
            status_poll_attempts: 8,
        }
    }
}

impl UploadConfig {
    /// Blob bytes carried by each Chunk command.
    pub fn chunk_payload_len(&self) -> usize {
        chunk_payload_len(self.max_write_size)
    }

    /// Pause between chunk writes.
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Wait after Complete before the first status read.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Wait between status reads.
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LinkConfig {
    /// Load from the default file and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path, then apply environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(LinkConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if self.discovery.name_prefix.trim().is_empty() {
            return Err(LinkError::Configuration(
                "discovery.name_prefix must not be empty".into(),
            ));
        }

        let write = self.upload.max_write_size;
        if write <= crate::protocol::upload::CHUNK_HEADER_LEN || write > MAX_ATT_WRITE {
            return Err(LinkError::Configuration(format!(
                "Invalid upload.max_write_size {}. Must be {}..={}",
                write,
                crate::protocol::upload::CHUNK_HEADER_LEN + 1,
                MAX_ATT_WRITE
            )));
        }

        if self.upload.status_poll_attempts == 0 {
            return Err(LinkError::Configuration(
                "upload.status_poll_attempts must be at least 1".into(),
            ));
        }

        if self.reconnect.max_attempts > 0 && self.reconnect.delays_ms.is_empty() {
            return Err(LinkError::Configuration(
                "reconnect.delays_ms must list at least one delay when max_attempts > 0".into(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(LinkError::Configuration(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(LinkError::Configuration(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }

    /// Discovery criteria for the transport.
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            name_prefix: self.discovery.name_prefix.clone(),
            service: self.discovery.service_uuid,
            scan_window: Duration::from_millis(self.discovery.scan_window_ms),
        }
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LinkError::Configuration(format!("Failed to render config: {e}")))
    }
}
