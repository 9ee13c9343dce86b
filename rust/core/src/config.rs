//! Adapter configuration, loaded from TOML

use crate::error::ConfigError;
use crate::message::{lock_name, Role, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Size of the segment header: `u32` write offset plus `u8` message count
pub const HEADER_SIZE: usize = 5;

/// File name looked up in the working directory when no config is given
pub const DEFAULT_CONFIG_FILE: &str = "studio-link.toml";

/// Where segment memory comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backing {
    /// Named shared memory where the platform has it, a temp file otherwise
    Auto,
    /// Named shared memory only
    SharedMemory,
    /// A shared file in the temp directory
    File,
}

impl Default for Backing {
    fn default() -> Self {
        Backing::Auto
    }
}

/// Adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Well-known name shared by both processes
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Segment size in bytes
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Bytes at the end of a segment that are never written
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,

    /// Upper bound of messages stored per segment
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Tick period in milliseconds
    #[serde(default = "default_update_rate_ms")]
    pub update_rate_ms: u64,

    /// Idle time after which a ping is written
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Silence after which the peer is considered gone
    #[serde(default = "default_timeout_delay_ms")]
    pub timeout_delay_ms: u64,

    /// Two faults closer than this count as a crash loop
    #[serde(default = "default_crash_window_ms")]
    pub crash_window_ms: u64,

    #[serde(default)]
    pub backing: Backing,

    /// Remove the named segments when the adapter is disposed
    #[serde(default)]
    pub unlink_on_dispose: bool,

    /// Version announced to the peer; a mismatch stops the link
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
}

fn default_channel() -> String {
    "StudioLink".to_string()
}

fn default_capacity() -> usize {
    1024 * 1024
}

fn default_safety_margin() -> usize {
    4096
}

fn default_max_messages() -> usize {
    100
}

fn default_update_rate_ms() -> u64 {
    1000 / 60
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_timeout_delay_ms() -> u64 {
    3000
}

fn default_crash_window_ms() -> u64 {
    5000
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            capacity: default_capacity(),
            safety_margin: default_safety_margin(),
            max_messages: default_max_messages(),
            update_rate_ms: default_update_rate_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            timeout_delay_ms: default_timeout_delay_ms(),
            crash_window_ms: default_crash_window_ms(),
            backing: Backing::default(),
            unlink_on_dispose: false,
            protocol_version: default_protocol_version(),
        }
    }
}

impl AdapterConfig {
    /// Default settings on a different channel
    pub fn with_channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path)?;
        let config: AdapterConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Look for a config file in the working directory
    pub fn find_config_file() -> Option<PathBuf> {
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            info!("Using config file found at {}", local.display());
            return Some(local.to_path_buf());
        }
        None
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::Invalid("channel must not be empty".to_string()));
        }
        if self.capacity <= self.safety_margin + HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "capacity {} leaves no room after the {} byte safety margin",
                self.capacity, self.safety_margin
            )));
        }
        if self.capacity > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "capacity {} does not fit the 32-bit write offset",
                self.capacity
            )));
        }
        if self.max_messages == 0 || self.max_messages > u8::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_messages must be within 1..=255, got {}",
                self.max_messages
            )));
        }
        if self.update_rate_ms == 0 {
            return Err(ConfigError::Invalid("update_rate_ms must be positive".to_string()));
        }
        if self.timeout_delay_ms < self.ping_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "timeout_delay_ms ({}) must not be shorter than ping_interval_ms ({})",
                self.timeout_delay_ms, self.ping_interval_ms
            )));
        }
        Ok(())
    }

    pub fn update_rate(&self) -> Duration {
        Duration::from_millis(self.update_rate_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn timeout_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_delay_ms)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_millis(self.crash_window_ms)
    }

    pub fn outbound_segment(&self, role: Role) -> String {
        role.outbound_segment(&self.channel)
    }

    pub fn inbound_segment(&self, role: Role) -> String {
        role.inbound_segment(&self.channel)
    }

    pub fn lock_name(&self) -> String {
        lock_name(&self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AdapterConfig::default();
        assert_eq!(config.channel, "StudioLink");
        assert_eq!(config.capacity, 1 << 20);
        assert_eq!(config.safety_margin, 4096);
        assert_eq!(config.max_messages, 100);
        assert_eq!(config.update_rate(), Duration::from_millis(16));
        assert_eq!(config.ping_interval(), Duration::from_secs(1));
        assert_eq!(config.timeout_delay(), Duration::from_secs(3));
        assert_eq!(config.crash_window(), Duration::from_secs(5));
        assert_eq!(config.backing, Backing::Auto);
        assert!(!config.unlink_on_dispose);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_names() {
        let config = AdapterConfig::with_channel("Celeste");
        assert_eq!(config.outbound_segment(Role::Host), "Celeste_H2E");
        assert_eq!(config.inbound_segment(Role::Host), "Celeste_E2H");
        assert_eq!(config.lock_name(), "Celeste_Lock");
    }

    #[test]
    fn test_partial_file_uses_defaults() -> anyhow::Result<()> {
        let config: AdapterConfig = toml::from_str(
            r#"
            channel = "Custom"
            backing = "file"
            ping_interval_ms = 500
            "#,
        )?;
        assert_eq!(config.channel, "Custom");
        assert_eq!(config.backing, Backing::File);
        assert_eq!(config.ping_interval_ms, 500);
        assert_eq!(config.timeout_delay_ms, 3000);
        assert_eq!(config.max_messages, 100);
        Ok(())
    }

    #[test]
    fn test_save_and_load_config() -> anyhow::Result<()> {
        let config = AdapterConfig {
            channel: "RoundTrip".to_string(),
            capacity: 64 * 1024,
            safety_margin: 512,
            backing: Backing::SharedMemory,
            unlink_on_dispose: true,
            ..Default::default()
        };

        let temp_file = NamedTempFile::new()?;
        config.save_to_file(temp_file.path())?;
        let loaded = AdapterConfig::from_file(temp_file.path())?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_validation_rejects_inconsistent_values() {
        let tiny = AdapterConfig {
            capacity: 4096,
            ..Default::default()
        };
        assert!(matches!(tiny.validate(), Err(ConfigError::Invalid(_))));

        let impatient = AdapterConfig {
            timeout_delay_ms: 100,
            ..Default::default()
        };
        assert!(impatient.validate().is_err());

        let crowded = AdapterConfig {
            max_messages: 300,
            ..Default::default()
        };
        assert!(crowded.validate().is_err());

        let silent = AdapterConfig {
            max_messages: 0,
            ..Default::default()
        };
        assert!(silent.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_parse_error() -> anyhow::Result<()> {
        let temp_file = NamedTempFile::new()?;
        std::fs::write(temp_file.path(), "capacity = \"large\"")?;
        assert!(matches!(
            AdapterConfig::from_file(temp_file.path()),
            Err(ConfigError::Parse(_))
        ));
        Ok(())
    }
}
