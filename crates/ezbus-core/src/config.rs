//! Configuration system for ezbus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $EZBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ezbus/config.toml
//!   3. ~/.config/ezbus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::address::{Address, AddressError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EzbusConfig {
    pub node: NodeConfig,
    pub port: PortConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node address as 24 hex digits. Unset = random per run.
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Network interface the virtual bus runs on. Empty = OS default.
    pub interface: String,
    /// IPv6 multicast group shared by every node on the bus.
    pub group: String,
    /// UDP port of the multicast group.
    pub group_port: u16,
    /// Nominal bus speed in baud. Drives every derived timeout.
    pub speed: u32,
}

/// Protocol timing. Every value is in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub emit_min_ms: u64,
    pub emit_max_ms: u64,
    pub warmboot_min_ms: u64,
    pub warmboot_max_ms: u64,
    pub silent_jitter_min_ms: u64,
    pub silent_jitter_max_ms: u64,
    pub collision_backoff_min_ms: u64,
    pub collision_backoff_max_ms: u64,
    /// Lower bound on the derived ack timeout.
    pub ack_timeout_floor_ms: u64,
    /// Cold boot emissions to survive, and stable warm boot windows to
    /// observe, before moving on. A count.
    pub emit_cycles: u32,
    /// Resends of an unacknowledged packet before giving up. A count.
    pub retransmit_tries: u32,
    /// Ring passes between membership refreshes run by the most dominant
    /// node. 0 disables the refresh.
    pub refresh_rings: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            group: "ff02::ebb5".to_string(),
            group_port: 7466,
            speed: 115_200,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            emit_min_ms: 10,
            emit_max_ms: 50,
            warmboot_min_ms: 10,
            warmboot_max_ms: 100,
            silent_jitter_min_ms: 500,
            silent_jitter_max_ms: 1000,
            collision_backoff_min_ms: 1,
            collision_backoff_max_ms: 20,
            ack_timeout_floor_ms: 20,
            emit_cycles: 4,
            retransmit_tries: 3,
            refresh_rings: 256,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ezbus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid node address: {0}")]
    BadAddress(#[from] AddressError),
    #[error("node address {0} is reserved")]
    ReservedAddress(Address),
    #[error("{0}: minimum {1} exceeds maximum {2}")]
    InvertedRange(&'static str, u64, u64),
    #[error("port speed must be non-zero")]
    ZeroSpeed,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EzbusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EzbusConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("EZBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EzbusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The configured node address, if one is pinned.
    pub fn node_address(&self) -> Result<Option<Address>, ConfigError> {
        let Some(text) = self.node.address.as_deref() else {
            return Ok(None);
        };
        let address: Address = text.parse()?;
        if address.is_reserved() {
            return Err(ConfigError::ReservedAddress(address));
        }
        Ok(Some(address))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.speed == 0 {
            return Err(ConfigError::ZeroSpeed);
        }
        self.timing.validate()?;
        self.node_address()?;
        Ok(())
    }

    /// Apply EZBUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EZBUS_NODE__ADDRESS") {
            self.node.address = Some(v);
        }
        if let Ok(v) = std::env::var("EZBUS_PORT__INTERFACE") {
            self.port.interface = v;
        }
        if let Ok(v) = std::env::var("EZBUS_PORT__SPEED") {
            if let Ok(s) = v.parse() {
                self.port.speed = s;
            }
        }
        if let Ok(v) = std::env::var("EZBUS_PORT__GROUP_PORT") {
            if let Ok(p) = v.parse() {
                self.port.group_port = p;
            }
        }
        if let Ok(v) = std::env::var("EZBUS_TIMING__EMIT_CYCLES") {
            if let Ok(n) = v.parse() {
                self.timing.emit_cycles = n;
            }
        }
        if let Ok(v) = std::env::var("EZBUS_TIMING__RETRANSMIT_TRIES") {
            if let Ok(n) = v.parse() {
                self.timing.retransmit_tries = n;
            }
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ranges = [
            ("emit", self.emit_min_ms, self.emit_max_ms),
            ("warmboot", self.warmboot_min_ms, self.warmboot_max_ms),
            (
                "silent_jitter",
                self.silent_jitter_min_ms,
                self.silent_jitter_max_ms,
            ),
            (
                "collision_backoff",
                self.collision_backoff_min_ms,
                self.collision_backoff_max_ms,
            ),
        ];
        for (name, min, max) in ranges {
            if min > max {
                return Err(ConfigError::InvertedRange(name, min, max));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EzbusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.port.speed, 115_200);
        assert_eq!(config.timing.emit_cycles, 4);
        assert!(config.node.address.is_none());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut config = EzbusConfig::default();
        config.timing.warmboot_min_ms = 500;
        config.timing.warmboot_max_ms = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedRange("warmboot", 500, 100))
        ));
    }

    #[test]
    fn zero_speed_is_rejected() {
        let mut config = EzbusConfig::default();
        config.port.speed = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroSpeed)));
    }

    #[test]
    fn node_address_parses_and_rejects_reserved() {
        let mut config = EzbusConfig::default();
        config.node.address = Some("0102030405060708090a0b0c".to_string());
        let address = config.node_address().unwrap().unwrap();
        assert_eq!(address.to_string(), "0102030405060708090a0b0c");

        config.node.address = Some("ffffffffffffffffffffffff".to_string());
        assert!(matches!(
            config.node_address(),
            Err(ConfigError::ReservedAddress(_))
        ));

        config.node.address = Some("nothex".to_string());
        assert!(matches!(config.node_address(), Err(ConfigError::BadAddress(_))));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let text = "[timing]\nemit_cycles = 6\n\n[port]\nspeed = 9600\n";
        let config: EzbusConfig = toml::from_str(text).unwrap();
        assert_eq!(config.timing.emit_cycles, 6);
        assert_eq!(config.timing.retransmit_tries, 3);
        assert_eq!(config.port.speed, 9600);
        assert_eq!(config.port.group_port, 7466);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir()
            .join(format!("ezbus-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("EZBUS_CONFIG", config_path.to_str().unwrap());
        }

        let path = EzbusConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = EzbusConfig::load().expect("load should succeed");
        assert_eq!(config.timing, TimingConfig::default());

        unsafe {
            std::env::remove_var("EZBUS_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
