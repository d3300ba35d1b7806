//! Orchestrator configuration, loaded from and saved to TOML.

use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::transport::ChunkProfile;
use crate::upload::BootloaderTimings;

/// Top-level configuration for the link orchestrator.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub serial: SerialConfig,
    pub wireless: WirelessConfig,
    pub network: NetworkConfig,
    pub bootloader: BootloaderConfig,
    pub compile: CompileConfig,
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that cannot produce a working driver set.
    pub fn validate(&self) -> Result<()> {
        if self.serial.chunk_size == 0 {
            bail!("serial.chunk_size must be at least 1");
        }
        if self.wireless.chunk_size == 0 {
            bail!("wireless.chunk_size must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub chunk_size: usize,
    pub inter_chunk_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout_ms: 100,
            chunk_size: 1024,
            inter_chunk_delay_ms: 20,
        }
    }
}

impl SerialConfig {
    pub fn chunk_profile(&self) -> ChunkProfile {
        ChunkProfile {
            max_chunk: self.chunk_size,
            inter_chunk_delay: Duration::from_millis(self.inter_chunk_delay_ms),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WirelessConfig {
    /// Advertised-name substrings to accept during scans; empty means
    /// nothing matches.
    pub name_filters: Vec<String>,
    /// Characteristic written to (Nordic UART Service TX by default).
    pub write_characteristic: String,
    /// Characteristic subscribed to for inbound notifications.
    pub notify_characteristic: String,
    pub scan_window_ms: u64,
    pub read_timeout_ms: u64,
    pub chunk_size: usize,
    pub inter_chunk_delay_ms: u64,
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self {
            name_filters: Vec::new(),
            write_characteristic: "6E400002-B5A3-F393-E0A9-E50E24DCCA9E".to_string(),
            notify_characteristic: "6E400003-B5A3-F393-E0A9-E50E24DCCA9E".to_string(),
            scan_window_ms: 3000,
            read_timeout_ms: 1000,
            chunk_size: 20,
            inter_chunk_delay_ms: 30,
        }
    }
}

impl WirelessConfig {
    pub fn chunk_profile(&self) -> ChunkProfile {
        ChunkProfile {
            max_chunk: self.chunk_size,
            inter_chunk_delay: Duration::from_millis(self.inter_chunk_delay_ms),
        }
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    /// Where the registered-target list is persisted; `None` keeps it
    /// in memory only.
    pub targets_path: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            targets_path: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootloaderConfig {
    pub assert_hold_ms: u64,
    pub settle_hold_ms: u64,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            assert_hold_ms: 250,
            settle_hold_ms: 50,
        }
    }
}

impl BootloaderConfig {
    pub fn timings(&self) -> BootloaderTimings {
        BootloaderTimings {
            assert_hold: Duration::from_millis(self.assert_hold_ms),
            settle_hold: Duration::from_millis(self.settle_hold_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    pub poll_interval_ms: u64,
    pub max_retries: u32,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_retries: 3,
        }
    }
}

impl CompileConfig {
    pub fn poller(&self) -> crate::compile::PollerConfig {
        crate::compile::PollerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_retries: self.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = LinkConfig::default();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.serial.chunk_size, 1024);
        assert_eq!(config.wireless.chunk_size, 20);
        assert_eq!(config.bootloader.timings().assert_hold, Duration::from_millis(250));
        assert_eq!(config.compile.poller().max_retries, 3);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: LinkConfig = toml::from_str(
            r#"
            [serial]
            baud_rate = 921600

            [wireless]
            name_filters = ["shed-node"]
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.baud_rate, 921_600);
        assert_eq!(config.serial.chunk_size, 1024);
        assert_eq!(config.wireless.name_filters, vec!["shed-node"]);
        assert_eq!(config.network.connect_timeout_ms, 5000);
    }

    #[test]
    fn zero_chunk_size_fails_validation() {
        let mut config = LinkConfig::default();
        assert!(config.validate().is_ok());
        config.serial.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn roundtrips_through_file() {
        let dir = std::env::temp_dir().join(format!("boardlink-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("link.toml");

        let mut config = LinkConfig::default();
        config.network.targets_path = Some("/var/lib/boardlink/targets.toml".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = LinkConfig::load_from_file(&path).unwrap();
        assert_eq!(
            loaded.network.targets_path.as_deref(),
            Some("/var/lib/boardlink/targets.toml")
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
