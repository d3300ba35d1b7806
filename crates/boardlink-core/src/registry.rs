//! Device registry: multi-driver scans and network-target registration.
//!
//! A scan walks every transport driver; one failing driver degrades to
//! an empty contribution instead of aborting the others. Results are
//! deduplicated by descriptor id, first occurrence winning.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::device::DeviceDescriptor;
use crate::events::{LinkEvent, LinkObserver};
use crate::transport::TransportDriver;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no registered network target for host {0}")]
    UnknownHost(String),

    #[error("failed to persist network targets: {0}")]
    Store(String),
}

/// One manually registered network-OTA target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TargetFile {
    #[serde(default)]
    targets: Vec<NetworkTarget>,
}

/// Persistent set of network-OTA targets, keyed by host.
///
/// Shared between the registry (which mutates it) and the OTA driver
/// (which enumerates it).
#[derive(Debug, Default)]
pub struct NetworkTargetStore {
    path: Option<PathBuf>,
    targets: Vec<NetworkTarget>,
}

impl NetworkTargetStore {
    /// In-memory store with no persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from a TOML file, starting empty if it does not exist yet.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let targets = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| RegistryError::Store(e.to_string()))?;
            let file: TargetFile =
                toml::from_str(&content).map_err(|e| RegistryError::Store(e.to_string()))?;
            file.targets
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path),
            targets,
        })
    }

    fn save(&self, targets: &[NetworkTarget]) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = TargetFile {
            targets: targets.to_vec(),
        };
        let content =
            toml::to_string_pretty(&file).map_err(|e| RegistryError::Store(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| RegistryError::Store(e.to_string()))
    }

    pub fn targets(&self) -> &[NetworkTarget] {
        &self.targets
    }

    /// Add or replace (by host) a target and persist.
    ///
    /// The in-memory list only changes once persistence succeeds, so a
    /// failed save leaves memory and disk in agreement.
    pub fn upsert(&mut self, target: NetworkTarget) -> Result<(), RegistryError> {
        let mut next: Vec<NetworkTarget> = self
            .targets
            .iter()
            .filter(|t| t.host != target.host)
            .cloned()
            .collect();
        next.push(target);
        self.save(&next)?;
        self.targets = next;
        Ok(())
    }

    /// Remove a target by host and persist.
    pub fn remove(&mut self, host: &str) -> Result<(), RegistryError> {
        let next: Vec<NetworkTarget> = self
            .targets
            .iter()
            .filter(|t| t.host != host)
            .cloned()
            .collect();
        if next.len() == self.targets.len() {
            return Err(RegistryError::UnknownHost(host.to_string()));
        }
        self.save(&next)?;
        self.targets = next;
        Ok(())
    }
}

/// Syntactic host validation: IP literal or RFC-1123 hostname.
fn validate_host(host: &str) -> Result<(), RegistryError> {
    if host.is_empty() {
        return Err(RegistryError::Validation("host must not be empty".into()));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if host.len() > 253 {
        return Err(RegistryError::Validation("hostname too long".into()));
    }
    let label_ok = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };
    if host.split('.').all(label_ok) {
        Ok(())
    } else {
        Err(RegistryError::Validation(format!(
            "'{host}' is not a valid host"
        )))
    }
}

/// Registry over the closed driver set.
pub struct DeviceRegistry {
    drivers: Vec<Arc<dyn TransportDriver>>,
    store: Arc<Mutex<NetworkTargetStore>>,
    observer: Arc<dyn LinkObserver>,
}

impl DeviceRegistry {
    pub fn new(
        drivers: Vec<Arc<dyn TransportDriver>>,
        store: Arc<Mutex<NetworkTargetStore>>,
        observer: Arc<dyn LinkObserver>,
    ) -> Self {
        Self {
            drivers,
            store,
            observer,
        }
    }

    /// Scan all drivers and return the deduplicated device list.
    ///
    /// Safe to call while a connection is open: scanning never touches
    /// the active link. Driver failures are logged and skipped.
    pub fn scan(&self) -> Vec<DeviceDescriptor> {
        let mut devices = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for driver in &self.drivers {
            match driver.enumerate() {
                Ok(found) => {
                    for descriptor in found {
                        if seen.insert(descriptor.id.clone()) {
                            devices.push(descriptor);
                        } else {
                            warn!(id = %descriptor.id, "Duplicate device id suppressed");
                        }
                    }
                }
                Err(e) => {
                    warn!(transport = %driver.kind(), error = %e, "Driver scan failed, skipping");
                }
            }
        }

        info!(count = devices.len(), "Scan complete");
        self.observer.on_event(&LinkEvent::DeviceListChanged {
            devices: devices.clone(),
        });
        devices
    }

    /// Register (or replace) a network-OTA target.
    ///
    /// Validation runs before any mutation; invalid input leaves the
    /// registry unchanged.
    pub fn register_network_device(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::Validation("name must not be empty".into()));
        }
        validate_host(host)?;
        if port == 0 {
            return Err(RegistryError::Validation(
                "port must be in range 1..=65535".into(),
            ));
        }

        let mut store = self
            .store
            .lock()
            .map_err(|_| RegistryError::Store("target store poisoned".into()))?;
        store.upsert(NetworkTarget {
            name: name.to_string(),
            host: host.to_string(),
            port,
        })?;
        info!(host = %host, port, "Registered network target");
        Ok(())
    }

    /// Remove a registered network-OTA target.
    pub fn unregister_network_device(&self, host: &str) -> Result<(), RegistryError> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| RegistryError::Store("target store poisoned".into()))?;
        store.remove(host)?;
        info!(host = %host, "Unregistered network target");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TransportKind, TransportMetadata};
    use crate::events::NullObserver;
    use crate::transport::{MockDriver, OtaDriver};
    use std::time::Duration;

    fn registry_with(drivers: Vec<Arc<dyn TransportDriver>>) -> DeviceRegistry {
        DeviceRegistry::new(
            drivers,
            Arc::new(Mutex::new(NetworkTargetStore::in_memory())),
            Arc::new(NullObserver),
        )
    }

    #[test]
    fn scan_deduplicates_ids() {
        let a = MockDriver::new(TransportKind::Wired);
        let b = MockDriver::new(TransportKind::Wired);
        a.push_device(DeviceDescriptor::wired("/dev/ttyUSB0", "Uno", None, None));
        a.push_device(DeviceDescriptor::wired("/dev/ttyUSB1", "Mega", None, None));
        // Same physical device reported by both drivers.
        b.push_device(DeviceDescriptor::wired("/dev/ttyUSB0", "Uno", None, None));

        let registry = registry_with(vec![Arc::new(a), Arc::new(b)]);
        let devices = registry.scan();

        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["serial:/dev/ttyUSB0", "serial:/dev/ttyUSB1"]);
    }

    #[test]
    fn failing_driver_does_not_abort_scan() {
        let healthy = MockDriver::new(TransportKind::Wired);
        healthy.push_device(DeviceDescriptor::wired("/dev/ttyACM0", "Uno", None, None));
        let broken = MockDriver::new(TransportKind::Wireless);
        broken.fail_enumeration("radio unavailable");

        let registry = registry_with(vec![Arc::new(broken), Arc::new(healthy)]);
        let devices = registry.scan();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "serial:/dev/ttyACM0");
    }

    #[test]
    fn registered_network_target_appears_in_scan() {
        let store = Arc::new(Mutex::new(NetworkTargetStore::in_memory()));
        let ota = OtaDriver::new(Arc::clone(&store), Duration::from_secs(1));
        let registry = DeviceRegistry::new(
            vec![Arc::new(ota)],
            Arc::clone(&store),
            Arc::new(NullObserver),
        );

        registry
            .register_network_device("Shed ESP", "192.168.1.50", 8266)
            .unwrap();

        let devices = registry.scan();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, TransportKind::Network);
        assert_eq!(
            devices[0].metadata,
            TransportMetadata::Net {
                host: "192.168.1.50".to_string(),
                port: 8266
            }
        );
    }

    #[test]
    fn invalid_registration_leaves_registry_unchanged() {
        let store = Arc::new(Mutex::new(NetworkTargetStore::in_memory()));
        let ota = OtaDriver::new(Arc::clone(&store), Duration::from_secs(1));
        let registry = DeviceRegistry::new(
            vec![Arc::new(ota)],
            Arc::clone(&store),
            Arc::new(NullObserver),
        );

        assert!(matches!(
            registry.register_network_device("x", "bad host!", 8266),
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            registry.register_network_device("x", "192.168.1.50", 0),
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            registry.register_network_device("", "192.168.1.50", 8266),
            Err(RegistryError::Validation(_))
        ));
        assert!(registry.scan().is_empty());
    }

    #[test]
    fn reregistering_a_host_replaces_the_entry() {
        let store = Arc::new(Mutex::new(NetworkTargetStore::in_memory()));
        let ota = OtaDriver::new(Arc::clone(&store), Duration::from_secs(1));
        let registry = DeviceRegistry::new(
            vec![Arc::new(ota)],
            Arc::clone(&store),
            Arc::new(NullObserver),
        );

        registry
            .register_network_device("Old", "10.0.0.9", 8266)
            .unwrap();
        registry
            .register_network_device("New", "10.0.0.9", 3232)
            .unwrap();

        let devices = registry.scan();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].display_name, "New");
        assert_eq!(devices[0].id, "net:10.0.0.9:3232");
    }

    #[test]
    fn unregistering_unknown_host_is_an_error() {
        let registry = registry_with(vec![]);
        assert!(matches!(
            registry.unregister_network_device("10.0.0.9"),
            Err(RegistryError::UnknownHost(_))
        ));
    }

    #[test]
    fn host_validation_accepts_ips_and_hostnames() {
        assert!(validate_host("192.168.1.50").is_ok());
        assert!(validate_host("::1").is_ok());
        assert!(validate_host("esp-shed.local").is_ok());
        assert!(validate_host("").is_err());
        assert!(validate_host("under_score").is_err());
        assert!(validate_host("-leading.dash").is_err());
    }

    #[test]
    fn target_store_roundtrips_through_toml() {
        let dir = std::env::temp_dir().join(format!("boardlink-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("targets.toml");

        {
            let mut store = NetworkTargetStore::load_from_file(&path).unwrap();
            store
                .upsert(NetworkTarget {
                    name: "Shed ESP".into(),
                    host: "192.168.1.50".into(),
                    port: 8266,
                })
                .unwrap();
        }

        let store = NetworkTargetStore::load_from_file(&path).unwrap();
        assert_eq!(store.targets().len(), 1);
        assert_eq!(store.targets()[0].host, "192.168.1.50");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn failed_persist_leaves_store_unchanged() {
        // Parent directory does not exist, so every save fails.
        let mut store =
            NetworkTargetStore::load_from_file("/nonexistent-boardlink-dir/targets.toml").unwrap();

        let err = store
            .upsert(NetworkTarget {
                name: "Shed ESP".into(),
                host: "192.168.1.50".into(),
                port: 8266,
            })
            .unwrap_err();

        assert!(matches!(err, RegistryError::Store(_)));
        assert!(store.targets().is_empty());
    }
}
