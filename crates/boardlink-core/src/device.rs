//! Device identity types produced by registry scans.
//!
//! A [`DeviceDescriptor`] is an immutable snapshot: re-scans supersede
//! descriptors, they never mutate them. Ids are transport-scoped and
//! stable across scans for the same physical device.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of supported transport classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// USB CDC serial link with control lines.
    Wired,
    /// Short-range wireless link (BLE UART-style service).
    Wireless,
    /// Network target with its own OTA update protocol.
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Wired => write!(f, "wired"),
            TransportKind::Wireless => write!(f, "wireless"),
            TransportKind::Network => write!(f, "network"),
        }
    }
}

/// Transport-specific addressing details carried by a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMetadata {
    Usb {
        port: String,
        vid: Option<u16>,
        pid: Option<u16>,
    },
    Ble {
        address: String,
    },
    Net {
        host: String,
        port: u16,
    },
}

/// One discoverable (or registered) device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Transport-scoped unique id, e.g. `serial:/dev/ttyUSB0`,
    /// `ble:AA:BB:CC:DD:EE:FF`, `net:192.168.1.50:8266`.
    pub id: String,
    pub display_name: String,
    pub kind: TransportKind,
    pub metadata: TransportMetadata,
}

impl DeviceDescriptor {
    pub fn wired(port: &str, display_name: &str, vid: Option<u16>, pid: Option<u16>) -> Self {
        Self {
            id: format!("serial:{port}"),
            display_name: display_name.to_string(),
            kind: TransportKind::Wired,
            metadata: TransportMetadata::Usb {
                port: port.to_string(),
                vid,
                pid,
            },
        }
    }

    pub fn wireless(address: &str, display_name: &str) -> Self {
        Self {
            id: format!("ble:{address}"),
            display_name: display_name.to_string(),
            kind: TransportKind::Wireless,
            metadata: TransportMetadata::Ble {
                address: address.to_string(),
            },
        }
    }

    pub fn network(host: &str, port: u16, display_name: &str) -> Self {
        Self {
            id: format!("net:{host}:{port}"),
            display_name: display_name.to_string(),
            kind: TransportKind::Network,
            metadata: TransportMetadata::Net {
                host: host.to_string(),
                port,
            },
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.display_name, self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_transport_scoped() {
        let wired = DeviceDescriptor::wired("/dev/ttyACM0", "Uno", Some(0x2341), Some(0x0043));
        let net = DeviceDescriptor::network("192.168.1.50", 8266, "Shed ESP");

        assert_eq!(wired.id, "serial:/dev/ttyACM0");
        assert_eq!(net.id, "net:192.168.1.50:8266");
        assert_eq!(net.kind, TransportKind::Network);
        assert_eq!(
            net.metadata,
            TransportMetadata::Net {
                host: "192.168.1.50".to_string(),
                port: 8266
            }
        );
    }
}
