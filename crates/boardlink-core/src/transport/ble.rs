//! Short-range wireless transport driver (BLE).
//!
//! Wraps btleplug behind a blocking facade: the driver owns a tokio
//! runtime and the synchronous trait methods `block_on` the async BLE
//! calls. Data flows over a UART-style GATT service (write + notify
//! characteristics); the characteristic UUIDs and the
//! advertised-name allow-list are configuration, not protocol truth,
//! since they differ per board family firmware.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::{Capabilities, ChunkProfile, TransportDriver, TransportError, TransportLink};
use crate::device::{DeviceDescriptor, TransportKind, TransportMetadata};

pub struct BleDriver {
    runtime: Arc<tokio::runtime::Runtime>,
    /// Advertised-name substrings that identify expected firmware.
    /// Deny-default: a device matching none of these is suppressed.
    name_filters: Vec<String>,
    write_char: Uuid,
    notify_char: Uuid,
    scan_window: Duration,
    read_timeout: Duration,
    profile: ChunkProfile,
}

impl BleDriver {
    pub fn new(
        name_filters: Vec<String>,
        write_char: Uuid,
        notify_char: Uuid,
        scan_window: Duration,
        read_timeout: Duration,
        profile: ChunkProfile,
    ) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
            name_filters,
            write_char,
            notify_char,
            scan_window,
            read_timeout,
            profile,
        })
    }

    fn name_allowed(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.name_filters
            .iter()
            .any(|f| lower.contains(&f.to_lowercase()))
    }

    async fn adapter() -> Result<Adapter, btleplug::Error> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(btleplug::Error::DeviceNotFound);
        }
        Ok(adapters.remove(0))
    }

    async fn scan(&self, adapter: &Adapter) -> Result<Vec<Peripheral>, btleplug::Error> {
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.scan_window).await;
        let _ = adapter.stop_scan().await;
        adapter.peripherals().await
    }
}

impl TransportDriver for BleDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Wireless
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            enumerate: true,
            send: true,
            receive: true,
            chunked_upload: true,
            opaque_upload: false,
            control_lines: false,
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.runtime.block_on(async {
            let adapter = Self::adapter()
                .await
                .map_err(|e| TransportError::ScanFailed(e.to_string()))?;
            let peripherals = self
                .scan(&adapter)
                .await
                .map_err(|e| TransportError::ScanFailed(e.to_string()))?;

            let mut devices = Vec::new();
            for p in peripherals {
                let Ok(Some(props)) = p.properties().await else {
                    continue;
                };
                let Some(name) = props.local_name else {
                    continue;
                };
                if !self.name_allowed(&name) {
                    debug!(name = %name, "Suppressed non-matching advertisement");
                    continue;
                }
                devices.push(DeviceDescriptor::wireless(
                    &p.address().to_string(),
                    &name,
                ));
            }
            debug!(count = devices.len(), "BLE enumeration complete");
            Ok(devices)
        })
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn TransportLink>, TransportError> {
        let TransportMetadata::Ble { address } = &descriptor.metadata else {
            return Err(TransportError::DeviceNotFound {
                id: descriptor.id.clone(),
            });
        };

        let open_failed = |message: String| TransportError::OpenFailed {
            kind: TransportKind::Wireless,
            message,
        };

        let (peripheral, write_char, notifications) = self.runtime.block_on(async {
            let adapter = Self::adapter().await.map_err(|e| open_failed(e.to_string()))?;
            let peripherals = self
                .scan(&adapter)
                .await
                .map_err(|e| open_failed(e.to_string()))?;
            let peripheral = peripherals
                .into_iter()
                .find(|p| p.address().to_string() == *address)
                .ok_or_else(|| TransportError::DeviceNotFound {
                    id: descriptor.id.clone(),
                })?;

            peripheral
                .connect()
                .await
                .map_err(|e| open_failed(e.to_string()))?;
            peripheral
                .discover_services()
                .await
                .map_err(|e| open_failed(e.to_string()))?;

            let chars = peripheral.characteristics();
            let write_char = chars
                .iter()
                .find(|c| c.uuid == self.write_char)
                .cloned()
                .ok_or_else(|| open_failed(format!("write characteristic {} not found", self.write_char)))?;
            let notify_char = chars.iter().find(|c| c.uuid == self.notify_char).cloned();

            let notifications = match &notify_char {
                Some(c) => {
                    peripheral
                        .subscribe(c)
                        .await
                        .map_err(|e| open_failed(e.to_string()))?;
                    Some(
                        peripheral
                            .notifications()
                            .await
                            .map_err(|e| open_failed(e.to_string()))?,
                    )
                }
                None => {
                    warn!(uuid = %self.notify_char, "Notify characteristic missing, monitor disabled");
                    None
                }
            };

            Ok::<_, TransportError>((peripheral, write_char, notifications))
        })?;

        info!(address = %address, "Connected to BLE device");

        Ok(Box::new(BleLink {
            runtime: Arc::clone(&self.runtime),
            peripheral,
            write_char,
            notifications,
            descriptor: descriptor.clone(),
            profile: self.profile,
            read_timeout: self.read_timeout,
            closed: false,
        }))
    }
}

pub struct BleLink {
    runtime: Arc<tokio::runtime::Runtime>,
    peripheral: Peripheral,
    write_char: Characteristic,
    notifications: Option<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>>,
    descriptor: DeviceDescriptor,
    profile: ChunkProfile,
    read_timeout: Duration,
    closed: bool,
}

impl TransportLink for BleLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Wireless
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn chunk_profile(&self) -> ChunkProfile {
        self.profile
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        self.runtime
            .block_on(
                self.peripheral
                    .write(&self.write_char, data, WriteType::WithoutResponse),
            )
            .map_err(|e| match e {
                btleplug::Error::NotConnected => TransportError::Disconnected,
                other => TransportError::WriteFailed(other.to_string()),
            })?;
        Ok(data.len())
    }

    fn read(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        let Some(stream) = self.notifications.as_mut() else {
            return Err(TransportError::Unsupported {
                kind: TransportKind::Wireless,
                operation: "read (no notify characteristic)",
            });
        };
        let timeout = self.read_timeout;
        match self
            .runtime
            .block_on(tokio::time::timeout(timeout, stream.next()))
        {
            Ok(Some(notification)) => Ok(notification.value),
            Ok(None) => Err(TransportError::Disconnected),
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn is_connected(&self) -> bool {
        if self.closed {
            return false;
        }
        self.runtime
            .block_on(self.peripheral.is_connected())
            .unwrap_or(false)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.runtime.block_on(self.peripheral.disconnect()) {
                debug!(error = %e, "BLE disconnect while closing");
            }
            info!(device = %self.descriptor.id, "Closed BLE link");
        }
        Ok(())
    }
}
