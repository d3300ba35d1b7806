//! Network-OTA transport driver.
//!
//! Targets are registered manually (name, host, port) and persisted;
//! enumeration returns the registrations, there is no live discovery.
//! Firmware delivery delegates to the target's own update protocol:
//! a framed header (magic + image length) followed by the image in
//! TCP-segment-sized blocks, with a status byte per block and a final
//! completion status from the device. The link supports nothing else;
//! raw send/receive calls fail fast.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use tracing::{debug, info};

use super::traits::{Capabilities, ChunkProfile, TransportDriver, TransportError, TransportLink};
use crate::device::{DeviceDescriptor, TransportKind, TransportMetadata};
use crate::registry::NetworkTargetStore;

/// Frame magic opening an OTA push.
const OTA_MAGIC: u32 = 0x4F544121; // "OTA!"
/// Image block size; one TCP segment worth of payload.
const OTA_BLOCK: usize = 1460;

pub struct OtaDriver {
    store: Arc<Mutex<NetworkTargetStore>>,
    connect_timeout: Duration,
}

impl OtaDriver {
    pub fn new(store: Arc<Mutex<NetworkTargetStore>>, connect_timeout: Duration) -> Self {
        Self {
            store,
            connect_timeout,
        }
    }
}

impl TransportDriver for OtaDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            enumerate: false,
            send: false,
            receive: false,
            chunked_upload: false,
            opaque_upload: true,
            control_lines: false,
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let store = self
            .store
            .lock()
            .map_err(|_| TransportError::ScanFailed("target store poisoned".to_string()))?;
        Ok(store
            .targets()
            .iter()
            .map(|t| DeviceDescriptor::network(&t.host, t.port, &t.name))
            .collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn TransportLink>, TransportError> {
        let TransportMetadata::Net { host, port } = &descriptor.metadata else {
            return Err(TransportError::DeviceNotFound {
                id: descriptor.id.clone(),
            });
        };

        let addr = (host.as_str(), *port)
            .to_socket_addrs()
            .map_err(|e| TransportError::OpenFailed {
                kind: TransportKind::Network,
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::OpenFailed {
                kind: TransportKind::Network,
                message: format!("{host}:{port} did not resolve"),
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
                TransportError::OpenFailed {
                    kind: TransportKind::Network,
                    message: e.to_string(),
                }
            })?;
        stream.set_read_timeout(Some(self.connect_timeout))?;
        stream.set_write_timeout(Some(self.connect_timeout))?;

        info!(host = %host, port = *port, "Connected to OTA target");

        Ok(Box::new(OtaLink {
            stream,
            descriptor: descriptor.clone(),
            closed: false,
        }))
    }
}

pub struct OtaLink {
    stream: TcpStream,
    descriptor: DeviceDescriptor,
    closed: bool,
}

impl TransportLink for OtaLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn chunk_profile(&self) -> ChunkProfile {
        // Unused: the OTA protocol does its own blocking internally.
        ChunkProfile {
            max_chunk: OTA_BLOCK,
            inter_chunk_delay: Duration::ZERO,
        }
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize, TransportError> {
        Err(TransportError::Unsupported {
            kind: TransportKind::Network,
            operation: "send",
        })
    }

    fn read(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported {
            kind: TransportKind::Network,
            operation: "receive",
        })
    }

    fn push_image(
        &mut self,
        image: &[u8],
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        let total = image.len() as u64;

        let mut header = Vec::with_capacity(8);
        header.write_u32::<BigEndian>(OTA_MAGIC)?;
        header.write_u32::<BigEndian>(image.len() as u32)?;
        self.stream
            .write_all(&header)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut sent = 0u64;
        for block in image.chunks(OTA_BLOCK) {
            self.stream
                .write_all(block)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

            // Per-block status byte from the device.
            let mut status = [0u8; 1];
            self.stream
                .read_exact(&mut status)
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
            if status[0] != b'O' {
                return Err(TransportError::WriteFailed(format!(
                    "target rejected block at offset {sent} (status 0x{:02X})",
                    status[0]
                )));
            }

            sent += block.len() as u64;
            progress(sent, total);
            debug!(sent, total, "OTA block acknowledged");
        }

        // Final completion status.
        let mut done = [0u8; 2];
        self.stream
            .read_exact(&mut done)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        if &done != b"OK" {
            return Err(TransportError::WriteFailed(
                "target reported OTA failure after final block".to_string(),
            ));
        }

        info!(total, "OTA push complete");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
            info!(device = %self.descriptor.id, "Closed OTA link");
        }
        Ok(())
    }
}
