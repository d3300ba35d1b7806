//! Wired serial transport driver.
//!
//! Enumerates USB CDC ports and opens them at a configured baud rate.
//! The control lines map RTS to the reset trigger and DTR to the
//! bootloader select, the wiring common to hobbyist dev boards. Exact
//! hold timings live in the upload state machine, not here.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use tracing::{debug, info};

use super::traits::{Capabilities, ChunkProfile, TransportDriver, TransportError, TransportLink};
use crate::device::{DeviceDescriptor, TransportKind, TransportMetadata};

pub struct SerialDriver {
    baud: u32,
    read_timeout: Duration,
    profile: ChunkProfile,
}

impl SerialDriver {
    pub fn new(baud: u32, read_timeout: Duration, profile: ChunkProfile) -> Self {
        Self {
            baud,
            read_timeout,
            profile,
        }
    }
}

impl TransportDriver for SerialDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Wired
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            enumerate: true,
            send: true,
            receive: true,
            chunked_upload: true,
            opaque_upload: false,
            control_lines: true,
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let ports = serialport::available_ports()
            .map_err(|e| TransportError::ScanFailed(e.to_string()))?;

        let mut devices = Vec::new();
        for port in ports {
            // Only USB CDC ports; legacy UARTs and virtual ports are not
            // firmware targets.
            if let SerialPortType::UsbPort(usb) = port.port_type {
                let name = usb
                    .product
                    .clone()
                    .unwrap_or_else(|| port.port_name.clone());
                devices.push(DeviceDescriptor::wired(
                    &port.port_name,
                    &name,
                    Some(usb.vid),
                    Some(usb.pid),
                ));
            }
        }
        debug!(count = devices.len(), "Serial enumeration complete");
        Ok(devices)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn TransportLink>, TransportError> {
        let TransportMetadata::Usb { port, .. } = &descriptor.metadata else {
            return Err(TransportError::DeviceNotFound {
                id: descriptor.id.clone(),
            });
        };

        let handle = serialport::new(port, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| TransportError::OpenFailed {
                kind: TransportKind::Wired,
                message: e.to_string(),
            })?;

        info!(port = %port, baud = self.baud, "Opened serial port");

        Ok(Box::new(SerialLink {
            port: handle,
            descriptor: descriptor.clone(),
            profile: self.profile,
            read_timeout_ms: self.read_timeout.as_millis() as u64,
            closed: false,
        }))
    }
}

pub struct SerialLink {
    port: Box<dyn SerialPort>,
    descriptor: DeviceDescriptor,
    profile: ChunkProfile,
    read_timeout_ms: u64,
    closed: bool,
}

fn map_io_error(e: std::io::Error, timeout_ms: u64) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::TimedOut => TransportError::Timeout { timeout_ms },
        std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => {
            TransportError::Disconnected
        }
        _ => TransportError::ReadFailed(e.to_string()),
    }
}

impl TransportLink for SerialLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Wired
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
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => {
                    TransportError::Disconnected
                }
                _ => TransportError::WriteFailed(e.to_string()),
            })?;
        Ok(data.len())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        let mut buf = vec![0u8; max_len];
        match self.port.read(&mut buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(map_io_error(e, self.read_timeout_ms)),
        }
    }

    fn set_control_lines(&mut self, reset: bool, boot: bool) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        // RTS drives the reset trigger, DTR the bootloader select.
        self.port
            .write_request_to_send(reset)
            .and_then(|_| self.port.write_data_terminal_ready(boot))
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(reset, boot, "Control lines set");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            info!(device = %self.descriptor.id, "Closed serial port");
        }
        Ok(())
    }
}
