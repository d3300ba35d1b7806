//! Transport layer abstraction.
//!
//! Defines the `TransportDriver` / `TransportLink` trait pair the
//! orchestrator consumes. Drivers form a closed set (wired serial,
//! BLE, network-OTA, mock); each declares its capabilities explicitly
//! and unsupported operations fail fast instead of silently no-opping.

use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceDescriptor, TransportKind};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device not found: {id}")]
    DeviceNotFound { id: String },

    #[error("failed to open {kind} device: {message}")]
    OpenFailed { kind: TransportKind, message: String },

    #[error("enumeration failed: {0}")]
    ScanFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("{kind} transport does not support {operation}")]
    Unsupported {
        kind: TransportKind,
        operation: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which operations a driver's links support.
///
/// The upload state machine and connection manager dispatch on these
/// instead of probing with trial calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Live device discovery (vs. persisted registrations only).
    pub enumerate: bool,
    /// Arbitrary outbound bytes (serial console input).
    pub send: bool,
    /// Inbound byte stream (serial monitor).
    pub receive: bool,
    /// Firmware delivery as ordered, paced chunks.
    pub chunked_upload: bool,
    /// Firmware delivery delegated to the target's own protocol.
    pub opaque_upload: bool,
    /// Reset-trigger / bootloader-select control lines.
    pub control_lines: bool,
}

/// Per-transport chunking parameters for firmware transfer.
///
/// Pacing is a fixed conservative delay per transport, not negotiated
/// flow control: the remote receive buffer must drain between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProfile {
    pub max_chunk: usize,
    pub inter_chunk_delay: Duration,
}

/// A transport adapter: enumerates candidate devices and opens links.
pub trait TransportDriver: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn capabilities(&self) -> Capabilities;

    /// List candidate devices. Drivers without live discovery return
    /// their persisted registrations instead.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open a link to one device.
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One open session to a physical device.
///
/// Links are exclusively owned by the connection manager; upload and
/// monitor logic reach the device only through it.
pub trait TransportLink: Send {
    fn kind(&self) -> TransportKind;

    fn descriptor(&self) -> &DeviceDescriptor;

    fn chunk_profile(&self) -> ChunkProfile;

    /// Write raw bytes. Returns the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` inbound bytes, waiting at most the link's
    /// read timeout. An idle link yields `TransportError::Timeout`.
    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Drive the reset-trigger and bootloader-select lines.
    fn set_control_lines(&mut self, _reset: bool, _boot: bool) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            kind: self.kind(),
            operation: "control lines",
        })
    }

    /// Push a whole firmware image through the transport's own update
    /// protocol, reporting `(bytes_sent, total_bytes)` as it goes.
    fn push_image(
        &mut self,
        _image: &[u8],
        _progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            kind: self.kind(),
            operation: "opaque image push",
        })
    }

    fn is_connected(&self) -> bool;

    /// Release transport-held resources. Idempotent.
    fn close(&mut self) -> Result<(), TransportError>;
}
