//! Boardlink-Core: transport and upload orchestration for hobbyist
//! microcontroller boards.
//!
//! This crate discovers boards over wired serial, BLE and the local
//! network, manages a single active connection with inbound fan-out,
//! pushes firmware with transport-specific pacing and bootloader
//! handling, and tracks remote compilation jobs.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Device**: Descriptors and transport classification
//! - **Transport**: Driver/link abstraction (serial, BLE, OTA, mock)
//! - **Registry**: Scanning, dedup, and network-target registration
//! - **Connection**: Single active link, reader thread, subscriber fan-out
//! - **Upload**: Firmware push state machine with cancellation
//! - **Compile**: Remote build-farm client and status poller
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use boardlink_core::config::LinkConfig;
//! use boardlink_core::registry::{DeviceRegistry, NetworkTargetStore};
//! use boardlink_core::transport::SerialDriver;
//! use boardlink_core::events::TracingObserver;
//!
//! let config = LinkConfig::default();
//! let serial = Arc::new(SerialDriver::new(
//!     config.serial.baud_rate,
//!     config.serial.read_timeout(),
//!     config.serial.chunk_profile(),
//! ));
//! let registry = DeviceRegistry::new(
//!     vec![serial],
//!     Arc::new(Mutex::new(NetworkTargetStore::in_memory())),
//!     Arc::new(TracingObserver),
//! );
//! for device in registry.scan() {
//!     println!("{device}");
//! }
//! ```

pub mod compile;
pub mod config;
pub mod connection;
pub mod device;
pub mod events;
pub mod registry;
pub mod transport;
pub mod upload;

// Re-exports for convenience
pub use compile::{
    Board, CompilationJob, CompileError, CompilePoller, CompileService, CompileStatus, PollerConfig,
};
pub use config::LinkConfig;
pub use connection::{ConnectionError, ConnectionManager, ConnectionState, SerialChunk};
pub use device::{DeviceDescriptor, TransportKind, TransportMetadata};
pub use events::{LinkEvent, LinkObserver, NullObserver, TracingObserver};
pub use registry::{DeviceRegistry, NetworkTarget, NetworkTargetStore, RegistryError};
pub use transport::{
    BleDriver, ChunkProfile, MockDriver, OtaDriver, SerialDriver, TransportDriver, TransportError,
    TransportLink,
};
pub use upload::{BootloaderTimings, CancelToken, UploadError, UploadJob, UploadState, Uploader};
