//! Transport layer module.

pub mod ble;
pub mod mock;
pub mod ota;
pub mod serial;
pub mod traits;

pub use ble::BleDriver;
pub use mock::MockDriver;
pub use ota::OtaDriver;
pub use serial::SerialDriver;
pub use traits::{Capabilities, ChunkProfile, TransportDriver, TransportError, TransportLink};
