//! Event system for UI decoupling.
//!
//! The CLI (or any embedding UI) subscribes to orchestrator events
//! without tight coupling to the core logic.

use crate::compile::CompileStatus;
use crate::connection::ConnectionState;
use crate::device::DeviceDescriptor;
use crate::upload::UploadState;

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A scan finished; full superseding device list.
    DeviceListChanged { devices: Vec<DeviceDescriptor> },
    /// Connection lifecycle transition.
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A device connection was established.
    DeviceConnected { device: DeviceDescriptor },
    /// The active connection went away (requested or transport loss).
    DeviceDisconnected,
    /// Upload state machine transition.
    UploadStateChanged { from: UploadState, to: UploadState },
    /// Upload progress after a chunk boundary.
    UploadProgress { bytes_sent: u64, total_bytes: u64 },
    /// Remote compilation status observed by the poller.
    CompileStatusChanged { id: String, status: CompileStatus },
}

/// Observer trait for receiving orchestrator events.
///
/// Implement this in your UI layer to receive updates.
pub trait LinkObserver: Send + Sync {
    fn on_event(&self, event: &LinkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl LinkObserver for NullObserver {
    fn on_event(&self, _event: &LinkEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LinkObserver for TracingObserver {
    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::DeviceListChanged { devices } => {
                tracing::info!(count = devices.len(), "Device list changed");
            }
            LinkEvent::ConnectionStateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Connection state changed");
            }
            LinkEvent::DeviceConnected { device } => {
                tracing::info!(device = %device, "Device connected");
            }
            LinkEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            LinkEvent::UploadStateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Upload state changed");
            }
            LinkEvent::UploadProgress {
                bytes_sent,
                total_bytes,
            } => {
                let pct = if *total_bytes > 0 {
                    (*bytes_sent * 100) / *total_bytes
                } else {
                    100
                };
                tracing::debug!(
                    sent = bytes_sent,
                    total = total_bytes,
                    progress = %format!("{pct}%"),
                    "Upload progress"
                );
            }
            LinkEvent::CompileStatusChanged { id, status } => {
                tracing::info!(id = %id, status = %status, "Compile status");
            }
        }
    }
}
