//! Mock transport driver for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{Capabilities, ChunkProfile, TransportDriver, TransportError, TransportLink};
use crate::device::{DeviceDescriptor, TransportKind};

/// State shared between a [`MockDriver`] and the links it hands out,
/// so tests observe everything through the driver.
#[derive(Default)]
struct MockState {
    /// Queued inbound chunks returned on read.
    read_queue: Mutex<VecDeque<Vec<u8>>>,
    /// Captured writes.
    write_log: Mutex<Vec<Vec<u8>>>,
    /// Captured `(reset, boot)` control-line transitions.
    control_log: Mutex<Vec<(bool, bool)>>,
    /// Lifecycle log: `open:<id>` / `close:<id>` in call order.
    lifecycle: Mutex<Vec<String>>,
    /// Whether the simulated device is reachable.
    connected: AtomicBool,
    /// Fail the nth write (0-based) with a transport error.
    fail_write_at: Mutex<Option<usize>>,
    writes_seen: Mutex<usize>,
}

/// Mock driver for unit testing registry, connection and upload logic.
pub struct MockDriver {
    kind: TransportKind,
    caps: Capabilities,
    profile: ChunkProfile,
    devices: Mutex<Vec<DeviceDescriptor>>,
    enumerate_error: Mutex<Option<String>>,
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new(kind: TransportKind) -> Self {
        let caps = match kind {
            TransportKind::Wired => Capabilities {
                enumerate: true,
                send: true,
                receive: true,
                chunked_upload: true,
                opaque_upload: false,
                control_lines: true,
            },
            TransportKind::Wireless => Capabilities {
                enumerate: true,
                send: true,
                receive: true,
                chunked_upload: true,
                opaque_upload: false,
                control_lines: false,
            },
            TransportKind::Network => Capabilities {
                enumerate: false,
                send: false,
                receive: false,
                chunked_upload: false,
                opaque_upload: true,
                control_lines: false,
            },
        };
        let state = MockState {
            connected: AtomicBool::new(true),
            ..MockState::default()
        };
        Self {
            kind,
            caps,
            profile: ChunkProfile {
                max_chunk: 20,
                inter_chunk_delay: Duration::ZERO,
            },
            devices: Mutex::new(Vec::new()),
            enumerate_error: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    pub fn with_chunk_profile(mut self, profile: ChunkProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Add a device to the enumeration result.
    pub fn push_device(&self, descriptor: DeviceDescriptor) {
        self.devices.lock().unwrap().push(descriptor);
    }

    /// Make the next `enumerate` calls fail.
    pub fn fail_enumeration(&self, message: &str) {
        *self.enumerate_error.lock().unwrap() = Some(message.to_string());
    }

    /// Queue an inbound chunk to be returned on a link read.
    pub fn queue_read(&self, data: &[u8]) {
        self.state.read_queue.lock().unwrap().push_back(data.to_vec());
    }

    /// All bytes written through links of this driver, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.write_log.lock().unwrap().clone()
    }

    /// Control-line transitions in call order.
    pub fn control_sequence(&self) -> Vec<(bool, bool)> {
        self.state.control_log.lock().unwrap().clone()
    }

    /// `open:<id>` / `close:<id>` entries in call order.
    pub fn lifecycle(&self) -> Vec<String> {
        self.state.lifecycle.lock().unwrap().clone()
    }

    /// Simulate transport loss for every outstanding link.
    pub fn drop_connection(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    /// Fail the nth write (0-based) after this call.
    pub fn fail_write_at(&self, n: usize) {
        *self.state.fail_write_at.lock().unwrap() = Some(n);
        *self.state.writes_seen.lock().unwrap() = 0;
    }
}

impl TransportDriver for MockDriver {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        if let Some(message) = self.enumerate_error.lock().unwrap().clone() {
            return Err(TransportError::ScanFailed(message));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn TransportLink>, TransportError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(TransportError::OpenFailed {
                kind: self.kind,
                message: "simulated device unreachable".to_string(),
            });
        }
        self.state
            .lifecycle
            .lock()
            .unwrap()
            .push(format!("open:{}", descriptor.id));
        Ok(Box::new(MockLink {
            kind: self.kind,
            caps: self.caps,
            profile: self.profile,
            descriptor: descriptor.clone(),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

pub struct MockLink {
    kind: TransportKind,
    caps: Capabilities,
    profile: ChunkProfile,
    descriptor: DeviceDescriptor,
    state: Arc<MockState>,
    closed: bool,
}

impl MockLink {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.closed || !self.state.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl TransportLink for MockLink {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn chunk_profile(&self) -> ChunkProfile {
        self.profile
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.check_alive()?;
        if !self.caps.send && !self.caps.chunked_upload {
            return Err(TransportError::Unsupported {
                kind: self.kind,
                operation: "write",
            });
        }
        {
            let mut seen = self.state.writes_seen.lock().unwrap();
            if let Some(n) = *self.state.fail_write_at.lock().unwrap()
                && *seen == n
            {
                *seen += 1;
                return Err(TransportError::WriteFailed("injected failure".to_string()));
            }
            *seen += 1;
        }
        self.state.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.check_alive()?;
        if !self.caps.receive {
            return Err(TransportError::Unsupported {
                kind: self.kind,
                operation: "read",
            });
        }
        match self.state.read_queue.lock().unwrap().pop_front() {
            Some(data) => Ok(data),
            None => {
                // Keep the reader thread from spinning on an idle mock.
                thread::sleep(Duration::from_millis(2));
                Err(TransportError::Timeout { timeout_ms: 2 })
            }
        }
    }

    fn set_control_lines(&mut self, reset: bool, boot: bool) -> Result<(), TransportError> {
        self.check_alive()?;
        if !self.caps.control_lines {
            return Err(TransportError::Unsupported {
                kind: self.kind,
                operation: "control lines",
            });
        }
        self.state.control_log.lock().unwrap().push((reset, boot));
        Ok(())
    }

    fn push_image(
        &mut self,
        image: &[u8],
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransportError> {
        self.check_alive()?;
        if !self.caps.opaque_upload {
            return Err(TransportError::Unsupported {
                kind: self.kind,
                operation: "opaque image push",
            });
        }
        self.state.write_log.lock().unwrap().push(image.to_vec());
        progress(image.len() as u64, image.len() as u64);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed && self.state.connected.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.state
                .lifecycle
                .lock()
                .unwrap()
                .push(format!("close:{}", self.descriptor.id));
        }
        Ok(())
    }
}
