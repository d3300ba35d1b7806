//! Connection manager: the single live device session.
//!
//! At most one connection exists system-wide; connecting to a new
//! device tears the previous one down first. Inbound bytes are fanned
//! out to subscribers in arrival order on a dedicated reader thread.
//! Upload logic reaches the link only through an [`UploadHandle`],
//! which also enforces the one-in-flight-upload invariant.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{DeviceDescriptor, TransportKind};
use crate::events::{LinkEvent, LinkObserver};
use crate::transport::{Capabilities, ChunkProfile, TransportDriver, TransportError, TransportLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    #[error("no driver registered for {0} transport")]
    NoDriver(TransportKind),

    #[error("{kind} transport does not support {operation}")]
    Unsupported {
        kind: TransportKind,
        operation: &'static str,
    },

    #[error("{kind} transport error: {source}")]
    Transport {
        kind: TransportKind,
        #[source]
        source: TransportError,
    },

    #[error("another upload is already in flight")]
    UploadInFlight,
}

/// One timestamped inbound chunk, as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct SerialChunk {
    pub timestamp: SystemTime,
    pub payload: Vec<u8>,
}

pub type DataHandler = Box<dyn Fn(&SerialChunk) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// Link state shared with the reader thread and upload handles.
pub(crate) struct Shared {
    pub(crate) link: Mutex<Box<dyn TransportLink>>,
    /// Cleared on requested disconnect or unrecoverable transport error.
    pub(crate) alive: AtomicBool,
    /// Set while an [`UploadHandle`] is outstanding.
    pub(crate) upload_active: AtomicBool,
}

impl Shared {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Exclusive token for one firmware upload over the active connection.
///
/// Only one handle can be outstanding at a time; dropping it releases
/// the slot for the next upload.
pub struct UploadHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) device: DeviceDescriptor,
    pub(crate) caps: Capabilities,
    pub(crate) profile: ChunkProfile,
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        self.shared.upload_active.store(false, Ordering::SeqCst);
    }
}

struct ActiveConnection {
    device: DeviceDescriptor,
    caps: Capabilities,
    shared: Arc<Shared>,
    reader: Option<thread::JoinHandle<()>>,
}

pub struct ConnectionManager {
    drivers: Vec<Arc<dyn TransportDriver>>,
    active: Option<ActiveConnection>,
    subscribers: Arc<Mutex<Vec<(SubscriberId, DataHandler)>>>,
    next_subscriber: u64,
    observer: Arc<dyn LinkObserver>,
}

impl ConnectionManager {
    pub fn new(drivers: Vec<Arc<dyn TransportDriver>>, observer: Arc<dyn LinkObserver>) -> Self {
        Self {
            drivers,
            active: None,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: 0,
            observer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &self.active {
            Some(active) if active.shared.is_alive() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.active.as_ref().map(|a| &a.device)
    }

    fn emit(&self, event: LinkEvent) {
        self.observer.on_event(&event);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) {
        self.emit(LinkEvent::ConnectionStateChanged { from, to });
    }

    /// Connect to a device, tearing down any previous connection first.
    ///
    /// On driver failure the manager stays disconnected and the driver
    /// error is surfaced unchanged inside `ConnectionError::Transport`.
    pub fn connect(&mut self, descriptor: &DeviceDescriptor) -> Result<(), ConnectionError> {
        self.disconnect();

        let driver = self
            .drivers
            .iter()
            .find(|d| d.kind() == descriptor.kind)
            .cloned()
            .ok_or(ConnectionError::NoDriver(descriptor.kind))?;

        self.transition(ConnectionState::Disconnected, ConnectionState::Connecting);
        info!(device = %descriptor, "Connecting");

        let link = driver.open(descriptor).map_err(|source| {
            self.transition(ConnectionState::Connecting, ConnectionState::Disconnected);
            ConnectionError::Transport {
                kind: descriptor.kind,
                source,
            }
        })?;

        let caps = driver.capabilities();
        let shared = Arc::new(Shared {
            link: Mutex::new(link),
            alive: AtomicBool::new(true),
            upload_active: AtomicBool::new(false),
        });

        let reader = caps.receive.then(|| {
            spawn_reader(
                Arc::clone(&shared),
                Arc::clone(&self.subscribers),
                Arc::clone(&self.observer),
            )
        });

        self.active = Some(ActiveConnection {
            device: descriptor.clone(),
            caps,
            shared,
            reader,
        });

        self.transition(ConnectionState::Connecting, ConnectionState::Connected);
        self.emit(LinkEvent::DeviceConnected {
            device: descriptor.clone(),
        });
        Ok(())
    }

    /// Tear down the active connection. No-op when already disconnected.
    pub fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let was_alive = active.shared.is_alive();
        if was_alive {
            self.transition(ConnectionState::Connected, ConnectionState::Disconnecting);
        }
        active.shared.alive.store(false, Ordering::SeqCst);

        if let Ok(mut link) = active.shared.link.lock()
            && let Err(e) = link.close()
        {
            warn!(error = %e, "Error closing transport link");
        }
        if let Some(reader) = active.reader {
            let _ = reader.join();
        }
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }

        // After a transport loss the reader thread already announced the
        // Disconnected transition; a requested teardown must not repeat it.
        if was_alive {
            self.transition(ConnectionState::Disconnecting, ConnectionState::Disconnected);
            self.emit(LinkEvent::DeviceDisconnected);
        }
        info!(device = %active.device.id, "Disconnected");
    }

    /// Send raw bytes over the active connection (serial console input).
    pub fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.shared.is_alive())
            .ok_or(ConnectionError::NotConnected)?;

        if !active.caps.send {
            return Err(ConnectionError::Unsupported {
                kind: active.device.kind,
                operation: "send",
            });
        }
        // An upload owns the link until its handle drops; console input
        // must never interleave with the firmware chunk stream.
        if active.shared.upload_active.load(Ordering::SeqCst) {
            return Err(ConnectionError::UploadInFlight);
        }

        let kind = active.device.kind;
        let result = {
            let mut link = active
                .shared
                .link
                .lock()
                .map_err(|_| ConnectionError::NotConnected)?;
            link.write(data)
        };

        match result {
            Ok(_) => Ok(()),
            Err(TransportError::Disconnected) => {
                active.shared.alive.store(false, Ordering::SeqCst);
                self.emit(LinkEvent::DeviceDisconnected);
                Err(ConnectionError::Transport {
                    kind,
                    source: TransportError::Disconnected,
                })
            }
            Err(source) => Err(ConnectionError::Transport { kind, source }),
        }
    }

    /// Register an inbound-data handler. Delivery is in arrival order.
    pub fn subscribe(&mut self, handler: DataHandler) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push((id, handler));
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|(sid, _)| *sid != id);
        }
    }

    /// Obtain the exclusive upload token for the active connection.
    pub fn upload_handle(&self) -> Result<UploadHandle, ConnectionError> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.shared.is_alive())
            .ok_or(ConnectionError::NotConnected)?;

        if !active.caps.chunked_upload && !active.caps.opaque_upload {
            return Err(ConnectionError::Unsupported {
                kind: active.device.kind,
                operation: "firmware upload",
            });
        }

        active
            .shared
            .upload_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ConnectionError::UploadInFlight)?;

        let profile = {
            let link = active
                .shared
                .link
                .lock()
                .map_err(|_| ConnectionError::NotConnected)?;
            link.chunk_profile()
        };

        Ok(UploadHandle {
            shared: Arc::clone(&active.shared),
            device: active.device.clone(),
            caps: active.caps,
            profile,
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_reader(
    shared: Arc<Shared>,
    subscribers: Arc<Mutex<Vec<(SubscriberId, DataHandler)>>>,
    observer: Arc<dyn LinkObserver>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            if !shared.is_alive() {
                break;
            }
            // The upload owns the link while transferring; monitor reads
            // must not contend with chunk writes on the same physical link.
            if shared.upload_active.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(10));
                continue;
            }

            let result = {
                let Ok(mut link) = shared.link.lock() else {
                    break;
                };
                link.read(512)
            };

            match result {
                Ok(payload) if !payload.is_empty() => {
                    let chunk = SerialChunk {
                        timestamp: SystemTime::now(),
                        payload,
                    };
                    deliver(&subscribers, &chunk);
                }
                Ok(_) => {}
                Err(TransportError::Timeout { .. }) => {}
                Err(e) => {
                    if shared.is_alive() {
                        warn!(error = %e, "Transport read failed, dropping connection");
                        shared.alive.store(false, Ordering::SeqCst);
                        observer.on_event(&LinkEvent::ConnectionStateChanged {
                            from: ConnectionState::Connected,
                            to: ConnectionState::Disconnected,
                        });
                        observer.on_event(&LinkEvent::DeviceDisconnected);
                    }
                    break;
                }
            }
        }
        debug!("Reader thread exited");
    })
}

/// Deliver one chunk to every subscriber in registration order.
///
/// A panicking handler is isolated; it neither breaks the stream nor
/// blocks delivery to the remaining handlers.
fn deliver(subscribers: &Mutex<Vec<(SubscriberId, DataHandler)>>, chunk: &SerialChunk) {
    let Ok(subscribers) = subscribers.lock() else {
        return;
    };
    for (id, handler) in subscribers.iter() {
        if catch_unwind(AssertUnwindSafe(|| handler(chunk))).is_err() {
            warn!(subscriber = id.0, "Subscriber panicked, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TransportKind;
    use crate::events::NullObserver;
    use crate::transport::MockDriver;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<String>>);

    impl LinkObserver for RecordingObserver {
        fn on_event(&self, event: &LinkEvent) {
            let line = match event {
                LinkEvent::ConnectionStateChanged { from, to } => format!("state:{from}->{to}"),
                LinkEvent::DeviceDisconnected => "device-disconnected".to_string(),
                _ => return,
            };
            self.0.lock().unwrap().push(line);
        }
    }

    fn wired_setup(ids: &[&str]) -> (Arc<MockDriver>, ConnectionManager, Vec<DeviceDescriptor>) {
        let driver = Arc::new(MockDriver::new(TransportKind::Wired));
        let devices: Vec<_> = ids
            .iter()
            .map(|id| {
                let d = DeviceDescriptor::wired(id, id, None, None);
                driver.push_device(d.clone());
                d
            })
            .collect();
        let manager = ConnectionManager::new(vec![driver.clone()], Arc::new(NullObserver));
        (driver, manager, devices)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn reconnect_closes_previous_link_first() {
        let (driver, mut manager, devices) = wired_setup(&["/dev/ttyA", "/dev/ttyB"]);

        manager.connect(&devices[0]).unwrap();
        manager.connect(&devices[1]).unwrap();

        assert_eq!(
            driver.lifecycle(),
            vec![
                "open:serial:/dev/ttyA".to_string(),
                "close:serial:/dev/ttyA".to_string(),
                "open:serial:/dev/ttyB".to_string(),
            ]
        );
        assert_eq!(manager.device().unwrap().id, "serial:/dev/ttyB");
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn send_without_connection_is_not_connected() {
        let (_, mut manager, _) = wired_setup(&[]);
        assert!(matches!(
            manager.send(b"hello"),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn send_on_send_incapable_transport_is_unsupported() {
        let driver = Arc::new(MockDriver::new(TransportKind::Network));
        let device = DeviceDescriptor::network("10.0.0.9", 8266, "ota");
        driver.push_device(device.clone());
        let mut manager = ConnectionManager::new(vec![driver], Arc::new(NullObserver));

        manager.connect(&device).unwrap();
        assert!(matches!(
            manager.send(b"x"),
            Err(ConnectionError::Unsupported { .. })
        ));
    }

    #[test]
    fn fan_out_preserves_order_and_isolates_panics() {
        let (driver, mut manager, devices) = wired_setup(&["/dev/ttyA"]);
        manager.connect(&devices[0]).unwrap();

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        manager.subscribe(Box::new(move |_chunk| panic!("misbehaving consumer")));
        manager.subscribe(Box::new(move |chunk| {
            sink.lock().unwrap().push(chunk.payload.clone());
        }));

        driver.queue_read(b"one");
        driver.queue_read(b"two");
        driver.queue_read(b"three");

        assert!(wait_until(Duration::from_secs(2), || {
            received.lock().unwrap().len() == 3
        }));
        assert_eq!(
            *received.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (driver, mut manager, devices) = wired_setup(&["/dev/ttyA"]);
        manager.connect(&devices[0]).unwrap();

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let id = manager.subscribe(Box::new(move |chunk| {
            sink.lock().unwrap().push(chunk.payload.clone());
        }));

        driver.queue_read(b"before");
        assert!(wait_until(Duration::from_secs(2), || {
            received.lock().unwrap().len() == 1
        }));

        manager.unsubscribe(id);
        driver.queue_read(b"after");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn transport_loss_transitions_to_disconnected() {
        let (driver, mut manager, devices) = wired_setup(&["/dev/ttyA"]);
        manager.connect(&devices[0]).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);

        driver.drop_connection();
        assert!(wait_until(Duration::from_secs(2), || {
            manager.state() == ConnectionState::Disconnected
        }));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (_, mut manager, devices) = wired_setup(&["/dev/ttyA"]);
        manager.connect(&devices[0]).unwrap();
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn failed_connect_leaves_manager_disconnected() {
        let (driver, mut manager, devices) = wired_setup(&["/dev/ttyA"]);
        driver.drop_connection();

        assert!(matches!(
            manager.connect(&devices[0]),
            Err(ConnectionError::Transport { .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn send_while_upload_handle_outstanding_is_rejected() {
        let (driver, mut manager, devices) = wired_setup(&["/dev/ttyA"]);
        manager.connect(&devices[0]).unwrap();

        let handle = manager.upload_handle().unwrap();
        assert!(matches!(
            manager.send(b"USER-INPUT"),
            Err(ConnectionError::UploadInFlight)
        ));
        assert!(driver.writes().is_empty());

        drop(handle);
        manager.send(b"USER-INPUT").unwrap();
        assert_eq!(driver.writes(), vec![b"USER-INPUT".to_vec()]);
    }

    #[test]
    fn requested_disconnect_after_transport_loss_stays_silent() {
        let driver = Arc::new(MockDriver::new(TransportKind::Wired));
        let device = DeviceDescriptor::wired("/dev/ttyA", "Uno", None, None);
        driver.push_device(device.clone());
        let observer = Arc::new(RecordingObserver::default());
        let mut manager = ConnectionManager::new(vec![driver.clone()], observer.clone());
        manager.connect(&device).unwrap();

        driver.drop_connection();
        assert!(wait_until(Duration::from_secs(2), || {
            manager.state() == ConnectionState::Disconnected
        }));

        // The reader thread has already announced the loss; a teardown
        // request afterwards must not replay transitions from states
        // never entered.
        let before = observer.0.lock().unwrap().clone();
        manager.disconnect();
        assert_eq!(*observer.0.lock().unwrap(), before);
        assert_eq!(
            before.last().map(String::as_str),
            Some("device-disconnected")
        );
    }

    #[test]
    fn only_one_upload_handle_at_a_time() {
        let (_, mut manager, devices) = wired_setup(&["/dev/ttyA"]);
        manager.connect(&devices[0]).unwrap();

        let first = manager.upload_handle().unwrap();
        assert!(matches!(
            manager.upload_handle(),
            Err(ConnectionError::UploadInFlight)
        ));
        drop(first);
        assert!(manager.upload_handle().is_ok());
    }
}
