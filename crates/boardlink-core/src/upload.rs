//! Firmware upload state machine.
//!
//! One [`UploadJob`] per push: `Pending → EnteringBootloader (wired
//! only) → Transferring → Verifying → Succeeded | Failed`, with
//! `Cancelled` reachable from any non-terminal state at a chunk
//! boundary. Terminal states are final; retrying means a fresh job
//! starting from byte 0.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::UploadHandle;
use crate::device::{DeviceDescriptor, TransportKind};
use crate::events::{LinkEvent, LinkObserver};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    EnteringBootloader,
    Transferring,
    /// Reserved for transports with a post-transfer check; currently a
    /// pass-through.
    Verifying,
    Succeeded,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Succeeded | UploadState::Failed | UploadState::Cancelled
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Pending => write!(f, "pending"),
            UploadState::EnteringBootloader => write!(f, "entering-bootloader"),
            UploadState::Transferring => write!(f, "transferring"),
            UploadState::Verifying => write!(f, "verifying"),
            UploadState::Succeeded => write!(f, "succeeded"),
            UploadState::Failed => write!(f, "failed"),
            UploadState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    /// The connection went away mid-transfer (explicit disconnect or
    /// transport loss). The job is dead; the device firmware state is
    /// undefined.
    #[error("connection lost during transfer")]
    ConnectionLost,

    #[error("bootloader entry failed: {0}")]
    BootloaderEntry(#[source] TransportError),

    #[error("transfer failed: {0}")]
    Transport(#[from] TransportError),
}

/// Hold durations for the bootloader-entry line toggle.
///
/// These are board-family tolerances, not protocol truth; the defaults
/// suit common hobbyist boards but are configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderTimings {
    /// Hold after asserting the reset trigger. Default 250 ms.
    pub assert_hold: Duration,
    /// Hold after inverting the lines, and for the exit pulse.
    /// Default 50 ms.
    pub settle_hold: Duration,
}

impl Default for BootloaderTimings {
    fn default() -> Self {
        Self {
            assert_hold: Duration::from_millis(250),
            settle_hold: Duration::from_millis(50),
        }
    }
}

/// Cooperative cancellation flag, checked at chunk boundaries.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final report of one firmware push. Terminal and immutable.
#[derive(Debug)]
pub struct UploadJob {
    pub device: DeviceDescriptor,
    pub state: UploadState,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub error: Option<UploadError>,
}

/// Payload splitter: fixed-size chunks with a trailing residual.
#[derive(Debug, Default, Clone)]
pub struct ChunkPlan {
    current: usize,
    total: usize,
    offset: usize,
    chunk_size: usize,
    data_size: usize,
}

impl ChunkPlan {
    pub fn new(data_size: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let total = if data_size == 0 {
            0
        } else {
            data_size.div_ceil(chunk_size)
        };
        Self {
            current: 0,
            total,
            offset: 0,
            chunk_size,
            data_size,
        }
    }

    /// Next chunk of `data`, advancing the plan.
    pub fn next_chunk<'a>(&mut self, data: &'a [u8]) -> Option<&'a [u8]> {
        if self.offset >= self.data_size.min(data.len()) {
            return None;
        }
        let remaining = self.data_size.min(data.len()) - self.offset;
        let chunk_len = remaining.min(self.chunk_size);
        let chunk = &data[self.offset..self.offset + chunk_len];
        self.offset += chunk_len;
        self.current += 1;
        Some(chunk)
    }

    pub fn is_done(&self) -> bool {
        self.current >= self.total
    }

    pub fn total_chunks(&self) -> usize {
        self.total
    }

    pub fn current_chunk(&self) -> usize {
        self.current
    }
}

/// Runs upload jobs over an exclusive connection handle.
pub struct Uploader {
    observer: Arc<dyn LinkObserver>,
    timings: BootloaderTimings,
}

impl Uploader {
    pub fn new(observer: Arc<dyn LinkObserver>, timings: BootloaderTimings) -> Self {
        Self { observer, timings }
    }

    fn transition(&self, job: &mut UploadJob, to: UploadState) {
        info!(from = %job.state, to = %to, "Upload state transition");
        self.observer.on_event(&LinkEvent::UploadStateChanged {
            from: job.state,
            to,
        });
        job.state = to;
    }

    fn fail(&self, mut job: UploadJob, error: UploadError) -> UploadJob {
        warn!(error = %error, "Upload failed");
        self.transition(&mut job, UploadState::Failed);
        job.error = Some(error);
        job
    }

    fn cancelled(&self, mut job: UploadJob) -> UploadJob {
        info!(sent = job.bytes_sent, total = job.total_bytes, "Upload cancelled");
        self.transition(&mut job, UploadState::Cancelled);
        job
    }

    /// Run one firmware push to completion.
    ///
    /// `progress` receives `bytes_sent / total_bytes` after every chunk
    /// boundary. Cancellation is cooperative: checked at chunk
    /// boundaries, never interrupting an in-flight write.
    pub fn run(
        &self,
        handle: UploadHandle,
        payload: &[u8],
        progress: &mut dyn FnMut(f64),
        cancel: &CancelToken,
    ) -> UploadJob {
        let mut job = UploadJob {
            device: handle.device.clone(),
            state: UploadState::Pending,
            bytes_sent: 0,
            total_bytes: payload.len() as u64,
            error: None,
        };

        if cancel.is_cancelled() {
            return self.cancelled(job);
        }
        if !handle.shared.is_alive() {
            return self.fail(job, UploadError::ConnectionLost);
        }

        // Wired targets must be forced into programming mode before any
        // data is sent; line toggle order and hold times are hardware
        // contract.
        if handle.device.kind == TransportKind::Wired && handle.caps.control_lines {
            self.transition(&mut job, UploadState::EnteringBootloader);
            if let Err(e) = self.enter_bootloader(&handle) {
                return self.fail(job, UploadError::BootloaderEntry(e));
            }
            if cancel.is_cancelled() {
                return self.cancelled(job);
            }
        }

        self.transition(&mut job, UploadState::Transferring);

        if handle.caps.opaque_upload {
            // The target's own OTA protocol does the chunking and
            // acknowledgement; we only observe overall progress.
            let result = {
                let Ok(mut link) = handle.shared.link.lock() else {
                    return self.fail(job, UploadError::ConnectionLost);
                };
                let observer = &self.observer;
                let bytes_sent = &mut job.bytes_sent;
                link.push_image(payload, &mut |sent, total| {
                    *bytes_sent = sent;
                    observer.on_event(&LinkEvent::UploadProgress {
                        bytes_sent: sent,
                        total_bytes: total,
                    });
                    progress(if total > 0 { sent as f64 / total as f64 } else { 1.0 });
                })
            };
            if let Err(e) = result {
                return self.fail(job, lost_or(e));
            }
        } else {
            let profile = handle.profile;
            let mut plan = ChunkPlan::new(payload.len(), profile.max_chunk);
            debug!(
                chunks = plan.total_chunks(),
                chunk_size = profile.max_chunk,
                "Starting chunked transfer"
            );

            while !plan.is_done() {
                if cancel.is_cancelled() {
                    return self.cancelled(job);
                }
                if !handle.shared.is_alive() {
                    return self.fail(job, UploadError::ConnectionLost);
                }
                let Some(chunk) = plan.next_chunk(payload) else {
                    break;
                };

                let write_result = {
                    let Ok(mut link) = handle.shared.link.lock() else {
                        return self.fail(job, UploadError::ConnectionLost);
                    };
                    link.write(chunk)
                };
                if let Err(e) = write_result {
                    return self.fail(job, lost_or(e));
                }

                job.bytes_sent += chunk.len() as u64;
                self.observer.on_event(&LinkEvent::UploadProgress {
                    bytes_sent: job.bytes_sent,
                    total_bytes: job.total_bytes,
                });
                progress(job.bytes_sent as f64 / job.total_bytes as f64);
                debug!(
                    chunk = plan.current_chunk(),
                    total = plan.total_chunks(),
                    "Chunk sent"
                );

                // Pacing: let the remote receive buffer drain.
                if !plan.is_done() && !profile.inter_chunk_delay.is_zero() {
                    thread::sleep(profile.inter_chunk_delay);
                }
            }
        }

        // Wired targets need one more reset pulse to leave programming
        // mode and boot the new firmware.
        if handle.device.kind == TransportKind::Wired && handle.caps.control_lines
            && let Err(e) = self.exit_bootloader(&handle)
        {
            return self.fail(job, UploadError::Transport(e));
        }

        self.transition(&mut job, UploadState::Verifying);
        self.transition(&mut job, UploadState::Succeeded);
        info!(bytes = job.bytes_sent, device = %job.device.id, "Upload succeeded");
        job
    }

    fn set_lines(
        &self,
        handle: &UploadHandle,
        reset: bool,
        boot: bool,
    ) -> Result<(), TransportError> {
        let mut link = handle
            .shared
            .link
            .lock()
            .map_err(|_| TransportError::Disconnected)?;
        link.set_control_lines(reset, boot)
    }

    /// Assert reset / deassert boot-select, hold, invert, hold, release.
    fn enter_bootloader(&self, handle: &UploadHandle) -> Result<(), TransportError> {
        self.set_lines(handle, true, false)?;
        thread::sleep(self.timings.assert_hold);
        self.set_lines(handle, false, true)?;
        thread::sleep(self.timings.settle_hold);
        self.set_lines(handle, false, false)
    }

    /// Pulse reset once more after the last chunk.
    fn exit_bootloader(&self, handle: &UploadHandle) -> Result<(), TransportError> {
        self.set_lines(handle, true, false)?;
        thread::sleep(self.timings.settle_hold);
        self.set_lines(handle, false, false)
    }
}

fn lost_or(e: TransportError) -> UploadError {
    match e {
        TransportError::Disconnected => UploadError::ConnectionLost,
        other => UploadError::Transport(other),
    }
}
