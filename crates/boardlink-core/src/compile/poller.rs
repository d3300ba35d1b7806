//! Status polling with bounded retries and binary caching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::compile::{
    Board, CompilationJob, CompileError, CompileService, CompileStatus, MAX_SOURCE_BYTES,
};
use crate::events::{LinkEvent, LinkObserver};

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Delay between status polls, and between retry attempts.
    pub interval: Duration,
    /// Consecutive failed polls tolerated before reporting the service
    /// unreachable.
    pub max_retries: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

/// Drives remote compile jobs: submission guard, status polling,
/// one-time binary fetch.
pub struct CompilePoller {
    service: Arc<dyn CompileService>,
    config: PollerConfig,
    observer: Arc<dyn LinkObserver>,
    // Fetched binaries by job id. The service may expire artifacts;
    // once fetched we never ask again.
    binaries: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl CompilePoller {
    pub fn new(
        service: Arc<dyn CompileService>,
        config: PollerConfig,
        observer: Arc<dyn LinkObserver>,
    ) -> Self {
        Self {
            service,
            config,
            observer,
            binaries: Mutex::new(HashMap::new()),
        }
    }

    /// Submit source for compilation after local validation.
    ///
    /// The returned job carries the service's immediate status; poll
    /// [`snapshots`](Self::snapshots) to follow it to a terminal state.
    pub fn submit(
        &self,
        source: &str,
        board_id: &str,
        project_id: Option<&str>,
    ) -> Result<CompilationJob, CompileError> {
        if source.is_empty() {
            return Err(CompileError::Rejected("empty source".to_string()));
        }
        if source.len() > MAX_SOURCE_BYTES {
            return Err(CompileError::Rejected(format!(
                "source is {} bytes, limit is {} bytes",
                source.len(),
                MAX_SOURCE_BYTES
            )));
        }
        if board_id.is_empty() {
            return Err(CompileError::Rejected("no board selected".to_string()));
        }
        let job = self.service.submit(source, board_id, project_id)?;
        info!(
            id = %job.id,
            board = board_id,
            status = %job.status,
            bytes = source.len(),
            "Compile job submitted"
        );
        Ok(job)
    }

    /// Boards the service can compile for.
    pub fn boards(&self) -> Result<Vec<Board>, CompileError> {
        self.service.boards()
    }

    /// Details for one fully qualified board id.
    pub fn board_details(&self, id: &str) -> Result<Board, CompileError> {
        self.service.board_details(id)
    }

    /// Lazy stream of job snapshots.
    ///
    /// Each `next()` performs one poll (retried up to `max_retries` on
    /// failure) and sleeps `interval` between polls. An `Unreachable`
    /// item is not fatal: the iterator resumes where it left off. After
    /// a terminal snapshot the iterator is exhausted for good.
    pub fn snapshots(&self, id: &str) -> Snapshots<'_> {
        Snapshots {
            poller: self,
            id: id.to_string(),
            last_status: None,
            first: true,
            done: false,
        }
    }

    /// Block until the job reaches a terminal status.
    ///
    /// Returns `Unreachable` if the service stops answering; calling
    /// again resumes polling.
    pub fn poll_until_terminal(&self, id: &str) -> Result<CompilationJob, CompileError> {
        for snapshot in self.snapshots(id) {
            let job = snapshot?;
            if job.status.is_terminal() {
                return Ok(job);
            }
        }
        // Unreachable in practice: the iterator only ends after
        // yielding a terminal snapshot.
        Err(CompileError::Service(format!("job {id} never finished")))
    }

    /// Binary for a completed job, fetched from the service at most
    /// once per job id.
    pub fn binary(&self, job: &CompilationJob) -> Result<Arc<Vec<u8>>, CompileError> {
        if job.status != CompileStatus::Completed {
            return Err(CompileError::BinaryUnavailable(job.id.clone()));
        }
        if let Some(cached) = self.binaries.lock().unwrap().get(&job.id) {
            debug!(id = %job.id, "Binary served from cache");
            return Ok(cached.clone());
        }
        let bytes = Arc::new(self.service.fetch_binary(&job.id)?);
        info!(id = %job.id, bytes = bytes.len(), "Binary fetched");
        self.binaries
            .lock()
            .unwrap()
            .insert(job.id.clone(), bytes.clone());
        Ok(bytes)
    }

    fn poll_once(
        &self,
        id: &str,
        last_status: &mut Option<CompileStatus>,
    ) -> Result<CompilationJob, CompileError> {
        let mut last_error = String::new();
        for attempt in 1..=self.config.max_retries {
            match self.service.status(id) {
                Ok(job) => {
                    if *last_status != Some(job.status) {
                        self.observer.on_event(&LinkEvent::CompileStatusChanged {
                            id: job.id.clone(),
                            status: job.status,
                        });
                        *last_status = Some(job.status);
                    }
                    return Ok(job);
                }
                Err(e) => {
                    warn!(id = %id, attempt, error = %e, "Status poll failed");
                    last_error = e.to_string();
                    if attempt < self.config.max_retries {
                        thread::sleep(self.config.interval);
                    }
                }
            }
        }
        Err(CompileError::Unreachable {
            attempts: self.config.max_retries,
            last_error,
        })
    }
}

/// Iterator over job snapshots; see [`CompilePoller::snapshots`].
pub struct Snapshots<'a> {
    poller: &'a CompilePoller,
    id: String,
    last_status: Option<CompileStatus>,
    first: bool,
    done: bool,
}

impl Iterator for Snapshots<'_> {
    type Item = Result<CompilationJob, CompileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.first {
            self.first = false;
        } else {
            thread::sleep(self.poller.config.interval);
        }
        let item = self.poller.poll_once(&self.id, &mut self.last_status);
        if let Ok(job) = &item
            && job.status.is_terminal()
        {
            self.done = true;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::mock::MockCompileService;
    use crate::compile::{Diagnostic, Severity};
    use crate::events::NullObserver;

    fn fast_poller(service: Arc<MockCompileService>) -> CompilePoller {
        CompilePoller::new(
            service,
            PollerConfig {
                interval: Duration::ZERO,
                max_retries: 3,
            },
            Arc::new(NullObserver),
        )
    }

    fn snapshot(id: &str, status: CompileStatus) -> CompilationJob {
        CompilationJob {
            id: id.to_string(),
            status,
            binary_url: None,
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn blink_compile_reaches_completed() {
        let service = Arc::new(MockCompileService::new());
        service.script_status(Ok(snapshot("job-1", CompileStatus::Queued)));
        service.script_status(Ok(snapshot("job-1", CompileStatus::Compiling)));
        service.script_status(Ok(CompilationJob {
            binary_url: Some("/v1/compile/job-1/binary".to_string()),
            ..snapshot("job-1", CompileStatus::Completed)
        }));
        service.set_binary("job-1", b":100000000C945C000C946E000C946E00AF".to_vec());
        let poller = fast_poller(service.clone());

        let source = "void setup() { pinMode(13, OUTPUT); }\n\
                      void loop() { digitalWrite(13, HIGH); delay(500); }";
        let submitted = poller.submit(source, "arduino:avr:uno", None).unwrap();
        assert_eq!(submitted.id, "job-1");
        assert_eq!(submitted.status, CompileStatus::Queued);

        let job = poller.poll_until_terminal(&submitted.id).unwrap();
        assert_eq!(job.status, CompileStatus::Completed);
        assert!(job.binary_url.is_some());

        let bin = poller.binary(&job).unwrap();
        assert!(!bin.is_empty());
        assert_eq!(service.status_calls(), 3);
    }

    #[test]
    fn no_poll_after_terminal() {
        let service = Arc::new(MockCompileService::new());
        service.script_status(Ok(snapshot("j", CompileStatus::Failed)));
        let poller = fast_poller(service.clone());

        let mut snapshots = poller.snapshots("j");
        let first = snapshots.next().unwrap().unwrap();
        assert_eq!(first.status, CompileStatus::Failed);
        assert!(snapshots.next().is_none());
        assert!(snapshots.next().is_none());
        assert_eq!(service.status_calls(), 1);
    }

    #[test]
    fn retries_then_succeeds_within_one_poll() {
        let service = Arc::new(MockCompileService::new());
        service.script_status(Err(CompileError::Service("connection refused".to_string())));
        service.script_status(Err(CompileError::Service("connection refused".to_string())));
        service.script_status(Ok(snapshot("j", CompileStatus::Completed)));
        let poller = fast_poller(service.clone());

        let job = poller.poll_until_terminal("j").unwrap();
        assert_eq!(job.status, CompileStatus::Completed);
        assert_eq!(service.status_calls(), 3);
    }

    #[test]
    fn unreachable_is_resumable() {
        let service = Arc::new(MockCompileService::new());
        for _ in 0..3 {
            service.script_status(Err(CompileError::Service("timed out".to_string())));
        }
        service.script_status(Ok(snapshot("j", CompileStatus::Compiling)));
        service.script_status(Ok(snapshot("j", CompileStatus::Completed)));
        let poller = fast_poller(service.clone());

        let mut snapshots = poller.snapshots("j");
        let first = snapshots.next().unwrap();
        assert!(matches!(
            first,
            Err(CompileError::Unreachable { attempts: 3, .. })
        ));

        // Same iterator keeps going once the service answers again.
        let second = snapshots.next().unwrap().unwrap();
        assert_eq!(second.status, CompileStatus::Compiling);
        let third = snapshots.next().unwrap().unwrap();
        assert_eq!(third.status, CompileStatus::Completed);
        assert!(snapshots.next().is_none());
    }

    #[test]
    fn binary_is_fetched_once_per_job() {
        let service = Arc::new(MockCompileService::new());
        service.set_binary("j", vec![1, 2, 3]);
        let poller = fast_poller(service.clone());

        let job = snapshot("j", CompileStatus::Completed);
        let a = poller.binary(&job).unwrap();
        let b = poller.binary(&job).unwrap();
        assert_eq!(*a, vec![1, 2, 3]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(service.fetch_calls(), 1);
    }

    #[test]
    fn binary_of_unfinished_job_is_unavailable() {
        let service = Arc::new(MockCompileService::new());
        let poller = fast_poller(service.clone());

        let err = poller
            .binary(&snapshot("j", CompileStatus::Compiling))
            .unwrap_err();
        assert!(matches!(err, CompileError::BinaryUnavailable(_)));
        assert_eq!(service.fetch_calls(), 0);
    }

    #[test]
    fn failed_job_carries_compiler_diagnostics() {
        let service = Arc::new(MockCompileService::new());
        service.script_status(Ok(CompilationJob {
            diagnostics: vec![
                Diagnostic {
                    severity: Severity::Error,
                    message: "'pinMod' was not declared in this scope".to_string(),
                },
                Diagnostic {
                    severity: Severity::Info,
                    message: "compilation terminated".to_string(),
                },
            ],
            ..snapshot("j", CompileStatus::Failed)
        }));
        let poller = fast_poller(service);

        let job = poller.poll_until_terminal("j").unwrap();
        assert_eq!(job.status, CompileStatus::Failed);
        assert_eq!(job.diagnostics.len(), 2);
        assert!(matches!(job.diagnostics[0].severity, Severity::Error));
        assert!(job.diagnostics[0].message.contains("pinMod"));
    }

    #[test]
    fn board_catalogue_lists_known_boards() {
        let service = Arc::new(MockCompileService::new());
        service.add_board(Board {
            id: "arduino:avr:uno".to_string(),
            name: "Arduino Uno".to_string(),
            platform: "arduino:avr".to_string(),
        });
        service.add_board(Board {
            id: "esp8266:esp8266:nodemcuv2".to_string(),
            name: "NodeMCU 1.0".to_string(),
            platform: "esp8266:esp8266".to_string(),
        });
        let poller = fast_poller(service);

        let boards = poller.boards().unwrap();
        assert_eq!(boards.len(), 2);

        let uno = poller.board_details("arduino:avr:uno").unwrap();
        assert_eq!(uno.name, "Arduino Uno");
        assert!(matches!(
            poller.board_details("acme:unknown:board"),
            Err(CompileError::Service(_))
        ));
    }

    #[test]
    fn oversized_source_is_rejected_locally() {
        let service = Arc::new(MockCompileService::new());
        let poller = fast_poller(service.clone());

        let big = "x".repeat(MAX_SOURCE_BYTES + 1);
        let err = poller.submit(&big, "arduino:avr:uno", None).unwrap_err();
        assert!(matches!(err, CompileError::Rejected(_)));
        assert_eq!(service.submit_calls(), 0);

        let err = poller.submit("", "arduino:avr:uno", None).unwrap_err();
        assert!(matches!(err, CompileError::Rejected(_)));
    }
}
