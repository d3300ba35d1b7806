//! Scripted in-memory compile service for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::compile::{Board, CompilationJob, CompileError, CompileService, CompileStatus};

/// Test double for [`CompileService`]: responses are scripted up
/// front, calls are counted.
#[derive(Default)]
pub struct MockCompileService {
    statuses: Mutex<VecDeque<Result<CompilationJob, CompileError>>>,
    binaries: Mutex<HashMap<String, Vec<u8>>>,
    boards: Mutex<Vec<Board>>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MockCompileService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `status` call.
    pub fn script_status(&self, result: Result<CompilationJob, CompileError>) {
        self.statuses.lock().unwrap().push_back(result);
    }

    pub fn set_binary(&self, id: &str, bytes: Vec<u8>) {
        self.binaries.lock().unwrap().insert(id.to_string(), bytes);
    }

    pub fn add_board(&self, board: Board) {
        self.boards.lock().unwrap().push(board);
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

impl CompileService for MockCompileService {
    fn submit(
        &self,
        _source: &str,
        _board_id: &str,
        _project_id: Option<&str>,
    ) -> Result<CompilationJob, CompileError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CompilationJob {
            id: format!("job-{n}"),
            status: CompileStatus::Queued,
            binary_url: None,
            diagnostics: Vec::new(),
        })
    }

    fn status(&self, id: &str) -> Result<CompilationJob, CompileError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CompileError::Service(format!("no scripted status for {id}"))))
    }

    fn fetch_binary(&self, id: &str) -> Result<Vec<u8>, CompileError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.binaries
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| CompileError::BinaryUnavailable(id.to_string()))
    }

    fn boards(&self) -> Result<Vec<Board>, CompileError> {
        Ok(self.boards.lock().unwrap().clone())
    }

    fn board_details(&self, id: &str) -> Result<Board, CompileError> {
        self.boards
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| CompileError::Service(format!("unknown board {id}")))
    }
}
