//! Remote compilation service integration.
//!
//! The build farm is an external collaborator: we submit source, poll
//! job status until terminal, and fetch the produced binary. The
//! transport to the service lives behind [`CompileService`] so the
//! poller logic is independent of how the service is reached.

pub mod mock;
pub mod poller;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use poller::{CompilePoller, PollerConfig, Snapshots};

/// Largest accepted sketch source, enforced before submission.
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

/// Remote job status as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileStatus {
    Queued,
    Compiling,
    Completed,
    Failed,
}

impl CompileStatus {
    /// Terminal statuses never change again; polling past one is a bug.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CompileStatus::Completed | CompileStatus::Failed)
    }
}

impl fmt::Display for CompileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileStatus::Queued => write!(f, "queued"),
            CompileStatus::Compiling => write!(f, "compiling"),
            CompileStatus::Completed => write!(f, "completed"),
            CompileStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One compiler message attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(rename = "type")]
    pub severity: Severity,
    pub message: String,
}

/// A board supported by the build farm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    /// Fully qualified board name, e.g. `arduino:avr:uno`.
    pub id: String,
    pub name: String,
    pub platform: String,
}

/// Point-in-time view of a remote compilation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationJob {
    pub id: String,
    pub status: CompileStatus,
    /// Set once the job completes; where the binary can be fetched.
    #[serde(default)]
    pub binary_url: Option<String>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Error, Debug)]
pub enum CompileError {
    /// The submission was refused locally or by the service.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// Consecutive poll attempts all failed. The job may still be
    /// running; polling can resume.
    #[error("compile service unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    /// The job has no binary to fetch (not completed, or expired).
    #[error("no binary available for job {0}")]
    BinaryUnavailable(String),

    /// Any other service-side failure.
    #[error("compile service error: {0}")]
    Service(String),
}

/// Client-side surface of the remote build farm.
pub trait CompileService: Send + Sync {
    /// Submit source for compilation; returns the new job with the
    /// service's immediate status (usually `Queued`).
    fn submit(
        &self,
        source: &str,
        board_id: &str,
        project_id: Option<&str>,
    ) -> Result<CompilationJob, CompileError>;

    /// Current snapshot of a job.
    fn status(&self, id: &str) -> Result<CompilationJob, CompileError>;

    /// Download the compiled binary of a completed job.
    fn fetch_binary(&self, id: &str) -> Result<Vec<u8>, CompileError>;

    /// All boards the service can compile for.
    fn boards(&self) -> Result<Vec<Board>, CompileError>;

    /// Details for one board id.
    fn board_details(&self, id: &str) -> Result<Board, CompileError>;
}
