//! Render job model.
//!
//! A job is one queued render request tied to a single source scene. Jobs
//! live only in memory; nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Opaque job identifier, assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue.
    #[default]
    Pending,
    /// The renderer is running for this job.
    Active,
    /// Rendered successfully.
    Completed,
    /// The render failed or could not be started.
    Failed,
    /// Stopped by the user.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// What the UI asks for when adding a file to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub source: PathBuf,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

impl JobRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output_name: None,
            project: None,
        }
    }
}

/// One unit of render work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    id: JobId,
    source: PathBuf,
    pub output_name: Option<String>,
    pub project: Option<String>,
    pub status: JobStatus,
    /// Last failure or status message for display.
    pub message: Option<String>,
    /// Where the renderer was told to write, once the job has started.
    pub output_path: Option<PathBuf>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: JobId::new(),
            source: request.source,
            output_name: request.output_name.filter(|n| !n.trim().is_empty()),
            project: request.project.filter(|p| !p.trim().is_empty()),
            status: JobStatus::Pending,
            message: None,
            output_path: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// File name of the source, for display.
    pub fn name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.to_string_lossy().into_owned())
    }
}
