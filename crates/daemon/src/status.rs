//! Status projection for the render queue
//!
//! Read-only views of the queue for the UI collaborators: a per-job view,
//! the whole-queue snapshot with counters, and the output events that make
//! up the console.

use crate::job::{Job, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of output events the snapshot's console keeps.
pub const CONSOLE_CAPACITY: usize = 200;

/// One line for the console: renderer output or a synthesised status line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputEvent {
    pub job_id: Option<JobId>,
    pub text: String,
    pub is_error: bool,
    pub timestamp_unix_ms: i64,
}

impl OutputEvent {
    pub fn info(job_id: Option<JobId>, text: impl Into<String>) -> Self {
        Self::new(job_id, text, false)
    }

    pub fn error(job_id: Option<JobId>, text: impl Into<String>) -> Self {
        Self::new(job_id, text, true)
    }

    pub fn new(job_id: Option<JobId>, text: impl Into<String>, is_error: bool) -> Self {
        Self {
            job_id,
            text: text.into(),
            is_error,
            timestamp_unix_ms: timestamp_unix_ms(),
        }
    }
}

/// Per-job view shown in the queue list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobView {
    pub id: JobId,
    pub source: String,
    pub name: String,
    pub output_name: Option<String>,
    pub project: Option<String>,
    pub status: JobStatus,
    pub message: Option<String>,
    pub output_path: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id(),
            source: job.source().display().to_string(),
            name: job.name(),
            output_name: job.output_name.clone(),
            project: job.project.clone(),
            status: job.status,
            message: job.message.clone(),
            output_path: job.output_path.as_ref().map(|p| p.display().to_string()),
        }
    }
}

/// Complete queue snapshot including jobs, counters and recent console output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    pub timestamp_unix_ms: i64,
    pub running: bool,
    pub active: Option<JobId>,
    pub jobs: Vec<JobView>,
    pub pending_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub canceled_jobs: usize,
    pub console: Vec<OutputEvent>,
}

impl QueueSnapshot {
    pub fn build(jobs: &[Job], running: bool, console: &ConsoleRing) -> Self {
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();

        Self {
            timestamp_unix_ms: timestamp_unix_ms(),
            running,
            active: jobs
                .iter()
                .find(|j| j.status == JobStatus::Active)
                .map(Job::id),
            jobs: jobs.iter().map(JobView::from).collect(),
            pending_jobs: count(JobStatus::Pending),
            completed_jobs: count(JobStatus::Completed),
            failed_jobs: count(JobStatus::Failed),
            canceled_jobs: count(JobStatus::Canceled),
            console: console.to_vec(),
        }
    }
}

/// Bounded console history; the oldest event is dropped first.
#[derive(Debug, Clone)]
pub struct ConsoleRing {
    events: VecDeque<OutputEvent>,
    capacity: usize,
}

impl Default for ConsoleRing {
    fn default() -> Self {
        Self::with_capacity(CONSOLE_CAPACITY)
    }
}

impl ConsoleRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: OutputEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn to_vec(&self) -> Vec<OutputEvent> {
        self.events.iter().cloned().collect()
    }
}

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn timestamp_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
