//! Job queue sequencer.
//!
//! Owns the ordered job list and runs it one job at a time: it dispatches
//! the next pending job to the launcher, turns renderer output into job
//! outcomes and moves on when a job finishes. Every state transition happens
//! through `&mut self`, so callers serialise access by owning it.

use crate::classify::{classify, Classification, OutputChannel};
use crate::job::{Job, JobId, JobRequest, JobStatus};
use crate::launcher::{Launch, LauncherEvent, ProcessHandle};
use crate::status::{ConsoleRing, OutputEvent, QueueSnapshot};
use maxqueue_config::{Settings, SettingsPatch, SettingsStore, StorageError};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for queue operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Mutation attempted while a job is rendering
    #[error("Queue is locked while a render is in progress")]
    QueueLocked,

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// Reorder list is not a permutation of the queued jobs
    #[error("New order must list every queued job exactly once")]
    InvalidOrder,

    #[error("No pending jobs to render")]
    NothingPending,

    #[error("Render queue is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// `cursor` is the queue index of the active job.
    Running { cursor: usize },
}

struct ActiveJob {
    id: JobId,
    handle: ProcessHandle,
}

/// Single-active-job dispatcher over an in-memory queue.
pub struct Sequencer<L> {
    jobs: Vec<Job>,
    state: State,
    active: Option<ActiveJob>,
    launcher: L,
    settings: SettingsStore,
    console: ConsoleRing,
    outbox: Vec<OutputEvent>,
}

impl<L: Launch> Sequencer<L> {
    pub fn new(launcher: L, settings: SettingsStore) -> Self {
        Self {
            jobs: Vec::new(),
            state: State::Idle,
            active: None,
            launcher,
            settings,
            console: ConsoleRing::default(),
            outbox: Vec::new(),
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id() == id)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    pub fn active_id(&self) -> Option<JobId> {
        self.active.as_ref().map(|a| a.id)
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Current settings, running renderer detection first.
    pub fn settings(&mut self) -> Settings {
        self.launcher.resolve_renderer(&mut self.settings);
        self.settings.get()
    }

    /// Merge and persist a settings change. Takes effect from the next job.
    pub fn save_settings(&mut self, patch: SettingsPatch) -> Result<Settings, StorageError> {
        self.settings.set(patch)
    }

    /// Append a job. Allowed in any state; a running queue picks it up.
    pub fn enqueue(&mut self, request: JobRequest) -> JobId {
        let job = Job::new(request);
        let id = job.id();
        debug!(job_id = %id, source = %job.source().display(), "job enqueued");
        self.jobs.push(job);
        id
    }

    /// True when a pending or active job already renders `source`.
    pub fn contains_live_source(&self, source: &Path) -> bool {
        self.jobs
            .iter()
            .any(|j| !j.status.is_terminal() && j.source() == source)
    }

    pub fn remove(&mut self, id: JobId) -> Result<Job, QueueError> {
        self.ensure_idle()?;
        let index = self.index_of(id).ok_or(QueueError::JobNotFound(id))?;
        Ok(self.jobs.remove(index))
    }

    /// Replace the queue order. `ids` must be a permutation of the queue.
    pub fn reorder(&mut self, ids: &[JobId]) -> Result<(), QueueError> {
        self.ensure_idle()?;

        let unique: HashSet<JobId> = ids.iter().copied().collect();
        if ids.len() != self.jobs.len()
            || unique.len() != ids.len()
            || !self.jobs.iter().all(|j| unique.contains(&j.id()))
        {
            return Err(QueueError::InvalidOrder);
        }

        let mut remaining = std::mem::take(&mut self.jobs);
        for id in ids {
            if let Some(pos) = remaining.iter().position(|j| j.id() == *id) {
                self.jobs.push(remaining.swap_remove(pos));
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), QueueError> {
        self.ensure_idle()?;
        self.jobs.clear();
        Ok(())
    }

    /// Start dispatching pending jobs in queue order.
    pub fn start(&mut self) -> Result<(), QueueError> {
        if self.is_running() {
            return Err(QueueError::AlreadyRunning);
        }
        if !self.jobs.iter().any(|j| j.status == JobStatus::Pending) {
            return Err(QueueError::NothingPending);
        }

        info!(pending = self.pending_count(), "starting render queue");
        self.emit(OutputEvent::info(None, "Starting render queue..."));
        self.advance();
        Ok(())
    }

    /// Give `project` to pending jobs that have none, then start.
    ///
    /// Does nothing more if the queue is already running; the running queue
    /// dispatches the pending jobs anyway.
    pub fn render_all(&mut self, project: Option<&str>) -> Result<(), QueueError> {
        if let Some(project) = project.map(str::trim).filter(|p| !p.is_empty()) {
            for job in self
                .jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Pending && j.project.is_none())
            {
                job.project = Some(project.to_string());
            }
        }

        match self.start() {
            Err(QueueError::AlreadyRunning) => Ok(()),
            other => other,
        }
    }

    /// Feed a launcher event in. Events for jobs that are no longer active
    /// are dropped.
    pub fn handle_event(&mut self, event: LauncherEvent) {
        match event {
            LauncherEvent::Output {
                job_id,
                channel,
                text,
            } => self.on_output(job_id, channel, &text),
            LauncherEvent::Exited { job_id, code } => self.on_exit(job_id, code),
        }
    }

    pub fn on_output(&mut self, job_id: JobId, channel: OutputChannel, text: &str) {
        if self.active_id() != Some(job_id) {
            debug!(%job_id, "ignoring output from inactive job");
            return;
        }

        self.emit(OutputEvent::new(Some(job_id), text, channel.is_error()));

        match classify(text, channel) {
            Classification::Progress(_) => {}
            Classification::Success => {
                self.emit(OutputEvent::info(Some(job_id), "Rendering completed successfully"));
                self.finish_active(JobStatus::Completed, None);
                self.advance();
            }
            Classification::Failure(reason) => {
                self.emit(OutputEvent::error(
                    Some(job_id),
                    format!("Render failed: {}", reason),
                ));
                self.finish_active(JobStatus::Failed, Some(reason));
                self.advance();
            }
        }
    }

    pub fn on_exit(&mut self, job_id: JobId, code: Option<i32>) {
        if self.active_id() != Some(job_id) {
            debug!(%job_id, ?code, "ignoring exit of inactive job");
            return;
        }

        let exit_line = match code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated by a signal".to_string(),
        };

        if code == Some(0) {
            self.emit(OutputEvent::info(Some(job_id), exit_line));
            self.emit(OutputEvent::info(Some(job_id), "Rendering completed successfully"));
            self.finish_active(JobStatus::Completed, None);
        } else {
            self.emit(OutputEvent::error(Some(job_id), exit_line.clone()));
            self.finish_active(JobStatus::Failed, Some(exit_line));
        }
        self.advance();
    }

    /// Cancel `id` if it is the active job. Returns whether anything was
    /// canceled; calling it again, or for a job that is not active, is a no-op.
    pub fn cancel(&mut self, id: JobId) -> bool {
        if self.active_id() != Some(id) {
            return false;
        }

        info!(job_id = %id, "canceling render");
        self.emit(OutputEvent::info(Some(id), "Render canceled"));
        self.finish_active(JobStatus::Canceled, Some("Canceled by user".to_string()));
        self.advance();
        true
    }

    /// Stop everything. Kills the live process, marks its job canceled and
    /// hands back the process handle so the caller can wait for the exit.
    pub fn shutdown(&mut self) -> Option<ProcessHandle> {
        self.state = State::Idle;
        let ActiveJob { id, mut handle } = self.active.take()?;

        warn!(job_id = %id, "shutting down with a render in progress");
        handle.cancel();
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id() == id) {
            job.status = JobStatus::Canceled;
            job.message = Some("Canceled at shutdown".to_string());
        }
        self.emit(OutputEvent::info(Some(id), "Render canceled"));
        Some(handle)
    }

    /// Say something on the console that is not tied to a job.
    pub fn note(&mut self, text: impl Into<String>, is_error: bool) {
        self.emit(OutputEvent::new(None, text, is_error));
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::build(&self.jobs, self.is_running(), &self.console)
    }

    /// Output events produced since the last call, oldest first.
    pub fn drain_events(&mut self) -> Vec<OutputEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Dispatch pending jobs until one is running or none are left.
    fn advance(&mut self) {
        loop {
            let Some(index) = self
                .jobs
                .iter()
                .position(|j| j.status == JobStatus::Pending)
            else {
                self.state = State::Idle;
                info!("render queue drained");
                self.emit(OutputEvent::info(None, "All renders completed!"));
                return;
            };

            self.state = State::Running { cursor: index };
            let total = self.jobs.len();
            let job = &mut self.jobs[index];
            job.status = JobStatus::Active;
            job.message = None;
            let id = job.id();
            let line = format!("Rendering [{}/{}]: {}", index + 1, total, job.name());
            self.emit(OutputEvent::info(Some(id), line));

            match self.launcher.launch(&self.jobs[index], &mut self.settings) {
                Ok(launched) => {
                    self.jobs[index].output_path = Some(launched.output_path);
                    self.active = Some(ActiveJob {
                        id,
                        handle: launched.handle,
                    });
                    return;
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "render could not be started");
                    let reason = e.to_string();
                    self.emit(OutputEvent::error(
                        Some(id),
                        format!("Render failed: {}", reason),
                    ));
                    let job = &mut self.jobs[index];
                    job.status = JobStatus::Failed;
                    job.message = Some(reason);
                }
            }
        }
    }

    /// Record a terminal outcome for the active job and release its process.
    fn finish_active(&mut self, status: JobStatus, message: Option<String>) {
        let Some(ActiveJob { id, mut handle }) = self.active.take() else {
            return;
        };
        // The process may still be running when the outcome came from its text
        handle.cancel();

        if let State::Running { cursor } = self.state {
            debug_assert_eq!(self.jobs.get(cursor).map(Job::id), Some(id));
        }
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id() == id) {
            info!(job_id = %id, %status, "render finished");
            job.status = status;
            job.message = message;
        }
    }

    fn emit(&mut self, event: OutputEvent) {
        self.console.push(event.clone());
        self.outbox.push(event);
    }

    fn ensure_idle(&self) -> Result<(), QueueError> {
        if self.is_running() {
            Err(QueueError::QueueLocked)
        } else {
            Ok(())
        }
    }

    fn index_of(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id() == id)
    }

    fn pending_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }
}
