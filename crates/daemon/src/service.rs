//! Render service: the single control loop that owns the queue.
//!
//! Boundary operations arrive as [`Command`]s through a cloneable
//! [`ServiceHandle`]; launcher events arrive on their own channel. The loop
//! applies both to the [`Sequencer`] one at a time and publishes a fresh
//! [`QueueSnapshot`] and the resulting [`OutputEvent`]s after every step.

use crate::job::{JobId, JobRequest};
use crate::launcher::{Launch, LauncherEvent, RenderLauncher};
use crate::picker::is_scene_file;
use crate::resolver::RendererResolver;
use crate::sequencer::{QueueError, Sequencer};
use crate::status::{OutputEvent, QueueSnapshot};
use crate::status_server::ServerError;
use maxqueue_config::{Config, ConfigError, Settings, SettingsPatch, SettingsStore, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered boundary commands.
pub const COMMAND_CAPACITY: usize = 100;

/// Buffered launcher events (output lines and exits).
pub const LAUNCHER_EVENT_CAPACITY: usize = 256;

/// Output events kept for slow subscribers before they start lagging.
pub const OUTPUT_BROADCAST_CAPACITY: usize = 1024;

/// How long shutdown waits for a killed renderer to exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Service configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Settings could not be read or written
    #[error("Settings error: {0}")]
    Storage(#[from] StorageError),

    /// Queue operation rejected
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// Control API server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// The control loop has stopped
    #[error("Render service is not running")]
    Closed,
}

/// Why a file was not added to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotASceneFile,
    AlreadyQueued,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotASceneFile => write!(f, "Skipping non-3ds Max file"),
            SkipReason::AlreadyQueued => write!(f, "File already in queue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Result of adding a batch of files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReport {
    pub added: Vec<JobId>,
    pub skipped: Vec<SkippedFile>,
}

type Reply<T> = oneshot::Sender<T>;

/// A boundary operation for the control loop.
#[derive(Debug)]
pub enum Command {
    Enqueue {
        requests: Vec<JobRequest>,
        reply: Reply<EnqueueReport>,
    },
    RenderAll {
        project: Option<String>,
        reply: Reply<Result<(), QueueError>>,
    },
    Start {
        reply: Reply<Result<(), QueueError>>,
    },
    Cancel {
        id: JobId,
        reply: Reply<bool>,
    },
    Remove {
        id: JobId,
        reply: Reply<Result<(), QueueError>>,
    },
    Reorder {
        ids: Vec<JobId>,
        reply: Reply<Result<(), QueueError>>,
    },
    Clear {
        reply: Reply<Result<(), QueueError>>,
    },
    ListActive {
        reply: Reply<Vec<JobId>>,
    },
    GetSettings {
        reply: Reply<Settings>,
    },
    SaveSettings {
        patch: SettingsPatch,
        reply: Reply<Result<Settings, StorageError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable client of the control loop.
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<QueueSnapshot>,
    output: broadcast::Sender<OutputEvent>,
}

impl ServiceHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    /// Add files; non-scene files and files already queued are skipped.
    pub async fn enqueue(&self, requests: Vec<JobRequest>) -> Result<EnqueueReport, ServiceError> {
        self.request(|reply| Command::Enqueue { requests, reply }).await
    }

    pub async fn render_all(&self, project: Option<String>) -> Result<(), ServiceError> {
        self.request(|reply| Command::RenderAll { project, reply })
            .await??;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Start { reply }).await??;
        Ok(())
    }

    /// Returns whether the job was active and got canceled.
    pub async fn cancel(&self, id: JobId) -> Result<bool, ServiceError> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn remove(&self, id: JobId) -> Result<(), ServiceError> {
        self.request(|reply| Command::Remove { id, reply }).await??;
        Ok(())
    }

    pub async fn reorder(&self, ids: Vec<JobId>) -> Result<(), ServiceError> {
        self.request(|reply| Command::Reorder { ids, reply }).await??;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Clear { reply }).await??;
        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<JobId>, ServiceError> {
        self.request(|reply| Command::ListActive { reply }).await
    }

    /// Current settings; runs renderer detection if no path is configured.
    pub async fn get_settings(&self) -> Result<Settings, ServiceError> {
        self.request(|reply| Command::GetSettings { reply }).await
    }

    pub async fn save_settings(&self, patch: SettingsPatch) -> Result<Settings, ServiceError> {
        let saved = self
            .request(|reply| Command::SaveSettings { patch, reply })
            .await??;
        Ok(saved)
    }

    /// Stop the loop, killing any live render and waiting for it to exit.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.clone()
    }

    /// Output events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.output.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Channel the launcher reports on.
pub fn launcher_channel() -> (mpsc::Sender<LauncherEvent>, mpsc::Receiver<LauncherEvent>) {
    mpsc::channel(LAUNCHER_EVENT_CAPACITY)
}

/// The control loop.
pub struct RenderService<L> {
    sequencer: Sequencer<L>,
    commands: mpsc::Receiver<Command>,
    launcher_events: mpsc::Receiver<LauncherEvent>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
    output_tx: broadcast::Sender<OutputEvent>,
}

impl<L: Launch + Send + 'static> RenderService<L> {
    /// Wire a sequencer to its command and launcher channels.
    pub fn new(
        sequencer: Sequencer<L>,
        launcher_events: mpsc::Receiver<LauncherEvent>,
    ) -> (Self, ServiceHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(sequencer.snapshot());
        let (output_tx, _) = broadcast::channel(OUTPUT_BROADCAST_CAPACITY);

        let handle = ServiceHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            output: output_tx.clone(),
        };
        let service = Self {
            sequencer,
            commands,
            launcher_events,
            snapshot_tx,
            output_tx,
        };
        (service, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shut down or until every handle is dropped.
    pub async fn run(mut self) {
        info!("render service started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all service handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.launcher_events.recv() => {
                    self.sequencer.handle_event(event);
                    self.publish();
                }
            }
        }
        info!("render service stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { requests, reply } => {
                let report = self.enqueue(requests);
                self.publish();
                let _ = reply.send(report);
            }
            Command::RenderAll { project, reply } => {
                let result = self.sequencer.render_all(project.as_deref());
                self.publish();
                let _ = reply.send(result);
            }
            Command::Start { reply } => {
                let result = self.sequencer.start();
                self.publish();
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let canceled = self.sequencer.cancel(id);
                self.publish();
                let _ = reply.send(canceled);
            }
            Command::Remove { id, reply } => {
                let result = self.sequencer.remove(id).map(|_| ());
                self.publish();
                let _ = reply.send(result);
            }
            Command::Reorder { ids, reply } => {
                let result = self.sequencer.reorder(&ids);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Clear { reply } => {
                let result = self.sequencer.clear();
                self.publish();
                let _ = reply.send(result);
            }
            Command::ListActive { reply } => {
                let _ = reply.send(self.sequencer.active_id().into_iter().collect());
            }
            Command::GetSettings { reply } => {
                let settings = self.sequencer.settings();
                let _ = reply.send(settings);
            }
            Command::SaveSettings { patch, reply } => {
                let result = self.sequencer.save_settings(patch);
                if let Err(e) = &result {
                    warn!(error = %e, "settings kept in memory only");
                }
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                // Handled by the loop itself
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, requests: Vec<JobRequest>) -> EnqueueReport {
        let mut report = EnqueueReport::default();

        for request in requests {
            let reason = if !is_scene_file(&request.source) {
                Some(SkipReason::NotASceneFile)
            } else if self.sequencer.contains_live_source(&request.source) {
                Some(SkipReason::AlreadyQueued)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    debug!(path = %request.source.display(), %reason, "file skipped");
                    self.sequencer.note(
                        format!("{}: {}", reason, request.source.display()),
                        reason == SkipReason::NotASceneFile,
                    );
                    report.skipped.push(SkippedFile {
                        path: request.source,
                        reason,
                    });
                }
                None => report.added.push(self.sequencer.enqueue(request)),
            }
        }

        if !report.added.is_empty() {
            self.sequencer
                .note(format!("Added {} file(s) to queue", report.added.len()), false);
        }
        report
    }

    async fn shutdown(&mut self) {
        let Some(handle) = self.sequencer.shutdown() else {
            self.publish();
            return;
        };
        self.publish();

        // Keep draining launcher events so the output readers can finish
        let wait = handle.wait();
        tokio::pin!(wait);
        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                _ = &mut deadline => {
                    warn!("renderer did not exit within {:?}", SHUTDOWN_GRACE);
                    break;
                }
                Some(event) = self.launcher_events.recv() => {
                    self.sequencer.handle_event(event);
                }
            }
        }
        self.publish();
    }

    fn publish(&mut self) {
        for event in self.sequencer.drain_events() {
            // No subscribers is fine
            let _ = self.output_tx.send(event);
        }
        self.snapshot_tx.send_replace(self.sequencer.snapshot());
    }
}

/// Start the control loop with the real renderer launcher.
pub fn start_render_service(config: &Config, settings: SettingsStore) -> (ServiceHandle, JoinHandle<()>) {
    let (events_tx, events_rx) = launcher_channel();
    let resolver = RendererResolver::from_env(&config.renderer.search_dirs);
    let launcher = RenderLauncher::new(config.renderer.clone(), resolver, events_tx);
    let (service, handle) = RenderService::new(Sequencer::new(launcher, settings), events_rx);
    (handle, service.spawn())
}
