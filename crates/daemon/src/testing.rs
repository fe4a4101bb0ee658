//! In-process stand-in for the renderer, shared by the unit tests.

use crate::job::{Job, JobId};
use crate::launcher::{Launch, LaunchError, Launched, ProcessHandle};
use maxqueue_config::{Settings, SettingsPatch, SettingsStore};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

#[derive(Default)]
struct FakeState {
    launched: Vec<JobId>,
    kills: Vec<(JobId, oneshot::Receiver<()>)>,
}

/// Records launches instead of spawning anything. Clones share the record.
#[derive(Clone)]
pub(crate) struct FakeLauncher {
    detected: Option<PathBuf>,
    broken_sources: Vec<PathBuf>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            detected: Some(PathBuf::from("/fake/3ds Max 2025/3dsmaxcmd.exe")),
            broken_sources: Vec::new(),
            state: Arc::default(),
        }
    }

    /// Nothing configured and nothing to detect.
    pub fn without_renderer() -> Self {
        Self {
            detected: None,
            ..Self::new()
        }
    }

    /// Spawning fails for this source.
    pub fn failing_for(mut self, source: impl Into<PathBuf>) -> Self {
        self.broken_sources.push(source.into());
        self
    }

    pub fn launched(&self) -> Vec<JobId> {
        self.state.lock().unwrap().launched.clone()
    }

    /// Whether the handle for `id` asked for termination or was dropped.
    pub fn was_terminated(&self, id: JobId) -> bool {
        let mut state = self.state.lock().unwrap();
        state
            .kills
            .iter_mut()
            .filter(|(job, _)| *job == id)
            .any(|(_, rx)| matches!(rx.try_recv(), Ok(()) | Err(TryRecvError::Closed)))
    }
}

impl Launch for FakeLauncher {
    fn launch(&mut self, job: &Job, settings: &mut SettingsStore) -> Result<Launched, LaunchError> {
        let renderer = self
            .resolve_renderer(settings)
            .ok_or(LaunchError::RendererNotFound)?;

        if self.broken_sources.iter().any(|s| s == job.source()) {
            return Err(LaunchError::Spawn {
                program: renderer,
                source: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
            });
        }

        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.launched.push(job.id());
        state.kills.push((job.id(), rx));
        let pid = 1000 + state.launched.len() as u32;

        let stem = job
            .source()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Launched {
            handle: ProcessHandle::new(Some(pid), tx),
            output_path: settings.get().output_folder.join(format!("{}.jpg", stem)),
        })
    }

    fn resolve_renderer(&mut self, settings: &mut SettingsStore) -> Option<PathBuf> {
        if let Some(configured) = settings.get().renderer_path {
            return Some(configured);
        }
        let detected = self.detected.clone()?;
        let patch = SettingsPatch {
            output_folder: None,
            renderer_path: Some(detected.clone()),
        };
        let _ = settings.set(patch);
        Some(detected)
    }
}

pub(crate) fn test_settings() -> SettingsStore {
    SettingsStore::in_memory(Settings {
        output_folder: PathBuf::from("/renders"),
        renderer_path: None,
    })
}
