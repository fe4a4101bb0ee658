//! 3ds Max render queue
//!
//! Background service that runs queued 3ds Max scenes through `3dsmaxcmd`
//! one at a time, with an HTTP control API for front ends.

pub mod classify;
pub mod job;
pub mod launcher;
pub mod picker;
pub mod preflight;
pub mod resolver;
pub mod sanitize;
pub mod sequencer;
pub mod service;
pub mod status;
pub mod status_server;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use maxqueue_config as config;
pub use maxqueue_config::{Config, Settings, SettingsPatch, SettingsStore};
pub use classify::{classify, Classification, OutputChannel};
pub use job::{Job, JobId, JobRequest, JobStatus};
pub use launcher::{
    build_render_spec, Launch, LaunchError, Launched, LauncherEvent, ProcessHandle, ProcessSpec,
    RenderLauncher,
};
pub use picker::{is_scene_file, open_folder, pick_output_folder, pick_source_files, PickError};
pub use preflight::{run_preflight, PreflightWarning};
pub use resolver::{RendererResolver, Resolution};
pub use sequencer::{QueueError, Sequencer};
pub use service::{
    launcher_channel, start_render_service, EnqueueReport, RenderService, ServiceError,
    ServiceHandle, SkipReason, SkippedFile,
};
pub use status::{JobView, OutputEvent, QueueSnapshot};
pub use status_server::{create_control_router, run_control_server, ServerError};
