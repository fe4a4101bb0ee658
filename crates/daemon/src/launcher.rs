//! Process launcher for 3ds Max render jobs.
//!
//! Builds the `3dsmaxcmd` invocation for a job, starts it out-of-process and
//! forwards its output and exit status to the control loop as
//! [`LauncherEvent`]s.

use crate::classify::OutputChannel;
use crate::job::{Job, JobId};
use crate::resolver::RendererResolver;
use crate::sanitize::sanitize_chunk;
use maxqueue_config::{RendererConfig, SettingsStore};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Error type for starting a render job
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The renderer is neither configured nor installed in a known location
    #[error("3ds Max path not found. Please set it in the settings.")]
    RendererNotFound,

    /// The job has an empty source path
    #[error("Job has no source file")]
    MissingSource,

    /// The project name would not stay inside the output folder
    #[error("Invalid project name '{0}': it must be a single folder name")]
    InvalidProjectName(String),

    /// The destination directory could not be created
    #[error("Failed to create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The renderer process could not be started
    #[error("Failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Something the running renderer reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherEvent {
    /// One sanitized line from stdout or stderr.
    Output {
        job_id: JobId,
        channel: OutputChannel,
        text: String,
    },
    /// The process is gone. `code` is `None` when it died from a signal.
    Exited { job_id: JobId, code: Option<i32> },
}

/// Everything needed to start the renderer, as a plain value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    /// Command with piped output streams; the child is killed if dropped.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Build the renderer invocation for one scene
///
/// Creates a spec with:
/// - the source scene as the first argument
/// - `-silent` to suppress interactive dialogs
/// - `-outputName:<destination>`
/// - `-v:<verbosity>` so per-frame progress is printed
/// - the configured environment overrides
/// - the scene's folder as working directory, so relative asset paths resolve
pub fn build_render_spec(
    renderer: &Path,
    source: &Path,
    destination: &Path,
    config: &RendererConfig,
) -> ProcessSpec {
    let mut output_arg = OsString::from("-outputName:");
    output_arg.push(destination.as_os_str());

    let args = vec![
        source.as_os_str().to_owned(),
        OsString::from("-silent"),
        output_arg,
        OsString::from(format!("-v:{}", config.verbosity)),
    ];

    let working_dir = source
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);

    ProcessSpec {
        program: renderer.to_path_buf(),
        args,
        env: config.env.clone(),
        working_dir,
    }
}

/// Output file name: the explicit override, else `<scene stem>.<extension>`.
pub fn output_file_name(job: &Job, extension: &str) -> String {
    if let Some(name) = &job.output_name {
        return name.clone();
    }
    let stem = job
        .source()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "render".to_string());
    format!("{}.{}", stem, extension.trim_start_matches('.'))
}

/// `<output_folder>[/<project>]`, created if missing.
pub fn prepare_destination(output_folder: &Path, project: Option<&str>) -> Result<PathBuf, LaunchError> {
    let dir = match project {
        Some(project) => {
            let mut components = Path::new(project).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => output_folder.join(project),
                _ => return Err(LaunchError::InvalidProjectName(project.to_string())),
            }
        }
        None => output_folder.to_path_buf(),
    };

    std::fs::create_dir_all(&dir).map_err(|source| LaunchError::OutputDir {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// Owner's grip on a live renderer process.
///
/// Dropping the handle terminates the process, same as [`ProcessHandle::cancel`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// A handle whose kill requests go to `kill_tx`.
    pub fn new(pid: Option<u32>, kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            kill_tx: Some(kill_tx),
            task: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask for the process to be killed. Returns false if already asked.
    pub fn cancel(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => {
                // The supervisor may already be gone if the process exited
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Wait for the supervising task, i.e. until the process has exited.
    pub async fn wait(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "renderer supervisor task failed");
            }
        }
    }
}

/// A job that made it to a running process.
#[derive(Debug)]
pub struct Launched {
    pub handle: ProcessHandle,
    pub output_path: PathBuf,
}

/// Starts render jobs. The sequencer only talks to this trait.
pub trait Launch {
    /// Start `job`, reading the current settings.
    fn launch(&mut self, job: &Job, settings: &mut SettingsStore) -> Result<Launched, LaunchError>;

    /// Current renderer path, running detection if none is configured.
    fn resolve_renderer(&mut self, settings: &mut SettingsStore) -> Option<PathBuf>;
}

/// Launches the real `3dsmaxcmd` process.
pub struct RenderLauncher {
    config: RendererConfig,
    resolver: RendererResolver,
    events: mpsc::Sender<LauncherEvent>,
}

impl RenderLauncher {
    pub fn new(
        config: RendererConfig,
        resolver: RendererResolver,
        events: mpsc::Sender<LauncherEvent>,
    ) -> Self {
        Self {
            config,
            resolver,
            events,
        }
    }
}

impl Launch for RenderLauncher {
    fn launch(&mut self, job: &Job, settings: &mut SettingsStore) -> Result<Launched, LaunchError> {
        let renderer = self
            .resolver
            .resolve(settings)
            .into_path()
            .ok_or(LaunchError::RendererNotFound)?;

        if job.source().as_os_str().is_empty() {
            return Err(LaunchError::MissingSource);
        }
        let source = absolute(job.source());

        let current = settings.get();
        let dir = prepare_destination(&current.output_folder, job.project.as_deref())?;
        let output_path = dir.join(output_file_name(job, &self.config.output_extension));

        let spec = build_render_spec(&renderer, &source, &output_path, &self.config);
        let handle = spawn(&spec, job.id(), self.events.clone())?;

        info!(
            job_id = %job.id(),
            pid = ?handle.pid(),
            output = %output_path.display(),
            "renderer started"
        );
        Ok(Launched {
            handle,
            output_path,
        })
    }

    fn resolve_renderer(&mut self, settings: &mut SettingsStore) -> Option<PathBuf> {
        self.resolver.resolve(settings).into_path()
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Start the process described by `spec` and supervise it.
///
/// Must be called from inside a tokio runtime. Each output line becomes a
/// [`LauncherEvent::Output`]; once the process has exited and both streams
/// are drained, a single [`LauncherEvent::Exited`] follows.
pub fn spawn(
    spec: &ProcessSpec,
    job_id: JobId,
    events: mpsc::Sender<LauncherEvent>,
) -> Result<ProcessHandle, LaunchError> {
    let mut child = spec.to_command().spawn().map_err(|source| LaunchError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_output(
            stdout,
            OutputChannel::Stdout,
            job_id,
            events.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_output(
            stderr,
            OutputChannel::Stderr,
            job_id,
            events.clone(),
        )));
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    let task = tokio::spawn(supervise(child, kill_rx, readers, job_id, events));

    Ok(ProcessHandle {
        pid,
        kill_tx: Some(kill_tx),
        task: Some(task),
    })
}

/// Longest run of output forwarded as one line when no terminator arrives.
pub const MAX_LINE_BYTES: usize = 4096;

/// Split the next line off `pending`.
///
/// Both `\n` and `\r` end a line, so progress that redraws itself with
/// carriage returns is forwarded as it happens. A run longer than
/// [`MAX_LINE_BYTES`] is cut at that length.
fn take_line(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    if let Some(end) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
        return Some(pending.drain(..=end).collect());
    }
    if pending.len() >= MAX_LINE_BYTES {
        return Some(pending.drain(..MAX_LINE_BYTES).collect());
    }
    None
}

/// Send one raw line as an output event. Returns false once nobody listens.
async fn send_line(
    events: &mpsc::Sender<LauncherEvent>,
    job_id: JobId,
    channel: OutputChannel,
    raw: &[u8],
) -> bool {
    let text = sanitize_chunk(raw);
    if text.trim().is_empty() {
        return true;
    }
    let event = LauncherEvent::Output {
        job_id,
        channel,
        text,
    };
    events.send(event).await.is_ok()
}

async fn forward_output<R>(
    stream: R,
    channel: OutputChannel,
    job_id: JobId,
    events: mpsc::Sender<LauncherEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut pending = Vec::new();
    loop {
        let read = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => {
                pending.extend_from_slice(chunk);
                chunk.len()
            }
            Err(e) => {
                warn!(%job_id, ?channel, error = %e, "failed reading renderer output");
                break;
            }
        };
        reader.consume(read);

        while let Some(line) = take_line(&mut pending) {
            if !send_line(&events, job_id, channel, &line).await {
                return;
            }
        }
    }

    // Whatever the process printed last without a terminator
    if !pending.is_empty() {
        send_line(&events, job_id, channel, &pending).await;
    }
}

async fn supervise(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    job_id: JobId,
    events: mpsc::Sender<LauncherEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            debug!(%job_id, "terminating renderer");
            if let Err(e) = child.start_kill() {
                warn!(%job_id, error = %e, "failed to signal renderer");
            }
            child.wait().await
        }
    };

    for reader in readers {
        let _ = reader.await;
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(%job_id, error = %e, "failed waiting for renderer");
            None
        }
    };
    debug!(%job_id, ?code, "renderer exited");
    let _ = events.send(LauncherEvent::Exited { job_id, code }).await;
}
