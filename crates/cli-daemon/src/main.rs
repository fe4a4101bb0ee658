//! CLI entry point for the 3ds Max render queue
//!
//! Renders scenes straight from the command line, or runs the queue as a
//! service behind the control API for the `mqtop` dashboard.

use clap::{Parser, Subcommand};
use maxqueue::{
    pick_output_folder, pick_source_files, run_control_server, run_preflight,
    start_render_service, telemetry, Config, JobRequest, OutputEvent, RendererResolver,
    ServiceError, ServiceHandle, Settings, SettingsPatch, SettingsStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

/// 3ds Max render queue - renders scenes one after another with 3dsmaxcmd
#[derive(Parser, Debug)]
#[command(name = "maxqueue")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); optional
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Settings file; defaults to the per-user config directory
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render scene files, or every scene in the given folders
    Render {
        /// Subfolder of the output folder to render into
        #[arg(short, long)]
        project: Option<String>,

        /// Output file name; only used when a single scene is rendered
        #[arg(short = 'n', long)]
        output_name: Option<String>,

        /// Keep the control API up after the queue is done, until Ctrl-C
        #[arg(long)]
        serve: bool,

        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Run the queue behind the control API until Ctrl-C
    Serve,

    /// Show or change the persisted settings
    #[command(subcommand)]
    Settings(SettingsCommand),
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Print the settings, detecting 3ds Max if no path is set
    Show,

    /// Change one or more settings
    Set {
        #[arg(long)]
        output_folder: Option<PathBuf>,

        /// Path to 3dsmaxcmd.exe
        #[arg(long, conflicts_with = "auto_detect")]
        renderer_path: Option<PathBuf>,

        /// Forget the stored 3dsmaxcmd.exe path and detect it again
        #[arg(long)]
        auto_detect: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load_optional(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init(&config.logging) {
        eprintln!("Logging disabled: {}", e);
    }
    info!(config = %args.config.display(), "maxqueue starting");

    let mut settings = open_settings(args.settings);

    let result = match args.command {
        Commands::Render {
            project,
            output_name,
            serve,
            paths,
        } => render(config, settings, project, output_name, serve, paths).await,
        Commands::Serve => serve(config, settings).await,
        Commands::Settings(SettingsCommand::Show) => show_settings(&config, settings),
        Commands::Settings(SettingsCommand::Set {
            output_folder,
            renderer_path,
            auto_detect,
        }) => set_settings(
            &mut settings,
            settings_patch(output_folder, renderer_path, auto_detect),
        ),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn open_settings(path: Option<PathBuf>) -> SettingsStore {
    match path.or_else(SettingsStore::default_path) {
        Some(path) => SettingsStore::open_or_default(path),
        None => {
            warn!("no settings directory on this platform, settings will not be saved");
            SettingsStore::in_memory(Settings::default())
        }
    }
}

async fn render(
    config: Config,
    mut settings: SettingsStore,
    project: Option<String>,
    output_name: Option<String>,
    serve: bool,
    paths: Vec<PathBuf>,
) -> Result<ExitCode, ServiceError> {
    let resolver = RendererResolver::from_env(&config.renderer.search_dirs);
    run_preflight(&config, &mut settings, &resolver);

    let (handle, task) = start_render_service(&config, settings);
    let mut output = handle.subscribe();

    let (stop_server, server) = if serve {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(run_control_server(
            handle.clone(),
            config.server.bind_addr,
            async move {
                let _ = stop_rx.await;
            },
        ));
        println!("Control API on http://{}", config.server.bind_addr);
        (Some(stop_tx), Some(server))
    } else {
        (None, None)
    };

    let files = pick_source_files(&paths);
    let output_name = match output_name {
        Some(_) if files.len() > 1 => {
            eprintln!("--output-name is ignored when rendering more than one scene");
            None
        }
        other => other,
    };
    let requests = files
        .into_iter()
        .map(|source| JobRequest {
            source,
            output_name: output_name.clone(),
            project: None,
        })
        .collect();

    let report = handle.enqueue(requests).await?;
    let mut code = ExitCode::SUCCESS;

    if report.added.is_empty() {
        print_pending(&mut output);
        println!("Nothing to render");
        code = ExitCode::FAILURE;
    } else {
        handle.render_all(project).await?;
        let interrupted = follow_queue(&handle, &mut output).await;

        let snapshot = handle.snapshot();
        let failed = snapshot
            .jobs
            .iter()
            .filter(|j| report.added.contains(&j.id))
            .filter(|j| !matches!(j.status, maxqueue::JobStatus::Completed))
            .count();
        if interrupted || failed > 0 {
            code = ExitCode::FAILURE;
        }
        println!(
            "{} rendered, {} not rendered",
            report.added.len() - failed,
            failed
        );

        if !interrupted && serve {
            println!("Queue finished; still serving, press Ctrl-C to stop");
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    if let Some(stop) = stop_server {
        let _ = stop.send(());
    }
    if let Some(server) = server {
        match server.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "control API task failed"),
        }
    }

    stop_service(handle, task).await;
    Ok(code)
}

/// Print queue output until the queue drains. Returns true on Ctrl-C.
async fn follow_queue(handle: &ServiceHandle, output: &mut broadcast::Receiver<OutputEvent>) -> bool {
    let mut snapshots = handle.watch();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if !snapshots.borrow_and_update().running {
            break;
        }
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = output.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => eprintln!("... {} lines skipped", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                println!("Interrupted, stopping the current render...");
                print_pending(output);
                return true;
            }
        }
    }

    print_pending(output);
    false
}

fn print_pending(output: &mut broadcast::Receiver<OutputEvent>) {
    while let Ok(event) = output.try_recv() {
        print_event(&event);
    }
}

fn print_event(event: &OutputEvent) {
    if event.is_error {
        println!("[error] {}", event.text);
    } else {
        println!("{}", event.text);
    }
}

async fn serve(config: Config, mut settings: SettingsStore) -> Result<ExitCode, ServiceError> {
    let resolver = RendererResolver::from_env(&config.renderer.search_dirs);
    run_preflight(&config, &mut settings, &resolver);

    let (handle, task) = start_render_service(&config, settings);
    println!("Control API on http://{}", config.server.bind_addr);

    let result = run_control_server(handle.clone(), config.server.bind_addr, async {
        let _ = tokio::signal::ctrl_c().await;
        println!("Shutting down...");
    })
    .await;

    stop_service(handle, task).await;
    result?;
    Ok(ExitCode::SUCCESS)
}

async fn stop_service(handle: ServiceHandle, task: tokio::task::JoinHandle<()>) {
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "render service already stopped");
    }
    if let Err(e) = task.await {
        warn!(error = %e, "render service task failed");
    }
}

fn show_settings(config: &Config, mut settings: SettingsStore) -> Result<ExitCode, ServiceError> {
    let resolver = RendererResolver::from_env(&config.renderer.search_dirs);
    let resolution = resolver.resolve(&mut settings);
    let current = settings.get();

    println!("Output folder: {}", current.output_folder.display());
    match resolution.path() {
        Some(path) => println!("3ds Max renderer: {}", path.display()),
        None => println!("3ds Max renderer: not found (set it with `maxqueue settings set --renderer-path`)"),
    }
    match settings.path() {
        Some(path) => println!("Settings file: {}", path.display()),
        None => println!("Settings file: (not saved)"),
    }
    Ok(ExitCode::SUCCESS)
}

/// An empty renderer path clears the stored one.
fn settings_patch(
    output_folder: Option<PathBuf>,
    renderer_path: Option<PathBuf>,
    auto_detect: bool,
) -> SettingsPatch {
    SettingsPatch {
        output_folder,
        renderer_path: if auto_detect {
            Some(PathBuf::new())
        } else {
            renderer_path
        },
    }
}

fn set_settings(settings: &mut SettingsStore, patch: SettingsPatch) -> Result<ExitCode, ServiceError> {
    if patch.is_empty() {
        eprintln!("Nothing to change; pass --output-folder, --renderer-path or --auto-detect");
        return Ok(ExitCode::FAILURE);
    }

    if let Some(folder) = &patch.output_folder {
        if let Err(e) = pick_output_folder(folder) {
            eprintln!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
    }

    let saved = settings.set(patch)?;
    println!("Output folder: {}", saved.output_folder.display());
    match &saved.renderer_path {
        Some(path) => println!("3ds Max renderer: {}", path.display()),
        None => println!("3ds Max renderer: auto-detect"),
    }
    Ok(ExitCode::SUCCESS)
}
