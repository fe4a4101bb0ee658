//! Preflight checks run before the queue accepts work.
//!
//! Unlike a hard startup gate these only warn: a missing renderer fails each
//! job with a clear message instead, and the user can fix the settings while
//! the service is running.

use crate::resolver::{RendererResolver, Resolution, VENDOR_DIR};
use maxqueue_config::{Config, SettingsStore};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Highest `-v:` level `3dsmaxcmd` understands.
pub const MAX_VERBOSITY: u8 = 5;

/// Something worth telling the user before the first render
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreflightWarning {
    #[error("3ds Max path not found. Please set it in the settings.")]
    RendererMissing,

    #[error("Configured renderer {} does not exist", .0.display())]
    RendererNotFile(PathBuf),

    #[error("Output folder {} exists but is not a directory", .0.display())]
    OutputNotDirectory(PathBuf),

    #[error("Renderer verbosity {0} is above the maximum of {}", MAX_VERBOSITY)]
    VerbosityTooHigh(u8),
}

/// Check the outcome of renderer resolution.
///
/// A configured path is not trusted blindly here, unlike at launch time.
pub fn check_renderer(resolution: &Resolution) -> Option<PreflightWarning> {
    match resolution {
        Resolution::NotFound => Some(PreflightWarning::RendererMissing),
        Resolution::Configured(path) if !path.is_file() => {
            Some(PreflightWarning::RendererNotFile(path.clone()))
        }
        _ => None,
    }
}

/// A missing folder is fine, it is created per job.
pub fn check_output_folder(path: &Path) -> Option<PreflightWarning> {
    if path.exists() && !path.is_dir() {
        return Some(PreflightWarning::OutputNotDirectory(path.to_path_buf()));
    }
    None
}

pub fn check_verbosity(verbosity: u8) -> Option<PreflightWarning> {
    (verbosity > MAX_VERBOSITY).then_some(PreflightWarning::VerbosityTooHigh(verbosity))
}

/// Folders the resolver looked in, for the not-found report.
pub fn searched_dirs(resolver: &RendererResolver) -> Vec<String> {
    resolver
        .base_dirs()
        .iter()
        .map(|dir| dir.join(VENDOR_DIR).display().to_string())
        .collect()
}

/// Run all preflight checks, logging each warning.
pub fn run_preflight(
    config: &Config,
    settings: &mut SettingsStore,
    resolver: &RendererResolver,
) -> Vec<PreflightWarning> {
    let resolution = resolver.resolve(settings);
    match resolution.path() {
        Some(path) => info!(renderer = %path.display(), "using 3ds Max renderer"),
        None => info!(searched = ?searched_dirs(resolver), "no 3ds Max installation found"),
    }

    let output_folder = settings.get().output_folder;
    let warnings: Vec<PreflightWarning> = [
        check_renderer(&resolution),
        check_output_folder(&output_folder),
        check_verbosity(config.renderer.verbosity),
    ]
    .into_iter()
    .flatten()
    .collect();

    for warning in &warnings {
        warn!("{}", warning);
    }
    warnings
}
