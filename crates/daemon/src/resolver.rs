//! Renderer path resolver.
//!
//! Locates `3dsmaxcmd.exe` when the user has not configured it. A configured
//! path is trusted as-is; otherwise the usual Program Files locations are
//! probed and the first hit is cached in the settings.

use maxqueue_config::{SettingsPatch, SettingsStore};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Vendor directory under each base directory.
pub const VENDOR_DIR: &str = "Autodesk";

/// Product directories contain this in their name, e.g. `3ds Max 2025`.
pub const PRODUCT_DIR_PATTERN: &str = "3ds Max";

/// Command-line renderer executable name.
pub const RENDERER_EXECUTABLE: &str = "3dsmaxcmd.exe";

/// Environment variables naming the Program Files locations.
const BASE_DIR_VARS: &[&str] = &["ProgramFiles", "ProgramFiles(x86)"];

/// Outcome of a resolution attempt. `NotFound` is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Taken from the settings without checking it.
    Configured(PathBuf),
    /// Found by scanning and cached in the settings.
    Detected(PathBuf),
    NotFound,
}

impl Resolution {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Configured(p) | Resolution::Detected(p) => Some(p),
            Resolution::NotFound => None,
        }
    }

    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            Resolution::Configured(p) | Resolution::Detected(p) => Some(p),
            Resolution::NotFound => None,
        }
    }
}

/// Probes a fixed list of base directories for the renderer.
#[derive(Debug, Clone, Default)]
pub struct RendererResolver {
    base_dirs: Vec<PathBuf>,
}

impl RendererResolver {
    pub fn new(base_dirs: Vec<PathBuf>) -> Self {
        Self { base_dirs }
    }

    /// Program Files locations from the environment, followed by `extra`.
    pub fn from_env(extra: &[PathBuf]) -> Self {
        let mut base_dirs: Vec<PathBuf> = BASE_DIR_VARS
            .iter()
            .filter_map(|var| env::var_os(var))
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .collect();
        base_dirs.extend(extra.iter().cloned());
        base_dirs.dedup();
        Self { base_dirs }
    }

    pub fn base_dirs(&self) -> &[PathBuf] {
        &self.base_dirs
    }

    /// Resolve the renderer executable, caching a detected path in `settings`.
    pub fn resolve(&self, settings: &mut SettingsStore) -> Resolution {
        if let Some(configured) = settings.get().renderer_path {
            if !configured.as_os_str().is_empty() {
                return Resolution::Configured(configured);
            }
        }

        match self.detect() {
            Some(found) => {
                info!(path = %found.display(), "detected 3ds Max renderer");
                let patch = SettingsPatch {
                    output_folder: None,
                    renderer_path: Some(found.clone()),
                };
                if let Err(e) = settings.set(patch) {
                    warn!(error = %e, "could not cache the detected renderer path");
                }
                Resolution::Detected(found)
            }
            None => Resolution::NotFound,
        }
    }

    /// Scan the base directories without touching any settings.
    pub fn detect(&self) -> Option<PathBuf> {
        for base in &self.base_dirs {
            match find_in_base(base) {
                Ok(Some(found)) => return Some(found),
                Ok(None) => {}
                Err(e) => {
                    warn!(base = %base.display(), error = %e, "error while probing for 3ds Max");
                }
            }
        }
        None
    }
}

/// Look for `<base>/Autodesk/<*3ds Max*>/3dsmaxcmd.exe`, newest release first.
fn find_in_base(base: &Path) -> io::Result<Option<PathBuf>> {
    let vendor = base.join(VENDOR_DIR);
    if !vendor.is_dir() {
        debug!(path = %vendor.display(), "no vendor directory");
        return Ok(None);
    }

    let mut products: Vec<PathBuf> = fs::read_dir(&vendor)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.contains(PRODUCT_DIR_PATTERN))
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();

    // Release years sort lexically, so descending order tries the newest first
    products.sort_by(|a, b| b.cmp(a));

    Ok(products
        .into_iter()
        .map(|dir| dir.join(RENDERER_EXECUTABLE))
        .find(|exe| exe.is_file()))
}
