//! Persisted user settings
//!
//! A small record (output folder, renderer executable) stored as TOML under
//! the user's config directory. Every save is a durable write; a settings
//! file that cannot be read never stops the application, it falls back to
//! in-memory defaults instead.

use directories_next::{BaseDirs, ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "maxqueue";
const APPLICATION: &str = "3ds-max-queue";
const SETTINGS_FILE: &str = "settings.toml";

/// Error type for settings persistence
#[derive(Debug)]
pub enum StorageError {
    /// The settings file could not be read or written
    Io { path: PathBuf, source: std::io::Error },
    /// The settings file exists but is not valid TOML
    Parse { path: PathBuf, source: toml::de::Error },
    /// The record could not be serialized
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io { path, source } => {
                write!(f, "Settings file {} is not accessible: {}", path.display(), source)
            }
            StorageError::Parse { path, source } => {
                write!(f, "Settings file {} is malformed: {}", path.display(), source)
            }
            StorageError::Serialize(e) => write!(f, "Failed to serialize settings: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io { source, .. } => Some(source),
            StorageError::Parse { source, .. } => Some(source),
            StorageError::Serialize(e) => Some(e),
        }
    }
}

/// The persisted settings record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Root directory renders are written into
    #[serde(default = "default_output_folder")]
    pub output_folder: PathBuf,
    /// Renderer executable; `None` means auto-detect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer_path: Option<PathBuf>,
}

/// `<Documents>/Renders`, falling back to `~/Documents/Renders`.
pub fn default_output_folder() -> PathBuf {
    let documents = UserDirs::new()
        .and_then(|dirs| dirs.document_dir().map(Path::to_path_buf))
        .or_else(|| BaseDirs::new().map(|dirs| dirs.home_dir().join("Documents")))
        .unwrap_or_else(|| PathBuf::from("."));
    documents.join("Renders")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_folder: default_output_folder(),
            renderer_path: None,
        }
    }
}

/// A partial update; fields left as `None` are not touched.
///
/// An empty `renderer_path` clears the stored executable so the next job
/// auto-detects it again.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsPatch {
    #[serde(default)]
    pub output_folder: Option<PathBuf>,
    #[serde(default)]
    pub renderer_path: Option<PathBuf>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.output_folder.is_none() && self.renderer_path.is_none()
    }
}

impl Settings {
    /// Merge `patch` into this record
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(folder) = patch.output_folder {
            if !folder.as_os_str().is_empty() {
                self.output_folder = folder;
            }
        }
        if let Some(renderer) = patch.renderer_path {
            self.renderer_path = if renderer.as_os_str().is_empty() {
                None
            } else {
                Some(renderer)
            };
        }
    }
}

/// File-backed key-value store for [`Settings`]
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: Settings,
}

impl SettingsStore {
    /// Default location of the settings file, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Open the store at `path`. A missing file yields the defaults.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StorageError> {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|source| StorageError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "settings file not found, using defaults");
                Settings::default()
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        Ok(Self {
            path: Some(path),
            current,
        })
    }

    /// Open the store at `path`, continuing on defaults if it cannot be read.
    ///
    /// The path is kept, so a later [`SettingsStore::set`] still tries to
    /// write the file.
    pub fn open_or_default<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        match Self::open(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "falling back to default settings");
                Self {
                    path: Some(path),
                    current: Settings::default(),
                }
            }
        }
    }

    /// A store with no backing file
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            current: settings,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> Settings {
        self.current.clone()
    }

    /// Merge `patch` into the record and persist it.
    ///
    /// The merged record stays in effect even when the write fails.
    pub fn set(&mut self, patch: SettingsPatch) -> Result<Settings, StorageError> {
        self.current.apply(patch);
        if let Some(path) = &self.path {
            write_atomically(path, &self.current)?;
            debug!(path = %path.display(), "settings saved");
        }
        Ok(self.current.clone())
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomically(path: &Path, settings: &Settings) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let content = toml::to_string_pretty(settings).map_err(StorageError::Serialize)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SettingsStore {
        SettingsStore::open(dir.path().join("nested").join(SETTINGS_FILE)).unwrap()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.get(), Settings::default());
        assert!(store.get().output_folder.ends_with("Renders"));
        assert!(store.get().renderer_path.is_none());
    }

    #[test]
    fn test_set_is_durable() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        store
            .set(SettingsPatch {
                output_folder: Some(PathBuf::from("/renders/out")),
                renderer_path: Some(PathBuf::from("C:/Max/3dsmaxcmd.exe")),
            })
            .unwrap();

        let reopened = store_in(&dir);
        assert_eq!(reopened.get().output_folder, PathBuf::from("/renders/out"));
        assert_eq!(
            reopened.get().renderer_path,
            Some(PathBuf::from("C:/Max/3dsmaxcmd.exe"))
        );
    }

    #[test]
    fn test_empty_renderer_path_clears_cache() {
        let mut settings = Settings {
            output_folder: PathBuf::from("/out"),
            renderer_path: Some(PathBuf::from("/max/3dsmaxcmd.exe")),
        };
        settings.apply(SettingsPatch {
            output_folder: None,
            renderer_path: Some(PathBuf::new()),
        });

        assert_eq!(settings.renderer_path, None);
        assert_eq!(settings.output_folder, PathBuf::from("/out"));
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "output_folder = [not toml").unwrap();

        assert!(matches!(
            SettingsStore::open(&path),
            Err(StorageError::Parse { .. })
        ));

        let mut store = SettingsStore::open_or_default(&path);
        assert_eq!(store.get(), Settings::default());

        // The path survives, so the next save repairs the file
        store
            .set(SettingsPatch {
                output_folder: Some(PathBuf::from("/fixed")),
                renderer_path: None,
            })
            .unwrap();
        assert_eq!(
            SettingsStore::open(&path).unwrap().get().output_folder,
            PathBuf::from("/fixed")
        );
    }

    #[test]
    fn test_failed_write_keeps_in_memory_value() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the rename fail
        let path = dir.path().join(SETTINGS_FILE);
        fs::create_dir_all(path.join("occupied")).unwrap();

        let mut store = SettingsStore::open_or_default(&path);
        let result = store.set(SettingsPatch {
            output_folder: Some(PathBuf::from("/still/applied")),
            renderer_path: None,
        });

        assert!(result.is_err());
        assert_eq!(store.get().output_folder, PathBuf::from("/still/applied"));
    }

    #[test]
    fn test_in_memory_store_never_touches_disk() {
        let mut store = SettingsStore::in_memory(Settings::default());
        assert!(store.path().is_none());
        let updated = store
            .set(SettingsPatch {
                output_folder: Some(PathBuf::from("/tmp/x")),
                renderer_path: None,
            })
            .unwrap();
        assert_eq!(updated.output_folder, PathBuf::from("/tmp/x"));
    }

    fn patch_strategy() -> impl Strategy<Value = SettingsPatch> {
        (
            proptest::option::of("/[a-z]{1,8}/[a-z]{1,8}"),
            proptest::option::of("(/[a-z]{1,8}/3dsmaxcmd\\.exe)?"),
        )
            .prop_map(|(folder, renderer)| SettingsPatch {
                output_folder: folder.map(PathBuf::from),
                renderer_path: renderer.map(PathBuf::from),
            })
    }

    // Fields absent from a patch keep whatever value they had before.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_patch_leaves_absent_fields_unchanged(patch in patch_strategy()) {
            let before = Settings {
                output_folder: PathBuf::from("/before/out"),
                renderer_path: Some(PathBuf::from("/before/3dsmaxcmd.exe")),
            };
            let mut after = before.clone();
            after.apply(patch.clone());

            match &patch.output_folder {
                None => prop_assert_eq!(&after.output_folder, &before.output_folder),
                Some(folder) => prop_assert_eq!(&after.output_folder, folder),
            }
            match &patch.renderer_path {
                None => prop_assert_eq!(&after.renderer_path, &before.renderer_path),
                Some(p) if p.as_os_str().is_empty() => prop_assert!(after.renderer_path.is_none()),
                Some(p) => prop_assert_eq!(after.renderer_path.as_ref(), Some(p)),
            }
        }
    }
}
