//! Source file and output folder selection.
//!
//! Stands in for the desktop file dialogs: paths come from the command line
//! or a request body and are expanded and checked here.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Scene file extensions accepted by the queue (case-insensitive matching).
pub const SCENE_EXTENSIONS: &[&str] = &[".max"];

/// Error type for folder selection and opening
#[derive(Debug, Error)]
pub enum PickError {
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Failed to create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Checks if a file has a 3ds Max scene extension (case-insensitive).
pub fn is_scene_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            SCENE_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Expand the user's selection into a list of files to enqueue.
///
/// - Directories are walked recursively for scene files, skipping hidden
///   directories, in file name order
/// - Plain paths are passed through untouched so that the queue can report
///   why it skipped them
/// - Repeated paths are kept once, first occurrence wins
pub fn pick_source_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    use walkdir::WalkDir;

    let mut seen = HashSet::new();
    let mut picked = Vec::new();

    for path in paths {
        if !path.is_dir() {
            if seen.insert(path.clone()) {
                picked.push(path.clone());
            }
            continue;
        }

        let walker = WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                // Allow the root directory even if it starts with '.'
                !(entry.file_type().is_dir()
                    && entry.depth() > 0
                    && entry
                        .file_name()
                        .to_str()
                        .map(|name| name.starts_with('.'))
                        .unwrap_or(false))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && is_scene_file(entry.path()) {
                let file = entry.into_path();
                if seen.insert(file.clone()) {
                    picked.push(file);
                }
            }
        }
    }

    debug!(count = picked.len(), "source files picked");
    picked
}

/// Accept `path` as the output folder, creating it if needed.
pub fn pick_output_folder(path: &Path) -> Result<PathBuf, PickError> {
    if path.exists() && !path.is_dir() {
        return Err(PickError::NotADirectory(path.to_path_buf()));
    }
    std::fs::create_dir_all(path).map_err(|source| PickError::Create {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(path.to_path_buf())
}

/// Show a folder in the platform file manager.
pub fn open_folder(path: &Path) -> Result<(), PickError> {
    if !path.is_dir() {
        return Err(PickError::NotADirectory(path.to_path_buf()));
    }
    open::that_detached(path).map_err(|source| PickError::Open {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_is_scene_file() {
        assert!(is_scene_file(Path::new("/scenes/a.max")));
        assert!(is_scene_file(Path::new("/scenes/A.MAX")));
        assert!(!is_scene_file(Path::new("/scenes/a.max.bak")));
        assert!(!is_scene_file(Path::new("/scenes/a.fbx")));
        assert!(!is_scene_file(Path::new("/scenes/max")));
    }

    #[test]
    fn test_directories_expand_to_scene_files() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("shots")).unwrap();
        fs::create_dir_all(root.path().join(".autoback")).unwrap();
        File::create(root.path().join("b.max")).unwrap();
        File::create(root.path().join("a.max")).unwrap();
        File::create(root.path().join("notes.txt")).unwrap();
        File::create(root.path().join("shots").join("c.max")).unwrap();
        File::create(root.path().join(".autoback").join("old.max")).unwrap();

        let picked = pick_source_files(&[root.path().to_path_buf()]);

        assert_eq!(
            picked,
            vec![
                root.path().join("a.max"),
                root.path().join("b.max"),
                root.path().join("shots").join("c.max"),
            ]
        );
    }

    #[test]
    fn test_plain_paths_pass_through_once() {
        let picked = pick_source_files(&[
            PathBuf::from("/scenes/a.max"),
            PathBuf::from("/scenes/readme.txt"),
            PathBuf::from("/scenes/a.max"),
        ]);

        assert_eq!(
            picked,
            vec![PathBuf::from("/scenes/a.max"), PathBuf::from("/scenes/readme.txt")]
        );
    }

    #[test]
    fn test_pick_output_folder() {
        let root = TempDir::new().unwrap();
        let folder = root.path().join("Renders").join("2025");
        assert_eq!(pick_output_folder(&folder).unwrap(), folder);
        assert!(folder.is_dir());

        let file = root.path().join("file.txt");
        File::create(&file).unwrap();
        assert!(matches!(
            pick_output_folder(&file),
            Err(PickError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_open_missing_folder_fails() {
        let root = TempDir::new().unwrap();
        assert!(matches!(
            open_folder(&root.path().join("missing")),
            Err(PickError::NotADirectory(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_max_extension_any_case(
            stem in "[a-zA-Z0-9_ ]{1,16}",
            ext in "[mM][aA][xX]",
        ) {
            let name = format!("{}.{}", stem, ext);
            let path = Path::new(&name);
            prop_assert!(is_scene_file(path));
        }

        #[test]
        fn prop_other_extensions_rejected(
            stem in "[a-z0-9_]{1,16}",
            ext in "[a-z]{1,4}".prop_filter("not max", |e| e != "max"),
        ) {
            let name = format!("{}.{}", stem, ext);
            let path = Path::new(&name);
            prop_assert!(!is_scene_file(path));
        }
    }
}
