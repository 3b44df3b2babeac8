use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::ObisError;

/// Regular files below `root`, depth first. A missing root yields nothing.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, ObisError> {
    let mut files = Vec::new();
    if !root.is_dir() {
        return Ok(files);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| ObisError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| ObisError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `root` joined with a server-supplied relative path. Leading slashes are
/// dropped; `..`, root and prefix components are rejected.
pub fn enclosed_path(root: &Path, relative: &str) -> Result<PathBuf, ObisError> {
    let relative = Path::new(relative.trim_start_matches('/'));
    let mut enclosed = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => enclosed.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ObisError::Filesystem(format!(
                    "path traversal detected: {}",
                    relative.display()
                )));
            }
        }
    }
    if enclosed == root {
        return Err(ObisError::Filesystem("empty file path".to_string()));
    }
    Ok(enclosed)
}

pub fn count_files(root: &Path) -> Result<usize, ObisError> {
    walk_files(root).map(|files| files.len())
}

/// Writes through a temp file in the target directory, then renames over `path`.
pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), ObisError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| ObisError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".openbis-tmp")
        .tempfile_in(parent)
        .map_err(|err| ObisError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| ObisError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| ObisError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_nested_files_only() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("original/sub")).unwrap();
        fs::write(temp.path().join("original/a.txt"), b"a").unwrap();
        fs::write(temp.path().join("original/sub/b.txt"), b"b").unwrap();
        fs::create_dir_all(temp.path().join("empty")).unwrap();
        assert_eq!(count_files(temp.path()).unwrap(), 2);
    }

    #[test]
    fn missing_root_counts_zero() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(count_files(&temp.path().join("nope")).unwrap(), 0);
    }

    #[test]
    fn enclosed_path_stays_below_root() {
        let root = Path::new("/data/DS1");
        assert_eq!(
            enclosed_path(root, "/original/./a.txt").unwrap(),
            root.join("original/a.txt")
        );
        for escaping in ["../outside.txt", "original/../../x", "a/../b", "", "/"] {
            assert!(enclosed_path(root, escaping).is_err(), "{escaping}");
        }
    }

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested/config.json");
        write_bytes_atomic(&path, b"one").unwrap();
        write_bytes_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
