//! Atomic file replacement shared by the cache and selection writers.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{HdrError, Result};

/// Writes `content` to a temp file next to `path`, then renames it over `path`.
///
/// The parent directory is created on every call, so a directory that was
/// missing on a previous attempt is retried here. Empty content still produces
/// a file.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent_dir = path
        .parent()
        .ok_or_else(|| HdrError::io(format!("{} has no parent", path.display()), missing()))?;
    fs_err::create_dir_all(parent_dir)
        .map_err(|err| HdrError::io("create module directory", err))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|err| HdrError::io(format!("temp file in {}", parent_dir.display()), err))?;
    temp_file
        .write_all(content)
        .map_err(|err| HdrError::io(format!("write temp for {}", path.display()), err))?;
    temp_file
        .flush()
        .map_err(|err| HdrError::io(format!("flush temp for {}", path.display()), err))?;
    temp_file
        .persist(path)
        .map_err(|err| HdrError::io(format!("rename onto {}", path.display()), err.error))?;

    set_world_readable(path);
    Ok(())
}

/// Creates an empty file if nothing exists at `path`. Returns true when created.
pub fn ensure_file(path: &Path, initial: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_atomic(path, initial)?;
    Ok(true)
}

#[cfg(unix)]
fn set_world_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
        tracing::debug!(path = %path.display(), error = %err, "chmod 0644 failed");
    }
}

#[cfg(not(unix))]
fn set_world_readable(_path: &Path) {}

fn missing() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, "no parent directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_creates_parent_and_replaces() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("file.txt");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs_err::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs_err::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn write_atomic_empty_content_still_writes_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("empty.xml");
        write_atomic(&path, b"").unwrap();
        assert!(path.exists());
        assert_eq!(fs_err::read(&path).unwrap().len(), 0);
    }

    #[test]
    fn ensure_file_leaves_existing_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("app_cache.json");
        fs_err::write(&path, "{\"a\":1}").unwrap();

        assert!(!ensure_file(&path, b"{}").unwrap());
        assert_eq!(fs_err::read_to_string(&path).unwrap(), "{\"a\":1}");
    }
}
