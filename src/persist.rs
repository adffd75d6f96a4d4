//! Small helpers for the JSON state files under `.autopatch/`.
//!
//! All writers go through [`write_atomic`]; readers treat a missing file as
//! absent and a corrupt one as absent with a warning.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{AutopatchError, Result};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Write `bytes` to a sibling temp file, sync it, and rename it over `path`.
///
/// # Errors
///
/// Returns an error if any filesystem step fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path(path);

    let mut tmp_file = File::create(&tmp_path)?;
    tmp_file.write_all(bytes)?;
    tmp_file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, serde_json::to_string_pretty(value)?.as_bytes())
}

/// Read a JSON file. Missing, unreadable and corrupt files all yield `None`;
/// the latter two are logged.
#[must_use]
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Unreadable state file {}: {}", path.display(), e);
            return None;
        }
    };
    if content.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "Corrupted state file {}: {}. Starting fresh.",
                path.display(),
                e
            );
            None
        }
    }
}

/// Run `f` while holding an exclusive lock on `lock_path`.
///
/// # Errors
///
/// Returns an error if the lock cannot be taken, or whatever `f` returns.
pub fn with_lock<T>(lock_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let lock_file = File::create(lock_path)?;
    FileExt::lock_exclusive(&lock_file).map_err(|e| {
        AutopatchError::Other(anyhow::anyhow!(
            "Failed to acquire lock {}: {e}",
            lock_path.display()
        ))
    })?;
    let result = f();
    let _ = FileExt::unlock(&lock_file);
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_json_then_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/state.json");

        write_json(&path, &vec![1, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = read_json(&path);
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_read_missing_and_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        assert_eq!(read_json::<Vec<u32>>(&path), None);

        fs::write(&path, "[1, 2").unwrap();
        assert_eq!(read_json::<Vec<u32>>(&path), None);
    }

    #[test]
    fn test_with_lock_returns_inner_result() {
        let temp = TempDir::new().unwrap();
        let lock = temp.path().join("x.lock");
        let value = with_lock(&lock, || Ok(7)).unwrap();
        assert_eq!(value, 7);
        // Lock is released: taking it again does not block.
        assert!(with_lock(&lock, || Ok(())).is_ok());
    }
}
