//! Crash-safe file writes shared by the memory store and the stuck history.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{GuardError, GuardResult};

/// Atomically replace `path` with `bytes`.
///
/// The temp file lives in the target directory so the final rename never
/// crosses filesystems. Readers see either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> GuardResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| GuardError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| GuardError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| GuardError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| GuardError::io(path, e.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> GuardResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}
