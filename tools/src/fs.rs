//! File access for edits: read with hash, write atomically.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tether_types::ContentHash;

use crate::error::EditError;

/// A file's text and the hash of its bytes at read time.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub text: String,
    pub hash: ContentHash,
}

pub(crate) async fn snapshot(path: &Path) -> Result<Snapshot, EditError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| EditError::io(path, e))?;
    let hash = ContentHash::of(&bytes);
    let text = String::from_utf8(bytes).map_err(|_| {
        EditError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidData, "file is not valid UTF-8"),
        )
    })?;
    Ok(Snapshot { text, hash })
}

/// Hash of the file as it is on disk right now.
pub(crate) async fn current_hash(path: &Path) -> Result<ContentHash, EditError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| EditError::io(path, e))?;
    Ok(ContentHash::of(&bytes))
}

/// Replace `path` with `bytes` via a temp file in the same directory.
///
/// The existing file's permissions carry over. Readers see either the old or
/// the new content, never a mix.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent)?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) async fn write_file(path: &Path, text: String) -> Result<(), EditError> {
    let target: PathBuf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || write_atomic(&target, text.as_bytes())).await;
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EditError::io(path, e)),
        Err(e) => Err(EditError::io(path, io::Error::other(e.to_string()))),
    }
}
