//! On-disk representation of the feed collection.
//!
//! The file is pretty-printed JSON with a version tag. Field order is fixed by
//! the struct definitions and feeds are written in display order, so saving
//! an unchanged document reproduces the same bytes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use super::types::{Feed, FeedRef, PersistError};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct FeedsFileOut<'a> {
    version: u32,
    feeds: Vec<&'a Feed>,
}

#[derive(Deserialize)]
struct FeedsFileIn {
    version: u32,
    #[serde(default)]
    feeds: Vec<Feed>,
}

/// Encode feeds in the persisted layout.
pub(crate) fn encode(feeds: &[FeedRef]) -> Result<Vec<u8>, PersistError> {
    let file = FeedsFileOut {
        version: FORMAT_VERSION,
        feeds: feeds.iter().map(|f| &**f).collect(),
    };
    let mut bytes = serde_json::to_vec_pretty(&file).map_err(PersistError::Serialize)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read a feeds file. A missing file is `Ok(None)`.
///
/// Feed ids must be unique, and the highest id must leave room for the next
/// one to be assigned.
pub(crate) fn read(path: &Path) -> Result<Option<Vec<Feed>>, PersistError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistError::io(path, e)),
    };

    let file: FeedsFileIn =
        serde_json::from_slice(&bytes).map_err(|source| PersistError::Deserialize {
            path: path.to_path_buf(),
            source,
        })?;

    if file.version != FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion(file.version));
    }

    let mut seen = HashSet::with_capacity(file.feeds.len());
    for feed in &file.feeds {
        if !seen.insert(feed.id) {
            return Err(PersistError::DuplicateId {
                path: path.to_path_buf(),
                id: feed.id,
            });
        }
        if feed.id == u64::MAX {
            return Err(PersistError::IdsExhausted {
                path: path.to_path_buf(),
            });
        }
    }

    Ok(Some(file.feeds))
}

/// Atomically replace `dst` with `content` using write-to-temp-then-rename.
///
/// The destination is either the old file or the complete new one. On any
/// failure the temp file is removed and `dst` is untouched.
pub(crate) fn write_atomic(dst: &Path, content: &[u8]) -> Result<(), PersistError> {
    use std::time::{SystemTime, UNIX_EPOCH};

    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }

    // Unpredictable suffix; create_new refuses to follow a planted file
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let cleanup = |e: std::io::Error| {
        let _ = std::fs::remove_file(&temp_path);
        PersistError::io(&temp_path, e)
    };

    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .map_err(|e| PersistError::io(&temp_path, e))?;

    temp_file.write_all(content).map_err(cleanup)?;
    temp_file.sync_all().map_err(cleanup)?;
    drop(temp_file);

    // On Windows, rename fails if destination exists
    #[cfg(windows)]
    if dst.exists() {
        std::fs::remove_file(dst).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            PersistError::io(dst, e)
        })?;
    }

    std::fs::rename(&temp_path, dst).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        PersistError::io(dst, e)
    })?;

    Ok(())
}
