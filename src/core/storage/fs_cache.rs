// src/core/storage/fs_cache.rs

//! Atomic artifact file operations.
//!
//! All functions take resolved absolute paths; traversal validation happens
//! in the metadata store's path resolver before a path ever reaches here.

use crate::core::EdgeCacheError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// The suffix for in-flight writes. A crash leaves only `.tmp` orphans,
/// never a truncated artifact at the final path.
const TMP_SUFFIX: &str = ".tmp";

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

/// Writes `bytes` to `path` atomically: parent directories are created on
/// demand, the bytes land in `<path>.tmp`, and a rename publishes them.
/// The temp file is removed on any failure.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EdgeCacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    if let Err(e) = fs::write(&tmp, bytes).await {
        remove_quietly(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        remove_quietly(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Reads an artifact. A missing file is `NotFound`, distinct from IO errors.
pub async fn read(path: &Path) -> Result<Vec<u8>, EdgeCacheError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EdgeCacheError::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// Deletes an artifact. A missing file is a successful delete.
pub async fn delete(path: &Path) -> Result<(), EdgeCacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {}: {}", path.display(), e);
        }
    }
}
