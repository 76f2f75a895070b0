// ABOUTME: Atomic file primitives shared by the file store and the directory registry.
// ABOUTME: Content is staged in a temp sibling, then published via hard_link or rename.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static SIBLING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique hidden sibling path for temp files and tombstones.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let n = SIBLING_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{n}.{suffix}", std::process::id()))
}

pub(crate) async fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

async fn write_temp(path: &Path, contents: &[u8]) -> io::Result<PathBuf> {
    ensure_parent(path).await?;
    let temp = sibling(path, "tmp");
    tokio::fs::write(&temp, contents).await?;
    Ok(temp)
}

/// Create `path` with `contents` unless it already exists. Returns whether it was created.
///
/// Readers never observe a partially written file.
pub(crate) async fn create_exclusive(path: &Path, contents: &[u8]) -> io::Result<bool> {
    let temp = write_temp(path, contents).await?;
    let linked = tokio::fs::hard_link(&temp, path).await;
    let _ = tokio::fs::remove_file(&temp).await;

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replace `path` with `contents` in one step.
pub(crate) async fn replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp = write_temp(path, contents).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}

pub(crate) async fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
