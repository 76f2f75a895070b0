// ABOUTME: Deterministic tar packaging of a source directory.
// ABOUTME: Entries are sorted and stripped of mtimes and owners so the digest depends only on content.

use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{ArtifactBuilder, BuildError, BuiltArtifact, SourceSpec};

/// Top-level entries never packaged.
const ALWAYS_EXCLUDED: &[&str] = &[".git", ".halyard"];

/// Packs a source directory into an uncompressed tar archive.
#[derive(Debug, Clone, Default)]
pub struct TarballBuilder {
    exclude: Vec<String>,
}

impl TarballBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip additional top-level entries (e.g. `target`, `node_modules`).
    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    fn is_excluded(&self, name: &str) -> bool {
        ALWAYS_EXCLUDED.contains(&name) || self.exclude.iter().any(|e| e == name)
    }

    fn pack(&self, root: &Path) -> Result<Vec<u8>, BuildError> {
        if !root.is_dir() {
            return Err(BuildError::SourceNotFound(root.to_path_buf()));
        }

        let mut entries = Vec::new();
        self.collect(root, root, &mut entries)?;
        entries.sort();

        let mut archive = tar::Builder::new(Vec::new());
        for relative in &entries {
            append_entry(&mut archive, root, relative)?;
        }
        archive
            .into_inner()
            .map_err(|e| BuildError::Packaging(e.to_string()))
    }

    fn collect(
        &self,
        root: &Path,
        dir: &Path,
        entries: &mut Vec<PathBuf>,
    ) -> Result<(), BuildError> {
        let read = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;
        for entry in read {
            let entry = entry.map_err(|source| io_error(dir, source))?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|e| BuildError::Packaging(e.to_string()))?
                .to_path_buf();

            if dir == root && self.is_excluded(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let file_type = entry
                .file_type()
                .map_err(|source| io_error(&path, source))?;
            entries.push(relative);
            if file_type.is_dir() {
                self.collect(root, &path, entries)?;
            }
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: io::Error) -> BuildError {
    BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn normalized_header(entry_type: tar::EntryType, size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn append_entry(
    archive: &mut tar::Builder<Vec<u8>>,
    root: &Path,
    relative: &Path,
) -> Result<(), BuildError> {
    let path = root.join(relative);
    let meta = fs::symlink_metadata(&path).map_err(|source| io_error(&path, source))?;
    let packaging = |e: io::Error| BuildError::Packaging(format!("{}: {e}", relative.display()));

    if meta.is_dir() {
        let mut header = normalized_header(tar::EntryType::Directory, 0, 0o755);
        archive
            .append_data(&mut header, relative, io::empty())
            .map_err(packaging)?;
    } else if meta.file_type().is_symlink() {
        let target = fs::read_link(&path).map_err(|source| io_error(&path, source))?;
        let mut header = normalized_header(tar::EntryType::Symlink, 0, 0o777);
        archive
            .append_link(&mut header, relative, &target)
            .map_err(packaging)?;
    } else {
        let data = fs::read(&path).map_err(|source| io_error(&path, source))?;
        let mode = if is_executable(&meta) { 0o755 } else { 0o644 };
        let mut header = normalized_header(tar::EntryType::Regular, data.len() as u64, mode);
        archive
            .append_data(&mut header, relative, data.as_slice())
            .map_err(packaging)?;
    }
    Ok(())
}

#[async_trait]
impl ArtifactBuilder for TarballBuilder {
    async fn build(&self, source: &SourceSpec) -> Result<BuiltArtifact, BuildError> {
        let builder = self.clone();
        let context = source.context.clone();
        let payload = tokio::task::spawn_blocking(move || builder.pack(&context))
            .await
            .map_err(|e| BuildError::Packaging(e.to_string()))??;

        let artifact = BuiltArtifact::new(Bytes::from(payload));
        tracing::debug!(
            artifact = %source.name,
            digest = %artifact.digest,
            bytes = artifact.payload.len(),
            "packed source"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn entry_names(payload: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(payload);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn identical_sources_have_identical_digests() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for dir in [a.path(), b.path()] {
            write(dir, "src/main.py", "print('hi')\n");
            write(dir, "requirements.txt", "flask\n");
        }

        let builder = TarballBuilder::new();
        let first = builder
            .build(&SourceSpec::new("app", a.path()))
            .await
            .unwrap();
        let second = builder
            .build(&SourceSpec::new("app", b.path()))
            .await
            .unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(first.payload, second.payload);
    }

    #[tokio::test]
    async fn content_change_changes_digest() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "app.txt", "one");
        let builder = TarballBuilder::new();
        let spec = SourceSpec::new("app", dir.path());

        let before = builder.build(&spec).await.unwrap();
        write(dir.path(), "app.txt", "two");
        let after = builder.build(&spec).await.unwrap();

        assert_ne!(before.digest, after.digest);
    }

    #[tokio::test]
    async fn entries_are_sorted_and_exclusions_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.txt", "b");
        write(dir.path(), "a/z.txt", "z");
        write(dir.path(), ".git/HEAD", "ref");
        write(dir.path(), "target/out", "bin");

        let built = TarballBuilder::new()
            .exclude(["target"])
            .build(&SourceSpec::new("app", dir.path()))
            .await
            .unwrap();

        assert_eq!(entry_names(&built.payload), vec!["a", "a/z.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = TarballBuilder::new()
            .build(&SourceSpec::new("app", dir.path().join("missing")))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::SourceNotFound(_)));
    }
}
