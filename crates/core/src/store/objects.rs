use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::ObjectStore;

/// Object store rooted at a directory; keys map to relative file paths.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create object store root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for_key(&self, key: &str) -> Result<PathBuf> {
        validate_object_key(key)?;
        Ok(self.root.join(key))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let final_path = self.path_for_key(key)?;
        if let Some(parent_dir) = final_path.parent() {
            fs::create_dir_all(parent_dir).with_context(|| {
                format!("failed to create object directory: {}", parent_dir.display())
            })?;
        }

        let tmp_path = tmp_path_for(&final_path);
        cleanup_file_if_exists(&tmp_path);

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        let mut tmp_guard = TempFileCleanupGuard::new(&tmp_path);

        tmp_file
            .write_all(bytes)
            .with_context(|| format!("failed to write temp file: {}", tmp_path.display()))?;
        tmp_file
            .flush()
            .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))?;
        tmp_file
            .sync_all()
            .with_context(|| format!("failed to fsync temp file: {}", tmp_path.display()))?;
        drop(tmp_file);

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to atomically move {} -> {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        tmp_guard.disarm();

        debug!(key, size_bytes = bytes.len(), "stored media object");
        Ok(key.to_string())
    }
}

fn validate_object_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("object key must not be empty");
    }

    let path = Path::new(key);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => bail!("object key must be a relative path without traversal: {key}"),
        }
    }
    Ok(())
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            cleanup_file_if_exists(self.path);
        }
    }
}

fn cleanup_file_if_exists(path: &Path) {
    let _ = fs::remove_file(path);
}
