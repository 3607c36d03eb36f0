//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use sync_core::fs::{DirEntry, FileStat, FileSystem, FsError, Result};
use tokio::fs;

/// Vault directory on local disk. Paths are vault-relative and `/`-separated.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() || path == "." {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

/// Keep "not found" distinguishable; the engine treats it as a deletion.
fn map_io(path: &str, err: std::io::Error) -> FsError {
    match err.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::IsADirectory => FsError::IsDirectory(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, err)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path)).await.map_err(|e| map_io(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io(path, e))?;
        }

        fs::write(&full_path, content).await.map_err(|e| map_io(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(path, e))? {
            let file_type = entry.file_type().await.map_err(|e| map_io(path, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path).await.map_err(|e| map_io(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path).await.map_err(|e| map_io(path, e))
        } else {
            fs::remove_file(&full_path).await.map_err(|e| map_io(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))?;

        Ok(FileStat {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }
}
