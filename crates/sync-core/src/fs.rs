//! FileSystem trait abstraction for platform-independent vault access.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sync-daemon) - Uses tokio::fs
//!
//! The same trait backs both user documents and the engine's own state under
//! `.sync/` (file index, binding record).

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

/// Directory holding engine state inside a vault. Never synced.
pub const SYNC_DIR: &str = ".sync";

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem rooted at the vault directory.
///
/// All paths are vault-relative and `/`-separated.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Delete a file. Missing files yield `FsError::NotFound`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Whether a vault-relative path belongs to the synced document set.
///
/// Engine state and hidden files/directories are excluded.
pub fn is_syncable(path: &str) -> bool {
    !path.is_empty() && !path.split('/').any(|segment| segment.starts_with('.'))
}

/// Whether a path received from the remote may be written inside the vault.
///
/// Must be relative, `/`-separated, free of empty and dot segments, and
/// syncable.
pub fn is_safe_vault_path(path: &str) -> bool {
    is_syncable(path)
        && !path.contains(['\\', ':', '\0'])
        && path.split('/').all(|segment| !segment.is_empty())
}

/// Recursively list every syncable file in the vault, sorted by path.
pub async fn walk_files<F: FileSystem + ?Sized>(fs: &F) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![String::new()];

    while let Some(dir) = pending.pop() {
        for entry in fs.list(&dir).await? {
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir, entry.name)
            };
            if !is_syncable(&path) {
                continue;
            }
            if entry.is_dir {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// In-memory filesystem for testing
#[derive(Default)]
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    /// All ancestors of `path`, nearest last (excluding root).
    fn ancestors(path: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            out.push(current.clone());
        }
        out
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files.get(&path).cloned().ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        {
            let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
            dirs.extend(Self::ancestors(&path));
        }

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = Self::normalize_path(path);
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if !path.is_empty() && !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let direct_child = |full: &String| -> Option<String> {
            let rest = full.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<DirEntry> = dirs
            .iter()
            .filter_map(&direct_child)
            .map(|name| DirEntry { name, is_dir: true })
            .collect();
        entries.extend(
            files
                .keys()
                .filter_map(&direct_child)
                .map(|name| DirEntry { name, is_dir: false }),
        );
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        match files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(true);
        }
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);
        if let Some(content) = self.files.read().unwrap_or_else(|e| e.into_inner()).get(&path) {
            return Ok(FileStat {
                size: content.len() as u64,
                is_dir: false,
            });
        }
        if path.is_empty() || self.dirs.read().unwrap_or_else(|e| e.into_inner()).contains(&path) {
            return Ok(FileStat {
                size: 0,
                is_dir: true,
            });
        }
        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        dirs.extend(Self::ancestors(&path));
        dirs.insert(path);
        Ok(())
    }
}

// Lets several engines (or an engine and a test) share one filesystem.
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.txt", b"hello world").await.unwrap();
        assert_eq!(fs.read("test.txt").await.unwrap(), b"hello world");
        assert_eq!(fs.stat("test.txt").await.unwrap().size, 11);

        assert!(fs.exists("test.txt").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());

        fs.delete("test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
        assert!(matches!(fs.delete("test.txt").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let fs = InMemoryFs::new();
        fs.write("a/b/c.md", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_walk_skips_sync_dir_and_hidden_files() {
        let fs = InMemoryFs::new();
        fs.write("notes/a.md", b"a").await.unwrap();
        fs.write("b.md", b"b").await.unwrap();
        fs.write(".sync/file-index.json", b"{}").await.unwrap();
        fs.write("notes/.hidden.md", b"h").await.unwrap();
        fs.write(".obsidian/workspace.json", b"{}").await.unwrap();

        let files = walk_files(&fs).await.unwrap();
        assert_eq!(files, vec!["b.md".to_string(), "notes/a.md".to_string()]);
    }

    #[test]
    fn test_safe_vault_paths() {
        assert!(is_safe_vault_path("notes/a.md"));
        assert!(is_safe_vault_path("Daily Log.md"));

        for path in [
            "",
            "../outside.md",
            "notes/../../outside.md",
            ".sync/file-index.json",
            "/etc/passwd",
            "notes//a.md",
            "notes/",
            "C:/a.md",
            "notes\\..\\a.md",
        ] {
            assert!(!is_safe_vault_path(path), "{path:?} should be rejected");
        }
    }
}
