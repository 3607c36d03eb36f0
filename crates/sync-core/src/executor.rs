//! Executor: performs the actions a diff returned, one at a time.
//!
//! A failing action is recorded in [`ExecutionReport::errors`] and the batch
//! continues. The executor never writes the file index; the engine applies
//! the report after the remote confirms the commit, so a failed action leaves
//! its entry stale and the next diff proposes it again.

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::content_hash::ContentHash;
use crate::fs::{is_safe_vault_path, FileSystem, FsError};
use crate::index::{FileEntry, FileId, FileIndex};
use crate::protocol::{CompletedFile, SyncActionDto, SyncActionKind};
use crate::remote::{BlobTransport, RemoteError};
use crate::vector_clock::{ClockOrdering, VectorClock};
use crate::DeviceId;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Transfer failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0:?} action has no URL")]
    MissingUrl(SyncActionKind),

    #[error("File id {0} is not tracked locally")]
    UnknownFile(FileId),

    #[error("Downloaded content hash {actual} does not match announced {expected}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("{0} changed locally since the diff; skipping delete")]
    ModifiedLocally(String),

    #[error("Refusing path {0:?} outside the synced vault")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// A file written from remote content, to be marked synced after commit.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedEntry {
    pub file_id: FileId,
    pub path: String,
    pub hash: ContentHash,
    pub clock: VectorClock,
    /// Path the remote asked for, when another local file owns it and the
    /// download landed beside it instead.
    pub displaced_from: Option<String>,
}

/// Both sides of a conflict; the original keeps its bytes, the copy gets the remote's.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    pub original_id: FileId,
    pub original_path: String,
    /// Original's clock merged with the remote's.
    pub merged_clock: VectorClock,
    pub remote_hash: ContentHash,
    pub remote_clock: VectorClock,
    pub copy_id: FileId,
    pub copy_path: String,
}

#[derive(Debug)]
pub struct ActionError {
    pub action: SyncActionDto,
    pub error: ExecError,
}

/// Everything one batch achieved.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub completed: Vec<CompletedFile>,
    pub deleted: Vec<FileId>,
    pub downloaded_entries: Vec<DownloadedEntry>,
    pub conflict_entries: Vec<ConflictEntry>,
    pub errors: Vec<ActionError>,
}

impl ExecutionReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
            && self.deleted.is_empty()
            && self.conflict_entries.is_empty()
            && self.errors.is_empty()
    }
}

/// Conflict copy path next to `path`:
/// `dir/stem (conflict <device> <YYYY-MM-DD HHMMSS>).ext`.
pub fn conflict_copy_path(path: &str, device: &DeviceId, suffix: Option<u32>) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(pos) => (&path[..=pos], &path[pos + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match file.rfind('.') {
        Some(pos) if pos > 0 => (&file[..pos], &file[pos..]),
        _ => (file, ""),
    };
    let stamp = Utc::now().format("%Y-%m-%d %H%M%S");
    match suffix {
        Some(n) => format!("{}{} (conflict {} {} {}){}", dir, stem, device, stamp, n, ext),
        None => format!("{}{} (conflict {} {}){}", dir, stem, device, stamp, ext),
    }
}

/// Vet a path that came from the remote before it touches the filesystem.
fn remote_path(path: &str) -> Result<&str> {
    if is_safe_vault_path(path) {
        Ok(path)
    } else {
        Err(ExecError::InvalidPath(path.to_string()))
    }
}

enum Outcome {
    Uploaded(CompletedFile),
    Downloaded(CompletedFile, DownloadedEntry),
    Deleted(FileId),
    Conflicted(CompletedFile, ConflictEntry),
}

pub struct Executor<'a, F: ?Sized, T: ?Sized> {
    fs: &'a F,
    transport: &'a T,
    device_id: DeviceId,
}

impl<'a, F, T> Executor<'a, F, T>
where
    F: FileSystem + ?Sized,
    T: BlobTransport + ?Sized,
{
    pub fn new(fs: &'a F, transport: &'a T, device_id: DeviceId) -> Self {
        Self {
            fs,
            transport,
            device_id,
        }
    }

    /// Run every action in order. Never fails as a whole.
    pub async fn execute(&self, index: &FileIndex, actions: &[SyncActionDto]) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        for action in actions {
            debug!("Executing {:?} for {}", action.action, action.path);
            match self.execute_one(index, action).await {
                Ok(Outcome::Uploaded(done)) => report.completed.push(done),
                Ok(Outcome::Downloaded(done, entry)) => {
                    report.completed.push(done);
                    report.downloaded_entries.push(entry);
                }
                Ok(Outcome::Deleted(id)) => report.deleted.push(id),
                Ok(Outcome::Conflicted(done, conflict)) => {
                    report.completed.push(done);
                    report.conflict_entries.push(conflict);
                }
                Err(error) => {
                    warn!("{:?} failed for {}: {}", action.action, action.path, error);
                    report.errors.push(ActionError {
                        action: action.clone(),
                        error,
                    });
                }
            }
        }

        report
    }

    async fn execute_one(&self, index: &FileIndex, action: &SyncActionDto) -> Result<Outcome> {
        match action.action {
            SyncActionKind::Upload => self.upload(index, action).await,
            SyncActionKind::Download => self.download(index, action).await,
            SyncActionKind::Delete => self.delete(index, action).await,
            SyncActionKind::Conflict => {
                let entry = index
                    .get(action.file_id)
                    .ok_or(ExecError::UnknownFile(action.file_id))?;
                let rename = action.conflict_rename.clone();
                self.conflict(entry, action, rename).await
            }
        }
    }

    async fn upload(&self, index: &FileIndex, action: &SyncActionDto) -> Result<Outcome> {
        let entry = index
            .get(action.file_id)
            .ok_or(ExecError::UnknownFile(action.file_id))?;
        let url = action
            .upload_url
            .as_deref()
            .ok_or(ExecError::MissingUrl(SyncActionKind::Upload))?;

        let bytes = self.fs.read(&entry.path).await?;
        let hash = ContentHash::of(&bytes);
        self.transport.put(url, &bytes).await?;
        info!("Uploaded {} ({} bytes)", entry.path, bytes.len());

        Ok(Outcome::Uploaded(CompletedFile {
            file_id: entry.id,
            path: entry.path.clone(),
            action: SyncActionKind::Upload,
            content_hash: hash,
            size: bytes.len() as u64,
            vector_clock: entry.vector_clock.clone(),
            expected_hash: entry.last_synced_hash.clone(),
        }))
    }

    async fn download(&self, index: &FileIndex, action: &SyncActionDto) -> Result<Outcome> {
        let remote_clock = action.remote_vector_clock.clone().unwrap_or_default();

        // Client-side guard: never overwrite an unsynced local edit.
        if let Some(entry) = index.get(action.file_id) {
            if self.fs.exists(&entry.path).await? {
                let local = ContentHash::of(&self.fs.read(&entry.path).await?);
                let changed = entry.last_synced_hash.as_ref() != Some(&local);
                let same_as_remote = action.content_hash.as_ref() == Some(&local);
                let ordering = entry.vector_clock.compare(&remote_clock);
                if changed
                    && !same_as_remote
                    && matches!(ordering, ClockOrdering::Concurrent | ClockOrdering::After)
                {
                    warn!(
                        "Local edit to {} is {:?} with remote; keeping both",
                        entry.path, ordering
                    );
                    return self.conflict(entry, action, None).await;
                }
            }
        }

        let mut path = match index.get(action.file_id) {
            Some(entry) => entry.path.clone(),
            None => remote_path(&action.path)?.to_string(),
        };
        let bytes = self.fetch(action).await?;
        let hash = ContentHash::of(&bytes);

        // A different local file already owns this path: land beside it.
        let mut displaced_from = None;
        if let Some(other) = index.get_by_path(&path) {
            if other.id != action.file_id {
                let beside = self.unique_conflict_path(&path).await?;
                warn!("{} is taken by another file; downloading to {}", path, beside);
                displaced_from = Some(std::mem::replace(&mut path, beside));
            }
        }

        self.fs.write(&path, &bytes).await?;
        info!("Downloaded {} ({} bytes)", path, bytes.len());

        let done = CompletedFile {
            file_id: action.file_id,
            path: path.clone(),
            action: SyncActionKind::Download,
            content_hash: hash.clone(),
            size: bytes.len() as u64,
            vector_clock: remote_clock.clone(),
            expected_hash: None,
        };
        let entry = DownloadedEntry {
            file_id: action.file_id,
            path,
            hash,
            clock: remote_clock,
            displaced_from,
        };
        Ok(Outcome::Downloaded(done, entry))
    }

    async fn delete(&self, index: &FileIndex, action: &SyncActionDto) -> Result<Outcome> {
        let path = match index.get(action.file_id) {
            Some(entry) => entry.path.clone(),
            None => remote_path(&action.path)?.to_string(),
        };

        if let Some(entry) = index.get(action.file_id) {
            if let Ok(bytes) = self.fs.read(&path).await {
                if entry.last_synced_hash.as_ref() != Some(&ContentHash::of(&bytes)) {
                    return Err(ExecError::ModifiedLocally(path));
                }
            }
        }

        match self.fs.delete(&path).await {
            Ok(()) => info!("Deleted {}", path),
            Err(FsError::NotFound(_)) => debug!("{} already gone", path),
            Err(e) => return Err(e.into()),
        }
        Ok(Outcome::Deleted(action.file_id))
    }

    /// Materialize the remote version as a new file; the original is untouched.
    async fn conflict(
        &self,
        entry: &FileEntry,
        action: &SyncActionDto,
        rename: Option<String>,
    ) -> Result<Outcome> {
        let rename = match rename {
            Some(path) if !path.is_empty() => Some(remote_path(&path)?.to_string()),
            _ => None,
        };
        let bytes = self.fetch(action).await?;
        let remote_hash = ContentHash::of(&bytes);
        let remote_clock = action.remote_vector_clock.clone().unwrap_or_default();

        let copy_path = match rename {
            Some(path) => {
                if self.fs.exists(&path).await? {
                    self.unique_conflict_path(&entry.path).await?
                } else {
                    path
                }
            }
            None => self.unique_conflict_path(&entry.path).await?,
        };
        self.fs.write(&copy_path, &bytes).await?;
        info!("Conflict on {}: remote version saved as {}", entry.path, copy_path);

        let merged_clock = entry.vector_clock.merge(&remote_clock);
        let done = CompletedFile {
            file_id: entry.id,
            path: entry.path.clone(),
            action: SyncActionKind::Conflict,
            content_hash: remote_hash.clone(),
            size: bytes.len() as u64,
            vector_clock: merged_clock.clone(),
            expected_hash: None,
        };
        let conflict = ConflictEntry {
            original_id: entry.id,
            original_path: entry.path.clone(),
            merged_clock,
            remote_hash,
            remote_clock,
            copy_id: FileId::new(),
            copy_path,
        };
        Ok(Outcome::Conflicted(done, conflict))
    }

    async fn fetch(&self, action: &SyncActionDto) -> Result<Vec<u8>> {
        let url = action
            .download_url
            .as_deref()
            .ok_or(ExecError::MissingUrl(action.action))?;
        let bytes = self.transport.get(url).await?;
        if let Some(expected) = &action.content_hash {
            let actual = ContentHash::of(&bytes);
            if &actual != expected {
                return Err(ExecError::HashMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    /// Conflict copy path for `path` that does not exist yet.
    pub async fn unique_conflict_path(&self, path: &str) -> Result<String> {
        let mut candidate = conflict_copy_path(path, &self.device_id, None);
        let mut n = 2;
        while self.fs.exists(&candidate).await? {
            candidate = conflict_copy_path(path, &self.device_id, Some(n));
            n += 1;
        }
        Ok(candidate)
    }
}
