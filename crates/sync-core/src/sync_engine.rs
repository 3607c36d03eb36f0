//! SyncEngine: runs one diff → execute → commit cycle for a bound vault.
//!
//! The cycle works as follows:
//!
//! 1. Scan the vault: assign ids to new files and bump this device's clock
//!    entry for files whose bytes changed since they were last synced. A
//!    file edited and then reverted before syncing loses its bump again.
//! 2. Send a fingerprint of every tracked file (deleted ones included) as a
//!    diff request; the remote answers with the actions it needs.
//! 3. Execute every action, collecting failures instead of stopping.
//! 4. Commit the outcomes. Only what the remote confirms is written to the
//!    file index; rejected uploads come back as conflicts and are
//!    materialized as conflict copies on this device.
//!
//! The index is mutated only here, and the scheduler never runs two cycles at
//! once, so no further locking is needed around it.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::content_hash::ContentHash;
use crate::events::{EventBus, SyncEvent};
use crate::executor::{ActionError, ConflictEntry, DownloadedEntry, ExecutionReport, Executor};
use crate::fs::{walk_files, FileSystem, FsError};
use crate::index::{FileIndex, IndexError};
use crate::protocol::{
    ConflictFileDto, LocalFileDto, SyncActionDto, SyncActionKind, SyncCommitRequest,
    SyncDiffRequest,
};
use crate::remote::{BlobTransport, RemoteApi, RemoteError};
use crate::scheduler::CycleRunner;
use crate::DeviceId;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("File index error: {0}")]
    Index(#[from] IndexError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// What the scan found before fingerprinting.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanReport {
    /// Files seen for the first time.
    pub added: Vec<String>,
    /// Tracked files whose content changed since the last sync.
    pub modified: Vec<String>,
    /// Tracked files missing on disk.
    pub missing: Vec<String>,
    /// Files back to their synced bytes, whose unsynced bump was dropped.
    pub reverted: Vec<String>,
}

/// A conflict that ended with both versions on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictOutcome {
    pub path: String,
    pub conflict_path: String,
}

/// Result of one cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub deleted: Vec<String>,
    pub conflicts: Vec<ConflictOutcome>,
    pub errors: Vec<ActionError>,
}

impl CycleReport {
    pub fn is_noop(&self) -> bool {
        self.uploaded.is_empty()
            && self.downloaded.is_empty()
            && self.deleted.is_empty()
            && self.conflicts.is_empty()
            && self.errors.is_empty()
    }
}

/// File stem used as a display title.
fn title_of(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rfind('.') {
        Some(pos) if pos > 0 => file[..pos].to_string(),
        _ => file.to_string(),
    }
}

pub struct SyncEngine<F, R, T> {
    fs: F,
    remote: R,
    transport: T,
    index: FileIndex,
    vault_id: String,
    config: SyncConfig,
    events: Arc<EventBus>,
}

impl<F, R, T> SyncEngine<F, R, T>
where
    F: FileSystem,
    R: RemoteApi,
    T: BlobTransport,
{
    /// Open the engine for a vault already bound to `vault_id`.
    pub async fn open(
        fs: F,
        remote: R,
        transport: T,
        vault_id: impl Into<String>,
        config: SyncConfig,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let index = FileIndex::load(&fs).await?;
        let vault_id = vault_id.into();
        info!(
            "Sync engine opened for vault {} ({} tracked files, device {})",
            vault_id,
            index.len(),
            index.device_id()
        );
        Ok(Self {
            fs,
            remote,
            transport,
            index,
            vault_id,
            config,
            events,
        })
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    pub fn device_id(&self) -> DeviceId {
        self.index.device_id()
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    /// Run a full cycle. Per-action failures are reported, not returned as `Err`.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.events.emit(SyncEvent::CycleStarted { timestamp: Utc::now() });

        let result = self.diff_execute_commit().await;

        match &result {
            Ok(report) => {
                self.events.emit(SyncEvent::CycleCompleted {
                    uploaded: report.uploaded.len(),
                    downloaded: report.downloaded.len(),
                    deleted: report.deleted.len(),
                    conflicts: report.conflicts.len(),
                    errors: report.errors.len(),
                    timestamp: Utc::now(),
                });
                if !report.is_noop() {
                    info!(
                        "Sync cycle: {} up, {} down, {} deleted, {} conflicts, {} errors",
                        report.uploaded.len(),
                        report.downloaded.len(),
                        report.deleted.len(),
                        report.conflicts.len(),
                        report.errors.len()
                    );
                }
            }
            Err(e) => warn!("Sync cycle deferred: {}", e),
        }
        result
    }

    async fn diff_execute_commit(&mut self) -> Result<CycleReport> {
        let actions = self.request_diff().await?;
        if actions.is_empty() {
            debug!("Vault {} is in sync", self.vault_id);
            return Ok(CycleReport::default());
        }
        let report = self.execute(&actions).await;
        self.commit(report).await
    }

    /// Record local edits in the index: new files get ids, changed files get
    /// a clock bump (once per unsynced change).
    pub async fn scan_local_changes(&mut self) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        let mut promoted = false;

        for path in walk_files(&self.fs).await? {
            let is_new = self.index.get_by_path(&path).is_none();
            let id = self.index.get_or_create(&path);
            let hash = ContentHash::of(&self.fs.read(&path).await?);

            // Remote bytes written by a cycle whose commit failed.
            if let Some(base) = self.index.promote_pending_base(id) {
                debug!("Adopted downloaded version {} of {}", base.hash, path);
                promoted = true;
            }

            let Some(entry) = self.index.get(id) else {
                continue;
            };
            let matches_synced = entry.last_synced_hash.as_ref() == Some(&hash);
            let unsynced = entry.has_unsynced_change();

            if matches_synced {
                if unsynced && self.index.discard_local_change(id) {
                    report.reverted.push(path);
                }
                continue;
            }
            if unsynced {
                continue;
            }
            self.index.record_local_change(id);
            if is_new {
                report.added.push(path);
            } else {
                report.modified.push(path);
            }
        }

        for entry in self.index.dangling_entries(&self.fs).await? {
            // Deleted after a download whose commit failed: the delete applies
            // to the downloaded version.
            promoted |= self.index.promote_pending_base(entry.id).is_some();
            report.missing.push(entry.path);
        }

        if promoted
            || !report.added.is_empty()
            || !report.modified.is_empty()
            || !report.reverted.is_empty()
        {
            self.index.save(&self.fs).await?;
        }
        Ok(report)
    }

    /// Fingerprints for every tracked file.
    pub async fn local_fingerprints(&self) -> Result<Vec<LocalFileDto>> {
        let mut files = Vec::with_capacity(self.index.len());
        for entry in self.index.list() {
            let dto = match self.fs.read(&entry.path).await {
                Ok(bytes) => LocalFileDto {
                    file_id: entry.id,
                    title: title_of(&entry.path),
                    size: bytes.len() as u64,
                    content_hash: Some(ContentHash::of(&bytes)),
                    vector_clock: entry.vector_clock.clone(),
                    last_synced_hash: entry.last_synced_hash.clone(),
                    deleted: false,
                    path: entry.path,
                },
                Err(FsError::NotFound(_)) => LocalFileDto {
                    file_id: entry.id,
                    title: title_of(&entry.path),
                    size: 0,
                    content_hash: entry.last_synced_hash.clone(),
                    vector_clock: entry.vector_clock.clone(),
                    last_synced_hash: entry.last_synced_hash.clone(),
                    deleted: true,
                    path: entry.path,
                },
                Err(e) => return Err(e.into()),
            };
            files.push(dto);
        }
        Ok(files)
    }

    /// Scan, fingerprint, and ask the remote what to do.
    pub async fn request_diff(&mut self) -> Result<Vec<SyncActionDto>> {
        let scan = self.scan_local_changes().await?;
        debug!(
            "Scan: {} added, {} modified, {} missing",
            scan.added.len(),
            scan.modified.len(),
            scan.missing.len()
        );

        let request = SyncDiffRequest {
            vault_id: self.vault_id.clone(),
            device_id: self.device_id(),
            local_files: self.local_fingerprints().await?,
        };
        let response = self.remote.diff(&request).await?;
        debug!("Diff returned {} action(s)", response.actions.len());
        Ok(response.actions)
    }

    /// Perform actions without contacting the remote API.
    pub async fn execute(&self, actions: &[SyncActionDto]) -> ExecutionReport {
        Executor::new(&self.fs, &self.transport, self.device_id())
            .execute(&self.index, actions)
            .await
    }

    /// Report outcomes and apply what the remote confirmed to the index.
    pub async fn commit(&mut self, report: ExecutionReport) -> Result<CycleReport> {
        let ExecutionReport {
            completed,
            deleted,
            downloaded_entries,
            conflict_entries,
            errors,
        } = report;

        for failure in &errors {
            self.events.emit(SyncEvent::ActionFailed {
                path: failure.action.path.clone(),
                action: failure.action.action,
                error: failure.error.to_string(),
                timestamp: Utc::now(),
            });
        }

        let mut cycle = CycleReport {
            errors,
            ..CycleReport::default()
        };
        if completed.is_empty() && deleted.is_empty() {
            return Ok(cycle);
        }

        let request = SyncCommitRequest {
            vault_id: self.vault_id.clone(),
            device_id: self.device_id(),
            completed: completed.clone(),
            deleted: deleted.clone(),
            vectorize_enabled: Some(self.config.vectorize_enabled),
        };

        let response = match self.remote.commit(&request).await {
            Ok(response) if response.success => response,
            Ok(_) => {
                self.keep_local_identities(&downloaded_entries, &conflict_entries).await?;
                return Err(RemoteError::api(500, "commit reported failure").into());
            }
            Err(e) => {
                self.keep_local_identities(&downloaded_entries, &conflict_entries).await?;
                return Err(e.into());
            }
        };

        let rejected: HashSet<_> = response.conflicts.iter().map(|c| c.file_id).collect();

        for done in completed
            .iter()
            .filter(|c| c.action == SyncActionKind::Upload && !rejected.contains(&c.file_id))
        {
            self.index
                .record_sync_success(done.file_id, done.content_hash.clone(), done.vector_clock.clone());
            cycle.uploaded.push(done.path.clone());
        }

        for entry in downloaded_entries {
            self.index.adopt_remote(entry.file_id, &entry.path, &entry.clock);
            self.index.record_download(entry.file_id, entry.hash, entry.clock);
            if let Some(original) = entry.displaced_from {
                cycle.conflicts.push(self.report_displaced(original, entry.path.clone()));
            }
            cycle.downloaded.push(entry.path);
        }

        for id in deleted {
            if let Some(entry) = self.index.remove(id) {
                cycle.deleted.push(entry.path);
            }
        }

        for conflict in conflict_entries {
            cycle.conflicts.push(self.apply_conflict(conflict));
        }

        for rejected in response.conflicts {
            if let Some(outcome) = self.fold_back_conflict(rejected).await {
                cycle.conflicts.push(outcome);
            }
        }

        self.index.save(&self.fs).await?;
        Ok(cycle)
    }

    /// Keep both versions: the copy is registered as a new file carrying the
    /// remote clock; the original absorbs the remote clock and is marked as
    /// based on the remote version, plus one local change so it uploads next.
    fn apply_conflict(&mut self, conflict: ConflictEntry) -> ConflictOutcome {
        self.index
            .adopt_remote(conflict.copy_id, &conflict.copy_path, &conflict.remote_clock);
        self.index.record_sync_success(
            conflict.original_id,
            conflict.remote_hash,
            conflict.remote_clock,
        );
        self.index.merge_remote_clock(conflict.original_id, &conflict.merged_clock);
        self.index.record_local_change(conflict.original_id);

        info!("Kept both versions of {} (remote copy: {})", conflict.original_path, conflict.copy_path);
        self.events.emit(SyncEvent::ConflictCreated {
            path: conflict.original_path.clone(),
            conflict_path: conflict.copy_path.clone(),
            timestamp: Utc::now(),
        });
        ConflictOutcome {
            path: conflict.original_path,
            conflict_path: conflict.copy_path,
        }
    }

    /// A remote file landed beside a different local file with the same path.
    fn report_displaced(&self, path: String, conflict_path: String) -> ConflictOutcome {
        info!("Kept both files named {} (remote one saved as {})", path, conflict_path);
        self.events.emit(SyncEvent::ConflictCreated {
            path: path.clone(),
            conflict_path: conflict_path.clone(),
            timestamp: Utc::now(),
        });
        ConflictOutcome { path, conflict_path }
    }

    /// Materialize a commit-time rejection as a local conflict copy.
    ///
    /// If the remote version cannot be fetched the original is left as is; the
    /// next diff sees the concurrent clocks and proposes a conflict again.
    async fn fold_back_conflict(&mut self, rejected: ConflictFileDto) -> Option<ConflictOutcome> {
        let action = SyncActionDto {
            file_id: rejected.file_id,
            path: rejected.path.clone(),
            action: SyncActionKind::Conflict,
            upload_url: None,
            download_url: Some(rejected.download_url),
            conflict_rename: rejected.conflict_rename,
            size: None,
            content_hash: Some(rejected.remote_hash),
            remote_vector_clock: Some(rejected.remote_vector_clock),
        };

        let mut report = self.execute(std::slice::from_ref(&action)).await;
        if let Some(failure) = report.errors.pop() {
            error!(
                "Could not fetch remote version of {} after rejected commit: {}",
                rejected.path, failure.error
            );
            return None;
        }
        let conflict = report.conflict_entries.pop()?;
        Some(self.apply_conflict(conflict))
    }

    /// After a failed commit, register files that are already on disk so the
    /// next scan does not mint duplicate ids for them. Downloaded versions
    /// are kept as pending bases: the next scan adopts them instead of
    /// mistaking the remote bytes for a local edit.
    async fn keep_local_identities(
        &mut self,
        downloaded: &[DownloadedEntry],
        conflicts: &[ConflictEntry],
    ) -> Result<()> {
        for entry in downloaded {
            if self.index.get(entry.file_id).is_none() {
                self.index.adopt_remote(entry.file_id, &entry.path, &entry.clock);
            }
            self.index
                .set_pending_base(entry.file_id, entry.hash.clone(), entry.clock.clone());
        }
        for conflict in conflicts {
            self.index
                .adopt_remote(conflict.copy_id, &conflict.copy_path, &conflict.remote_clock);
        }
        if !downloaded.is_empty() || !conflicts.is_empty() {
            self.index.save(&self.fs).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<F, R, T> CycleRunner for tokio::sync::Mutex<SyncEngine<F, R, T>>
where
    F: FileSystem + 'static,
    R: RemoteApi + 'static,
    T: BlobTransport + 'static,
{
    async fn run_cycle(&self) {
        let mut engine = self.lock().await;
        if let Err(e) = engine.run_cycle().await {
            // Deferred to the next trigger; the index still reflects the last confirmed state.
            debug!("Cycle error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::memory_remote::InMemoryRemote;

    type TestEngine = SyncEngine<Arc<InMemoryFs>, Arc<InMemoryRemote>, Arc<InMemoryRemote>>;

    async fn engine(remote: &Arc<InMemoryRemote>, vault_id: &str) -> (TestEngine, Arc<InMemoryFs>) {
        let fs = Arc::new(InMemoryFs::new());
        let engine = SyncEngine::open(
            Arc::clone(&fs),
            Arc::clone(remote),
            Arc::clone(remote),
            vault_id,
            SyncConfig::default(),
            Arc::new(EventBus::new()),
        )
        .await
        .unwrap();
        (engine, fs)
    }

    #[test]
    fn test_title_is_file_stem() {
        assert_eq!(title_of("notes/Daily Log.md"), "Daily Log");
        assert_eq!(title_of("README"), "README");
        assert_eq!(title_of(".env"), ".env");
    }

    #[tokio::test]
    async fn test_scan_bumps_clock_once_per_unsynced_change() {
        let remote = Arc::new(InMemoryRemote::new());
        let (mut engine, fs) = engine(&remote, "v").await;
        fs.write("a.md", b"one").await.unwrap();

        let scan = engine.scan_local_changes().await.unwrap();
        assert_eq!(scan.added, vec!["a.md".to_string()]);

        fs.write("a.md", b"two").await.unwrap();
        let scan = engine.scan_local_changes().await.unwrap();
        assert!(scan.modified.is_empty());

        let entry = engine.index().get_by_path("a.md").unwrap();
        assert_eq!(entry.vector_clock.get(&engine.device_id().to_string()), 1);
    }

    #[tokio::test]
    async fn test_upload_cycle_then_idle() {
        let remote = Arc::new(InMemoryRemote::new());
        let (mut engine, fs) = engine(&remote, "v").await;
        fs.write("a.md", b"alpha").await.unwrap();
        fs.write("dir/b.md", b"beta").await.unwrap();

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.uploaded.len(), 2);
        assert!(report.errors.is_empty());

        let id = engine.index().get_by_path("a.md").unwrap().id;
        assert_eq!(remote.content("v", id), Some(b"alpha".to_vec()));
        let entry = engine.index().get(id).unwrap();
        assert_eq!(entry.last_synced_hash, Some(ContentHash::of(b"alpha")));

        let commits = remote.commit_calls();
        assert!(engine.request_diff().await.unwrap().is_empty());
        assert!(engine.run_cycle().await.unwrap().is_noop());
        assert_eq!(remote.commit_calls(), commits);
    }

    #[tokio::test]
    async fn test_failed_diff_leaves_sync_state_untouched() {
        let remote = Arc::new(InMemoryRemote::new());
        let (mut engine, fs) = engine(&remote, "v").await;
        fs.write("a.md", b"alpha").await.unwrap();

        remote.fail_next_api_call(RemoteError::Network("offline".into()));
        assert!(matches!(engine.run_cycle().await, Err(SyncError::Remote(_))));
        let entry = engine.index().get_by_path("a.md").unwrap();
        assert!(entry.last_synced_hash.is_none());

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.uploaded, vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_record_success() {
        let remote = Arc::new(InMemoryRemote::new());
        let (mut engine, fs) = engine(&remote, "v").await;
        fs.write("a.md", b"alpha").await.unwrap();

        let actions = engine.request_diff().await.unwrap();
        let report = engine.execute(&actions).await;
        remote.fail_next_api_call(RemoteError::api(503, "unavailable"));
        assert!(engine.commit(report).await.is_err());
        assert!(engine.index().get_by_path("a.md").unwrap().last_synced_hash.is_none());

        // Retried naturally on the next cycle.
        assert_eq!(engine.run_cycle().await.unwrap().uploaded.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_downloaded_identity() {
        let remote = Arc::new(InMemoryRemote::new());
        let (mut origin, origin_fs) = engine(&remote, "v").await;
        origin_fs.write("remote.md", b"from afar").await.unwrap();
        origin.run_cycle().await.unwrap();
        let remote_id = origin.index().get_by_path("remote.md").unwrap().id;

        let (mut engine, fs) = engine(&remote, "v").await;
        let actions = engine.request_diff().await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, SyncActionKind::Download);
        let report = engine.execute(&actions).await;
        remote.fail_next_api_call(RemoteError::Network("connection reset".into()));
        assert!(engine.commit(report).await.is_err());

        assert_eq!(engine.index().get_by_path("remote.md").unwrap().id, remote_id);
        assert_eq!(fs.read("remote.md").await.unwrap(), b"from afar");

        let report = engine.run_cycle().await.unwrap();
        assert!(report.uploaded.is_empty());
        assert_eq!(engine.index().len(), 1);
        let entry = engine.index().get(remote_id).unwrap();
        assert_eq!(entry.last_synced_hash, Some(ContentHash::of(b"from afar")));
        assert!(entry.pending_base.is_none());
        assert!(engine.request_diff().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reverted_edit_drops_its_clock_bump() {
        let remote = Arc::new(InMemoryRemote::new());
        let (mut engine, fs) = engine(&remote, "v").await;
        fs.write("a.md", b"alpha").await.unwrap();
        engine.run_cycle().await.unwrap();
        let synced = engine.index().get_by_path("a.md").unwrap().vector_clock.clone();

        fs.write("a.md", b"draft").await.unwrap();
        assert_eq!(engine.scan_local_changes().await.unwrap().modified.len(), 1);
        fs.write("a.md", b"alpha").await.unwrap();
        let scan = engine.scan_local_changes().await.unwrap();

        assert_eq!(scan.reverted, vec!["a.md".to_string()]);
        assert_eq!(engine.index().get_by_path("a.md").unwrap().vector_clock, synced);
        assert!(engine.run_cycle().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_local_delete_propagates() {
        let remote = Arc::new(InMemoryRemote::new());
        let (mut engine, fs) = engine(&remote, "v").await;
        fs.write("a.md", b"alpha").await.unwrap();
        engine.run_cycle().await.unwrap();
        let id = engine.index().get_by_path("a.md").unwrap().id;

        fs.delete("a.md").await.unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.deleted, vec!["a.md".to_string()]);
        assert!(engine.index().get(id).is_none());
        assert!(remote.file("v", id).unwrap().deleted);
    }
}
