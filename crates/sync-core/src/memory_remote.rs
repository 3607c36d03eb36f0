//! In-memory reference implementation of the remote service.
//!
//! Implements the authoritative side of the protocol so engines can be tested
//! against each other without a network:
//! - diff decisions by content hash and vector clock
//! - tombstones for deleted files
//! - optimistic-lock commits keyed on `expectedHash`
//! - presigned `mem://` URLs backed by a blob map
//! - injectable transfer and API failures

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::content_hash::ContentHash;
use crate::executor::conflict_copy_path;
use crate::index::FileId;
use crate::protocol::{
    ConflictFileDto, CreateVaultRequest, LocalFileDto, RegisterDeviceRequest, SyncActionDto,
    SyncActionKind, SyncCommitRequest, SyncCommitResponse, SyncDiffRequest, SyncDiffResponse,
    VaultDto,
};
use crate::remote::{BlobTransport, RemoteApi, RemoteError, Result};
use crate::vector_clock::{ClockOrdering, VectorClock};
use crate::DeviceId;

const USER_ID: &str = "user-1";

/// Server-side record of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub path: String,
    pub hash: ContentHash,
    pub clock: VectorClock,
    pub size: u64,
    /// Tombstone: deleted by some device, hash/clock are the last live version.
    pub deleted: bool,
}

#[derive(Default)]
struct State {
    vaults: Vec<VaultDto>,
    devices: HashMap<String, Vec<RegisterDeviceRequest>>,
    files: HashMap<String, BTreeMap<FileId, RemoteFile>>,
    blobs: HashMap<String, Vec<u8>>,
    failing_transfers: Vec<String>,
    api_failures: VecDeque<RemoteError>,
    registration_failure: Option<RemoteError>,
    commit_calls: usize,
}

impl State {
    /// Pop a queued failure for the next API call, if any.
    fn take_failure(&mut self) -> Result<()> {
        match self.api_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<State>,
}

fn current_url(vault_id: &str, id: FileId) -> String {
    format!("mem://{}/{}/current", vault_id, id)
}

fn staged_url(vault_id: &str, id: FileId, device: &DeviceId) -> String {
    format!("mem://{}/{}/staged/{}", vault_id, id, device)
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a vault directly, as if another client had made it.
    pub fn seed_vault(&self, name: &str) -> VaultDto {
        let mut state = self.lock();
        let vault = VaultDto {
            id: format!("vault-{}", state.vaults.len() + 1),
            name: name.to_string(),
            user_id: USER_ID.to_string(),
        };
        state.vaults.push(vault.clone());
        vault
    }

    pub fn vaults(&self) -> Vec<VaultDto> {
        self.lock().vaults.clone()
    }

    pub fn devices(&self, vault_id: &str) -> Vec<RegisterDeviceRequest> {
        self.lock().devices.get(vault_id).cloned().unwrap_or_default()
    }

    pub fn file(&self, vault_id: &str, id: FileId) -> Option<RemoteFile> {
        self.lock().files.get(vault_id)?.get(&id).cloned()
    }

    /// Canonical bytes of a live file.
    pub fn content(&self, vault_id: &str, id: FileId) -> Option<Vec<u8>> {
        self.blob(&current_url(vault_id, id))
    }

    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(url).cloned()
    }

    pub fn put_blob(&self, url: &str, content: &[u8]) {
        self.lock().blobs.insert(url.to_string(), content.to_vec());
    }

    /// Make every transfer whose URL contains `pattern` fail with a network error.
    pub fn fail_transfers_matching(&self, pattern: &str) {
        self.lock().failing_transfers.push(pattern.to_string());
    }

    pub fn clear_transfer_failures(&self) {
        self.lock().failing_transfers.clear();
    }

    /// Queue an error returned by the next API call (FIFO).
    pub fn fail_next_api_call(&self, error: RemoteError) {
        self.lock().api_failures.push_back(error);
    }

    /// Fail the next `register_device` call only.
    pub fn fail_next_registration(&self, error: RemoteError) {
        self.lock().registration_failure = Some(error);
    }

    pub fn commit_calls(&self) -> usize {
        self.lock().commit_calls
    }

    fn check_transfer(state: &State, url: &str) -> Result<()> {
        if state.failing_transfers.iter().any(|p| url.contains(p.as_str())) {
            return Err(RemoteError::Network(format!("connection reset: {}", url)));
        }
        Ok(())
    }

    fn action(
        vault_id: &str,
        device: &DeviceId,
        id: FileId,
        path: &str,
        kind: SyncActionKind,
        remote: Option<&RemoteFile>,
    ) -> SyncActionDto {
        let mut action = SyncActionDto {
            file_id: id,
            path: path.to_string(),
            action: kind,
            upload_url: None,
            download_url: None,
            conflict_rename: None,
            size: None,
            content_hash: None,
            remote_vector_clock: None,
        };
        match kind {
            SyncActionKind::Upload => action.upload_url = Some(staged_url(vault_id, id, device)),
            SyncActionKind::Download | SyncActionKind::Conflict => {
                if let Some(remote) = remote {
                    action.download_url = Some(current_url(vault_id, id));
                    action.size = Some(remote.size);
                    action.content_hash = Some(remote.hash.clone());
                    action.remote_vector_clock = Some(remote.clock.clone());
                }
                if kind == SyncActionKind::Conflict {
                    action.conflict_rename = Some(conflict_copy_path(path, device, None));
                }
            }
            SyncActionKind::Delete => {}
        }
        action
    }

    /// Decide what a device must do for one file it reported.
    fn decide(local: &LocalFileDto, remote: Option<&RemoteFile>) -> Option<SyncActionKind> {
        use SyncActionKind::*;

        let unchanged_since_sync =
            local.content_hash.is_some() && local.content_hash == local.last_synced_hash;

        let Some(remote) = remote else {
            // Unknown to the server: new upload, or a never-synced local delete to clear.
            return Some(if local.deleted { Delete } else { Upload });
        };

        if remote.deleted {
            if local.deleted || local.content_hash.as_ref() == Some(&remote.hash) {
                return Some(Delete);
            }
            if unchanged_since_sync && local.last_synced_hash.as_ref() == Some(&remote.hash) {
                return Some(Delete);
            }
            // Edited while another device deleted it: content survives.
            return Some(Upload);
        }

        if local.deleted {
            return Some(if local.last_synced_hash.as_ref() == Some(&remote.hash) {
                Delete
            } else {
                // Changed remotely after this device last saw it: restore it.
                Download
            });
        }

        if local.content_hash.as_ref() == Some(&remote.hash) {
            // Same bytes; a device that never recorded them as synced fetches
            // once so its index catches up.
            return (!unchanged_since_sync).then_some(Download);
        }

        match local.vector_clock.compare(&remote.clock) {
            ClockOrdering::After => Some(Upload),
            ClockOrdering::Before if unchanged_since_sync || local.last_synced_hash.is_none() => {
                Some(Download)
            }
            ClockOrdering::Before | ClockOrdering::Equal | ClockOrdering::Concurrent => {
                Some(Conflict)
            }
        }
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn diff(&self, request: &SyncDiffRequest) -> Result<SyncDiffResponse> {
        let mut state = self.lock();
        state.take_failure()?;

        let vault_id = request.vault_id.as_str();
        let device = request.device_id;
        let empty = BTreeMap::new();
        let files = state.files.get(vault_id).unwrap_or(&empty);

        let mut actions = Vec::new();
        for local in &request.local_files {
            let remote = files.get(&local.file_id);
            if let Some(kind) = Self::decide(local, remote) {
                actions.push(Self::action(vault_id, &device, local.file_id, &local.path, kind, remote));
            }
        }

        let mut unknown: Vec<(&FileId, &RemoteFile)> = files
            .iter()
            .filter(|(id, file)| {
                !file.deleted && !request.local_files.iter().any(|l| l.file_id == **id)
            })
            .collect();
        unknown.sort_by(|a, b| a.1.path.cmp(&b.1.path));
        for (id, file) in unknown {
            actions.push(Self::action(
                vault_id,
                &device,
                *id,
                &file.path,
                SyncActionKind::Download,
                Some(file),
            ));
        }

        debug!("diff for {}: {} action(s)", device, actions.len());
        Ok(SyncDiffResponse { actions })
    }

    async fn commit(&self, request: &SyncCommitRequest) -> Result<SyncCommitResponse> {
        let mut state = self.lock();
        state.take_failure()?;
        state.commit_calls += 1;

        let vault_id = request.vault_id.clone();
        let mut conflicts = Vec::new();
        let mut accepted = Vec::new();

        for done in &request.completed {
            if done.action != SyncActionKind::Upload {
                continue;
            }
            let staged = staged_url(&vault_id, done.file_id, &request.device_id);
            let bytes = state
                .blobs
                .get(&staged)
                .cloned()
                .ok_or_else(|| RemoteError::api(422, format!("no upload staged for {}", done.file_id)))?;
            if ContentHash::of(&bytes) != done.content_hash {
                return Err(RemoteError::api(422, format!("staged content mismatch for {}", done.file_id)));
            }

            let current = state
                .files
                .get(&vault_id)
                .and_then(|files| files.get(&done.file_id))
                .cloned();
            let stale = match &current {
                Some(file) if !file.deleted => done.expected_hash.as_ref() != Some(&file.hash),
                _ => false,
            };

            if let (true, Some(file)) = (stale, &current) {
                debug!("commit rejected for {}: base hash is stale", done.path);
                conflicts.push(ConflictFileDto {
                    file_id: done.file_id,
                    path: file.path.clone(),
                    remote_hash: file.hash.clone(),
                    remote_vector_clock: file.clock.clone(),
                    download_url: current_url(&vault_id, done.file_id),
                    conflict_rename: Some(conflict_copy_path(&file.path, &request.device_id, None)),
                });
                continue;
            }

            let clock = match &current {
                Some(file) => file.clock.merge(&done.vector_clock),
                None => done.vector_clock.clone(),
            };
            accepted.push((done.file_id, bytes, RemoteFile {
                path: done.path.clone(),
                hash: done.content_hash.clone(),
                clock,
                size: done.size,
                deleted: false,
            }));
        }

        for (id, bytes, file) in accepted {
            state.blobs.insert(current_url(&vault_id, id), bytes);
            state.files.entry(vault_id.clone()).or_default().insert(id, file);
        }

        if let Some(files) = state.files.get_mut(&vault_id) {
            for id in &request.deleted {
                if let Some(file) = files.get_mut(id) {
                    file.deleted = true;
                }
            }
        }

        Ok(SyncCommitResponse {
            success: true,
            synced_at: Utc::now(),
            conflicts,
        })
    }

    async fn list_vaults(&self) -> Result<Vec<VaultDto>> {
        let mut state = self.lock();
        state.take_failure()?;
        Ok(state.vaults.clone())
    }

    async fn create_vault(&self, request: &CreateVaultRequest) -> Result<VaultDto> {
        self.lock().take_failure()?;
        Ok(self.seed_vault(&request.name))
    }

    async fn register_device(&self, vault_id: &str, request: &RegisterDeviceRequest) -> Result<()> {
        let mut state = self.lock();
        state.take_failure()?;
        if let Some(err) = state.registration_failure.take() {
            return Err(err);
        }
        if !state.vaults.iter().any(|v| v.id == vault_id) {
            return Err(RemoteError::api(404, format!("vault {} not found", vault_id)));
        }
        let devices = state.devices.entry(vault_id.to_string()).or_default();
        if !devices.iter().any(|d| d.device_id == request.device_id) {
            devices.push(request.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl BlobTransport for InMemoryRemote {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let state = self.lock();
        Self::check_transfer(&state, url)?;
        state
            .blobs
            .get(url)
            .cloned()
            .ok_or_else(|| RemoteError::api(404, format!("no blob at {}", url)))
    }

    async fn put(&self, url: &str, content: &[u8]) -> Result<()> {
        let mut state = self.lock();
        Self::check_transfer(&state, url)?;
        state.blobs.insert(url.to_string(), content.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(hash: &[u8], synced: Option<&[u8]>, clock: &[(&str, u64)]) -> LocalFileDto {
        LocalFileDto {
            file_id: FileId::new(),
            path: "a.md".into(),
            title: "a".into(),
            size: hash.len() as u64,
            content_hash: Some(ContentHash::of(hash)),
            vector_clock: clock.iter().map(|(k, v)| (*k, *v)).collect(),
            last_synced_hash: synced.map(ContentHash::of),
            deleted: false,
        }
    }

    fn remote(hash: &[u8], clock: &[(&str, u64)]) -> RemoteFile {
        RemoteFile {
            path: "a.md".into(),
            hash: ContentHash::of(hash),
            clock: clock.iter().map(|(k, v)| (*k, *v)).collect(),
            size: hash.len() as u64,
            deleted: false,
        }
    }

    #[test]
    fn test_decision_table() {
        use SyncActionKind::*;
        let decide = InMemoryRemote::decide;

        assert_eq!(decide(&local(b"x", None, &[("a", 1)]), None), Some(Upload));
        assert_eq!(decide(&local(b"x", Some(b"x"), &[("a", 1)]), Some(&remote(b"x", &[("a", 1)]))), None);
        assert_eq!(decide(&local(b"x", None, &[("a", 1)]), Some(&remote(b"x", &[("a", 1)]))), Some(Download));
        assert_eq!(
            decide(&local(b"new", Some(b"old"), &[("a", 2)]), Some(&remote(b"old", &[("a", 1)]))),
            Some(Upload)
        );
        assert_eq!(
            decide(&local(b"old", Some(b"old"), &[("a", 1)]), Some(&remote(b"new", &[("a", 1), ("b", 1)]))),
            Some(Download)
        );
        assert_eq!(
            decide(&local(b"mine", Some(b"base"), &[("a", 2), ("b", 1)]), Some(&remote(b"theirs", &[("a", 1), ("b", 2)]))),
            Some(Conflict)
        );
        // Same clock, different bytes: never silently pick one.
        assert_eq!(
            decide(&local(b"one", Some(b"base"), &[("a", 1)]), Some(&remote(b"two", &[("a", 1)]))),
            Some(Conflict)
        );
    }

    #[test]
    fn test_deletion_decisions() {
        use SyncActionKind::*;
        let decide = InMemoryRemote::decide;

        let mut gone = local(b"x", Some(b"x"), &[("a", 1)]);
        gone.deleted = true;
        assert_eq!(decide(&gone, Some(&remote(b"x", &[("a", 1)]))), Some(Delete));
        // Remote moved on while we deleted: remote wins.
        assert_eq!(decide(&gone, Some(&remote(b"y", &[("a", 1), ("b", 1)]))), Some(Download));

        let mut tomb = remote(b"x", &[("a", 1)]);
        tomb.deleted = true;
        assert_eq!(decide(&local(b"x", Some(b"x"), &[("a", 1)]), Some(&tomb)), Some(Delete));
        assert_eq!(decide(&local(b"edited", Some(b"x"), &[("a", 1), ("b", 1)]), Some(&tomb)), Some(Upload));
    }

    #[tokio::test]
    async fn test_api_failure_queue() {
        let remote = InMemoryRemote::new();
        remote.fail_next_api_call(RemoteError::Network("offline".into()));
        assert!(remote.list_vaults().await.is_err());
        assert!(remote.list_vaults().await.unwrap().is_empty());
    }
}
