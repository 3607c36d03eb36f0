//! FileIndex: this device's persistent table of file identities and sync state.
//!
//! Stored as JSON at `.sync/file-index.json`. Keyed by [`FileId`]; the
//! path lookup is a projection rebuilt on load and kept in step with every
//! mutation, never a separate source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::content_hash::ContentHash;
use crate::fs::{FileSystem, FsError, SYNC_DIR};
use crate::vector_clock::{ClockOrdering, VectorClock};
use crate::DeviceId;

/// Location of the index inside the vault.
pub const INDEX_FILE: &str = ".sync/file-index.json";

/// Current on-disk format version.
pub const INDEX_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported file index version {0}")]
    UnsupportedVersion(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Stable identity of a logical file. Survives renames; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id received from the remote or a legacy index.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity and sync state for one logical file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: FileId,
    /// Current vault-relative location.
    pub path: String,
    pub created_at: DateTime<Utc>,
    /// This device's current causal version of the file.
    pub vector_clock: VectorClock,
    /// Hash as of the last confirmed sync; `None` if never synced.
    pub last_synced_hash: Option<ContentHash>,
    /// Clock at the last confirmed sync. Always before-or-equal `vector_clock`.
    pub last_synced_clock: VectorClock,
    /// Remote content written to disk by a cycle whose commit never came back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_base: Option<SyncBase>,
}

/// A remote version (hash and clock) this device holds on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBase {
    pub hash: ContentHash,
    pub clock: VectorClock,
}

impl FileEntry {
    fn new(id: FileId, path: &str) -> Self {
        Self {
            id,
            path: path.to_string(),
            created_at: Utc::now(),
            vector_clock: VectorClock::new(),
            last_synced_hash: None,
            last_synced_clock: VectorClock::new(),
            pending_base: None,
        }
    }

    /// Whether a local edit has been recorded since the last confirmed sync.
    pub fn has_unsynced_change(&self) -> bool {
        self.vector_clock.compare(&self.last_synced_clock) == ClockOrdering::After
    }
}

/// Persisted form. Field order is the on-disk order.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    version: u32,
    device_id: DeviceId,
    files: Vec<FileEntry>,
}

/// Version 1 entries predate vector clocks.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEntryV1 {
    id: FileId,
    path: String,
    created_at: Option<DateTime<Utc>>,
    last_synced_hash: Option<ContentHash>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyIndexV1 {
    device_id: Option<DeviceId>,
    files: Vec<LegacyEntryV1>,
}

/// Per-vault table of [`FileEntry`] records.
#[derive(Debug, Clone)]
pub struct FileIndex {
    device_id: DeviceId,
    files: HashMap<FileId, FileEntry>,
    by_path: HashMap<String, FileId>,
}

impl FileIndex {
    /// Create an empty index owned by `device_id`.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            files: HashMap::new(),
            by_path: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Id for `path`, assigning a fresh one if the path is unseen.
    pub fn get_or_create(&mut self, path: &str) -> FileId {
        if let Some(id) = self.by_path.get(path) {
            return *id;
        }
        let id = FileId::new();
        debug!("Assigned file id {} to {}", id, path);
        self.insert(FileEntry::new(id, path));
        id
    }

    /// Register a file first seen through the remote, keeping the remote's id.
    ///
    /// If the id is already tracked its entry is kept and moved to `path`.
    pub fn adopt_remote(&mut self, id: FileId, path: &str, clock: &VectorClock) -> &FileEntry {
        if self.files.contains_key(&id) {
            self.rename(id, path);
        } else {
            let mut entry = FileEntry::new(id, path);
            entry.vector_clock = clock.clone();
            self.insert(entry);
        }
        &self.files[&id]
    }

    /// Bump this device's counter for `id`. Returns the new clock, or `None`
    /// if the id is unknown.
    pub fn record_local_change(&mut self, id: FileId) -> Option<VectorClock> {
        let entry = self.files.get_mut(&id)?;
        entry.vector_clock = entry.vector_clock.increment(&self.device_id);
        Some(entry.vector_clock.clone())
    }

    /// Fold a remote clock into the entry's current clock.
    pub fn merge_remote_clock(&mut self, id: FileId, remote: &VectorClock) -> Option<VectorClock> {
        let entry = self.files.get_mut(&id)?;
        entry.vector_clock = entry.vector_clock.merge(remote);
        Some(entry.vector_clock.clone())
    }

    /// Record a sync the remote has confirmed.
    ///
    /// The current clock absorbs `clock`, so `last_synced_clock` can never
    /// run ahead of `vector_clock`. Unknown ids are ignored.
    pub fn record_sync_success(&mut self, id: FileId, hash: ContentHash, clock: VectorClock) {
        let Some(entry) = self.files.get_mut(&id) else {
            warn!("Sync success for untracked file id {}", id);
            return;
        };
        entry.vector_clock = entry.vector_clock.merge(&clock);
        entry.last_synced_hash = Some(hash);
        entry.last_synced_clock = clock;
        entry.pending_base = None;
    }

    /// Record that the file on disk is exactly the remote version `clock`.
    ///
    /// Unlike [`record_sync_success`](Self::record_sync_success) the current
    /// clock is replaced: counters this device bumped for bytes it no longer
    /// holds were never shared and must not outlive the download.
    pub fn record_download(&mut self, id: FileId, hash: ContentHash, clock: VectorClock) {
        let Some(entry) = self.files.get_mut(&id) else {
            warn!("Download recorded for untracked file id {}", id);
            return;
        };
        entry.vector_clock = clock.clone();
        entry.last_synced_hash = Some(hash);
        entry.last_synced_clock = clock;
        entry.pending_base = None;
    }

    /// Remember a downloaded version whose commit failed. The next scan
    /// promotes it with [`promote_pending_base`](Self::promote_pending_base).
    pub fn set_pending_base(&mut self, id: FileId, hash: ContentHash, clock: VectorClock) -> bool {
        match self.files.get_mut(&id) {
            Some(entry) => {
                entry.pending_base = Some(SyncBase { hash, clock });
                true
            }
            None => false,
        }
    }

    /// Adopt a pending base as the synced state. Returns the base, if any.
    pub fn promote_pending_base(&mut self, id: FileId) -> Option<SyncBase> {
        let base = self.files.get_mut(&id)?.pending_base.take()?;
        self.record_download(id, base.hash.clone(), base.clock.clone());
        Some(base)
    }

    /// Drop an unsynced clock bump whose edit was reverted on disk.
    pub fn discard_local_change(&mut self, id: FileId) -> bool {
        match self.files.get_mut(&id) {
            Some(entry) if entry.has_unsynced_change() => {
                entry.vector_clock = entry.last_synced_clock.clone();
                true
            }
            _ => false,
        }
    }

    /// Move an entry to a new path, keeping its id.
    ///
    /// Refused if another file already owns `new_path`.
    pub fn rename(&mut self, id: FileId, new_path: &str) -> bool {
        if let Some(owner) = self.by_path.get(new_path) {
            if *owner != id {
                warn!("Cannot move {} to {}: path belongs to {}", id, new_path, owner);
                return false;
            }
        }
        let Some(entry) = self.files.get_mut(&id) else {
            return false;
        };
        if entry.path != new_path {
            self.by_path.remove(&entry.path);
            entry.path = new_path.to_string();
        }
        self.by_path.insert(new_path.to_string(), id);
        true
    }

    pub fn remove(&mut self, id: FileId) -> Option<FileEntry> {
        let entry = self.files.remove(&id)?;
        if self.by_path.get(&entry.path) == Some(&id) {
            self.by_path.remove(&entry.path);
        }
        Some(entry)
    }

    pub fn get(&self, id: FileId) -> Option<&FileEntry> {
        self.files.get(&id)
    }

    pub fn get_by_path(&self, path: &str) -> Option<&FileEntry> {
        self.by_path.get(path).and_then(|id| self.files.get(id))
    }

    /// All entries, ordered by path.
    pub fn list(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self.files.values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Entries whose file no longer exists on disk.
    pub async fn dangling_entries<F: FileSystem + ?Sized>(&self, fs: &F) -> Result<Vec<FileEntry>> {
        let mut dangling = Vec::new();
        for entry in self.list() {
            if !fs.exists(&entry.path).await? {
                dangling.push(entry);
            }
        }
        Ok(dangling)
    }

    fn insert(&mut self, entry: FileEntry) {
        if let Some(previous) = self.by_path.insert(entry.path.clone(), entry.id) {
            if previous != entry.id {
                warn!("Path {} reassigned from {} to {}", entry.path, previous, entry.id);
            }
        }
        self.files.insert(entry.id, entry);
    }

    fn from_entries(device_id: DeviceId, entries: Vec<FileEntry>) -> Self {
        let mut index = Self::new(device_id);
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    /// Load the vault's index, creating a new one (with a fresh device id) if
    /// none exists. Legacy formats are migrated and written back in place.
    pub async fn load<F: FileSystem + ?Sized>(fs: &F) -> Result<Self> {
        if !fs.exists(INDEX_FILE).await? {
            let index = Self::new(DeviceId::generate());
            info!("Created file index for device {}", index.device_id);
            index.save(fs).await?;
            return Ok(index);
        }

        let bytes = fs.read(INDEX_FILE).await?;
        let (index, migrated_from) = Self::decode(&bytes)?;
        if let Some(version) = migrated_from {
            info!(
                "Migrated file index from version {} to {} ({} files)",
                version,
                INDEX_VERSION,
                index.len()
            );
            index.save(fs).await?;
        }
        Ok(index)
    }

    /// Write the index to `.sync/file-index.json`.
    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F) -> Result<()> {
        fs.mkdir(SYNC_DIR).await?;
        fs.write(INDEX_FILE, &self.encode()?).await?;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let file = IndexFile {
            version: INDEX_VERSION,
            device_id: self.device_id,
            files: self.list(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    /// Decode any supported format. Returns the legacy version number when a
    /// migration was applied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, Option<u32>)> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let version = match raw.get("version") {
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| IndexError::UnsupportedVersion(v.to_string()))?,
            None => 0,
        };

        match version {
            INDEX_VERSION => {
                let file: IndexFile = serde_json::from_value(raw)?;
                Ok((Self::from_entries(file.device_id, file.files), None))
            }
            1 => {
                let legacy: LegacyIndexV1 = serde_json::from_value(raw)?;
                let device_id = legacy.device_id.unwrap_or_else(DeviceId::generate);
                let entries = legacy
                    .files
                    .into_iter()
                    .map(|old| FileEntry {
                        created_at: old.created_at.unwrap_or_else(Utc::now),
                        last_synced_hash: old.last_synced_hash,
                        ..FileEntry::new(old.id, &old.path)
                    })
                    .collect();
                Ok((Self::from_entries(device_id, entries), Some(1)))
            }
            0 => {
                // Bare `path -> id` map written before the index was versioned.
                let map: HashMap<String, String> = serde_json::from_value(raw)?;
                let mut entries = Vec::with_capacity(map.len());
                for (path, id) in map {
                    match FileId::parse(&id) {
                        Ok(id) => entries.push(FileEntry::new(id, &path)),
                        Err(e) => warn!("Dropping legacy entry {} with bad id {}: {}", path, id, e),
                    }
                }
                Ok((Self::from_entries(DeviceId::generate(), entries), Some(0)))
            }
            other => Err(IndexError::UnsupportedVersion(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    fn device() -> DeviceId {
        "00000000000000d1".parse().unwrap()
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let mut index = FileIndex::new(device());
        let a = index.get_or_create("notes/a.md");
        assert_eq!(index.get_or_create("notes/a.md"), a);
        assert_ne!(index.get_or_create("notes/b.md"), a);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_recreated_path_gets_new_id() {
        let mut index = FileIndex::new(device());
        let first = index.get_or_create("a.md");
        index.remove(first);
        let second = index.get_or_create("a.md");
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_id_never_panics() {
        let mut index = FileIndex::new(device());
        let ghost = FileId::new();
        assert!(index.record_local_change(ghost).is_none());
        assert!(index.remove(ghost).is_none());
        assert!(!index.rename(ghost, "x.md"));
        index.record_sync_success(ghost, ContentHash::of(b"x"), VectorClock::new());
        assert!(index.is_empty());
    }

    #[test]
    fn test_local_change_bumps_own_counter_only() {
        let mut index = FileIndex::new(device());
        let id = index.get_or_create("a.md");
        let remote: VectorClock = [("00000000000000e2", 3)].into_iter().collect();
        index.merge_remote_clock(id, &remote);

        let clock = index.record_local_change(id).unwrap();
        assert_eq!(clock.get("00000000000000d1"), 1);
        assert_eq!(clock.get("00000000000000e2"), 3);
        assert!(index.get(id).unwrap().has_unsynced_change());
    }

    #[test]
    fn test_sync_success_keeps_clock_invariant() {
        let mut index = FileIndex::new(device());
        let id = index.get_or_create("a.md");
        let ahead: VectorClock = [("00000000000000e2", 5)].into_iter().collect();

        index.record_sync_success(id, ContentHash::of(b"a"), ahead.clone());

        let entry = index.get(id).unwrap();
        assert_eq!(entry.last_synced_clock, ahead);
        assert!(entry.last_synced_clock.compare(&entry.vector_clock).is_before_or_equal());
        assert!(!entry.has_unsynced_change());
    }

    #[test]
    fn test_rename_keeps_id_and_path_projection() {
        let mut index = FileIndex::new(device());
        let id = index.get_or_create("old.md");
        assert!(index.rename(id, "dir/new.md"));

        assert!(index.get_by_path("old.md").is_none());
        assert_eq!(index.get_by_path("dir/new.md").unwrap().id, id);
        assert_eq!(index.get_or_create("dir/new.md"), id);
    }

    #[test]
    fn test_rename_onto_taken_path_is_refused() {
        let mut index = FileIndex::new(device());
        let a = index.get_or_create("a.md");
        let b = index.get_or_create("b.md");

        assert!(!index.rename(a, "b.md"));
        assert_eq!(index.get_by_path("a.md").unwrap().id, a);
        assert_eq!(index.get_by_path("b.md").unwrap().id, b);
    }

    #[test]
    fn test_download_replaces_unshared_local_bumps() {
        let mut index = FileIndex::new(device());
        let id = index.get_or_create("a.md");
        index.record_local_change(id);
        let remote: VectorClock = [("00000000000000e2", 3)].into_iter().collect();

        index.record_download(id, ContentHash::of(b"remote"), remote.clone());

        let entry = index.get(id).unwrap();
        assert_eq!(entry.vector_clock, remote);
        assert_eq!(entry.last_synced_clock, remote);
        assert!(!entry.has_unsynced_change());
    }

    #[test]
    fn test_reverted_change_is_discarded() {
        let mut index = FileIndex::new(device());
        let id = index.get_or_create("a.md");
        let clock = index.record_local_change(id).unwrap();
        index.record_sync_success(id, ContentHash::of(b"a"), clock);
        let synced = index.get(id).unwrap().last_synced_clock.clone();

        index.record_local_change(id);
        assert!(index.discard_local_change(id));
        assert_eq!(index.get(id).unwrap().vector_clock, synced);
        assert!(!index.discard_local_change(id));
    }

    #[tokio::test]
    async fn test_pending_base_survives_reload_and_promotes() {
        let fs = InMemoryFs::new();
        let mut index = FileIndex::load(&fs).await.unwrap();
        let id = index.get_or_create("a.md");
        let remote: VectorClock = [("00000000000000e2", 2)].into_iter().collect();
        assert!(index.set_pending_base(id, ContentHash::of(b"v2"), remote.clone()));
        index.save(&fs).await.unwrap();

        let mut index = FileIndex::load(&fs).await.unwrap();
        let base = index.promote_pending_base(id).unwrap();
        assert_eq!(base.hash, ContentHash::of(b"v2"));

        let entry = index.get(id).unwrap();
        assert_eq!(entry.last_synced_hash, Some(ContentHash::of(b"v2")));
        assert_eq!(entry.vector_clock, remote);
        assert!(entry.pending_base.is_none());
        assert!(index.promote_pending_base(id).is_none());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let fs = InMemoryFs::new();
        let mut index = FileIndex::new(device());
        let a = index.get_or_create("a.md");
        index.record_local_change(a);
        index.record_sync_success(a, ContentHash::of(b"a"), index.get(a).unwrap().vector_clock.clone());
        let b = index.get_or_create("sub/b.md");
        index.record_local_change(b);
        index.save(&fs).await.unwrap();

        let loaded = FileIndex::load(&fs).await.unwrap();
        assert_eq!(loaded.device_id(), device());
        assert_eq!(loaded.list(), index.list());
    }

    #[tokio::test]
    async fn test_load_creates_index_with_stable_device_id() {
        let fs = InMemoryFs::new();
        let first = FileIndex::load(&fs).await.unwrap();
        let second = FileIndex::load(&fs).await.unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert!(fs.exists(INDEX_FILE).await.unwrap());
    }

    #[tokio::test]
    async fn test_v1_index_migrates_in_place() {
        let fs = InMemoryFs::new();
        let id = FileId::new();
        let legacy = serde_json::json!({
            "version": 1,
            "deviceId": "00000000000000d1",
            "files": [
                { "id": id, "path": "a.md", "lastSyncedHash": ContentHash::of(b"a") }
            ]
        });
        fs.write(INDEX_FILE, legacy.to_string().as_bytes()).await.unwrap();

        let index = FileIndex::load(&fs).await.unwrap();
        let entry = index.get(id).unwrap();
        assert_eq!(index.device_id(), device());
        assert_eq!(entry.path, "a.md");
        assert_eq!(entry.last_synced_hash, Some(ContentHash::of(b"a")));
        assert!(entry.vector_clock.is_empty());

        // Written back in the current format
        let raw: serde_json::Value =
            serde_json::from_slice(&fs.read(INDEX_FILE).await.unwrap()).unwrap();
        assert_eq!(raw["version"], INDEX_VERSION);
    }

    #[test]
    fn test_v0_path_map_migrates_all_pairs() {
        let a = FileId::new();
        let b = FileId::new();
        let legacy = serde_json::json!({ "a.md": a.to_string(), "x/b.md": b.to_string() });

        let (index, migrated) = FileIndex::decode(legacy.to_string().as_bytes()).unwrap();
        assert_eq!(migrated, Some(0));
        assert_eq!(index.get_by_path("a.md").unwrap().id, a);
        assert_eq!(index.get_by_path("x/b.md").unwrap().id, b);
    }

    #[test]
    fn test_future_version_is_rejected() {
        let raw = br#"{"version": 99, "deviceId": "00000000000000d1", "files": []}"#;
        assert!(matches!(
            FileIndex::decode(raw),
            Err(IndexError::UnsupportedVersion(v)) if v == "99"
        ));
    }

    #[test]
    fn test_out_of_range_or_non_numeric_version_is_rejected() {
        // 2^32 + 2 must not wrap around to the current version.
        let raw = br#"{"version": 4294967298, "deviceId": "00000000000000d1", "files": []}"#;
        assert!(matches!(
            FileIndex::decode(raw),
            Err(IndexError::UnsupportedVersion(v)) if v == "4294967298"
        ));

        let raw = br#"{"version": "2", "deviceId": "00000000000000d1", "files": []}"#;
        assert!(matches!(
            FileIndex::decode(raw),
            Err(IndexError::UnsupportedVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_dangling_entries_reported() {
        let fs = InMemoryFs::new();
        fs.write("present.md", b"here").await.unwrap();
        let mut index = FileIndex::new(device());
        index.get_or_create("present.md");
        let gone = index.get_or_create("gone.md");

        let dangling = index.dangling_entries(&fs).await.unwrap();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].id, gone);
    }
}
