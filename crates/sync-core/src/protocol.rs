//! Wire types for the two-phase diff/commit protocol and vault binding.
//!
//! All bodies are JSON with camelCase field names.
//!
//! 1. `POST diff`: the client reports a fingerprint for every tracked file and
//!    receives one [`SyncActionDto`] per file that needs work.
//! 2. The client executes the actions locally.
//! 3. `POST commit`: the client reports outcomes. Uploads carry the hash they
//!    were based on; stale ones come back as [`ConflictFileDto`]s instead of
//!    failing the commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content_hash::ContentHash;
use crate::index::FileId;
use crate::vector_clock::VectorClock;
use crate::DeviceId;

/// Fingerprint of one tracked file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileDto {
    pub file_id: FileId,
    pub path: String,
    /// Display title (file stem).
    pub title: String,
    pub size: u64,
    /// Hash of the bytes currently on disk; for a deleted file, the last hash seen.
    pub content_hash: Option<ContentHash>,
    pub vector_clock: VectorClock,
    /// Hash this device last confirmed with the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_hash: Option<ContentHash>,
    /// The file is tracked but was removed locally.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiffRequest {
    pub vault_id: String,
    pub device_id: DeviceId,
    pub local_files: Vec<LocalFileDto>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncActionKind {
    Upload,
    Download,
    Delete,
    Conflict,
}

/// Remote's instruction for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncActionDto {
    pub file_id: FileId,
    pub path: String,
    pub action: SyncActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Target path for the conflict copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_rename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Remote's current hash (download/conflict).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_vector_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiffResponse {
    #[serde(default)]
    pub actions: Vec<SyncActionDto>,
}

/// One executed action reported at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedFile {
    pub file_id: FileId,
    pub path: String,
    pub action: SyncActionKind,
    pub content_hash: ContentHash,
    pub size: u64,
    pub vector_clock: VectorClock,
    /// Hash the client believed was canonical before uploading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<ContentHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCommitRequest {
    pub vault_id: String,
    pub device_id: DeviceId,
    pub completed: Vec<CompletedFile>,
    pub deleted: Vec<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vectorize_enabled: Option<bool>,
}

/// An upload the remote rejected because its base version was stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictFileDto {
    pub file_id: FileId,
    pub path: String,
    /// Remote's current (winning) hash.
    pub remote_hash: ContentHash,
    pub remote_vector_clock: VectorClock,
    /// Where to fetch the remote version.
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_rename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCommitResponse {
    pub success: bool,
    pub synced_at: DateTime<Utc>,
    #[serde(default)]
    pub conflicts: Vec<ConflictFileDto>,
}

/// A vault record as listed by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultDto {
    pub id: String,
    pub name: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVaultRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub device_id: DeviceId,
    pub device_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_format() {
        let action = SyncActionDto {
            file_id: FileId::new(),
            path: "a.md".into(),
            action: SyncActionKind::Download,
            upload_url: None,
            download_url: Some("https://blob/a".into()),
            conflict_rename: None,
            size: Some(3),
            content_hash: None,
            remote_vector_clock: None,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "download");
        assert_eq!(json["downloadUrl"], "https://blob/a");
        assert!(json.get("uploadUrl").is_none());
    }

    #[test]
    fn test_commit_response_without_conflicts() {
        let body = r#"{"success": true, "syncedAt": "2026-01-02T03:04:05Z"}"#;
        let response: SyncCommitResponse = serde_json::from_str(body).unwrap();
        assert!(response.success);
        assert!(response.conflicts.is_empty());
    }

    #[test]
    fn test_local_file_omits_default_flags() {
        let dto = LocalFileDto {
            file_id: FileId::new(),
            path: "a.md".into(),
            title: "a".into(),
            size: 1,
            content_hash: Some(ContentHash::of(b"a")),
            vector_clock: VectorClock::new(),
            last_synced_hash: None,
            deleted: false,
        };
        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("deleted").is_none());
        assert_eq!(json["contentHash"], ContentHash::of(b"a").as_str());
    }
}
