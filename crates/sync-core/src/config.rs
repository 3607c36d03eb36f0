//! Tunables for one vault sync session.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session configuration. Every field has a default, so partial JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Quiet period before a sync cycle fires.
    #[serde(with = "millis")]
    pub sync_debounce: Duration,
    /// Quiet period per file before a reindex request fires.
    #[serde(with = "millis")]
    pub reindex_debounce: Duration,
    /// Files larger than this are never scheduled for reindexing.
    pub max_reindex_bytes: u64,
    /// Binding retry delay is `binding_retry_base × attempt`.
    #[serde(with = "millis")]
    pub binding_retry_base: Duration,
    /// Attempts before binding is abandoned.
    pub binding_max_attempts: u32,
    /// Forwarded on commit so the remote schedules semantic indexing.
    pub vectorize_enabled: bool,
    /// Name this device registers under.
    pub device_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_debounce: Duration::from_millis(200),
            reindex_debounce: Duration::from_secs(2),
            max_reindex_bytes: 1024 * 1024,
            binding_retry_base: Duration::from_secs(1),
            binding_max_attempts: 5,
            vectorize_enabled: false,
            device_name: "sync-daemon".to_string(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
