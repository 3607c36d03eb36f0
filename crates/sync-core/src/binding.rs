//! Associates a local vault folder with a remote vault record.
//!
//! Binding lists the remote vaults and binds to a name match, or else creates
//! a vault. It then registers this device. The record is written to
//! `.sync/binding.json` as soon as the vault id is known and rewritten once
//! the device is registered, so a restart resumes instead of creating a
//! second remote vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SyncEvent};
use crate::fs::{FileSystem, FsError, SYNC_DIR};
use crate::protocol::{CreateVaultRequest, RegisterDeviceRequest};
use crate::remote::{RemoteApi, RemoteError};
use crate::DeviceId;

pub const BINDING_FILE: &str = ".sync/binding.json";
pub const BINDING_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported binding record version {0}")]
    UnsupportedVersion(u32),

    #[error("Binding abandoned after {attempts} attempt(s): {reason}")]
    Abandoned { attempts: u32, reason: String },
}

impl BindingError {
    /// Only remote failures of the retryable class are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            BindingError::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BindingError>;

/// Persisted association between a local folder and a remote vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingRecord {
    pub version: u32,
    pub local_path: String,
    pub vault_id: String,
    pub vault_name: String,
    pub bound_at: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub device_registered: bool,
}

impl BindingRecord {
    /// Load the record, or `None` if this folder was never bound.
    pub async fn load<F: FileSystem + ?Sized>(fs: &F) -> Result<Option<Self>> {
        let bytes = match fs.read(BINDING_FILE).await {
            Ok(bytes) => bytes,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: Self = serde_json::from_slice(&bytes)?;
        if record.version > BINDING_VERSION {
            return Err(BindingError::UnsupportedVersion(record.version));
        }
        Ok(Some(record))
    }

    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F) -> Result<()> {
        fs.mkdir(SYNC_DIR).await?;
        fs.write(BINDING_FILE, &serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingState {
    Unbound,
    Bound { vault_id: String },
    RetryScheduled { attempt: u32, delay: Duration },
    Abandoned { reason: String },
}

pub struct AutoBinder<F, R> {
    fs: F,
    remote: R,
    events: Arc<EventBus>,
    device_id: DeviceId,
    device_name: String,
    retry_base: Duration,
    max_attempts: u32,
    state: Mutex<BindingState>,
}

impl<F, R> AutoBinder<F, R>
where
    F: FileSystem,
    R: RemoteApi,
{
    pub fn new(fs: F, remote: R, events: Arc<EventBus>, device_id: DeviceId) -> Self {
        Self {
            fs,
            remote,
            events,
            device_id,
            device_name: "sync-daemon".to_string(),
            retry_base: Duration::from_secs(1),
            max_attempts: 5,
            state: Mutex::new(BindingState::Unbound),
        }
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Delay before retry `n` is `base × n`.
    pub fn with_retry(mut self, base: Duration, max_attempts: u32) -> Self {
        self.retry_base = base;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn state(&self) -> BindingState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: BindingState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Bind `local_path` to the remote vault named `vault_name`, retrying
    /// transient failures. An abandoned binding is also published on the bus.
    pub async fn ensure_bound(&self, vault_name: &str, local_path: &str) -> Result<BindingRecord> {
        if let Some(record) = BindingRecord::load(&self.fs).await? {
            if record.device_registered {
                debug!("Vault already bound to {}", record.vault_id);
                self.set_state(BindingState::Bound {
                    vault_id: record.vault_id.clone(),
                });
                return Ok(record);
            }
        }

        let mut attempt = 1;
        loop {
            match self.try_bind(vault_name, local_path).await {
                Ok(record) => {
                    info!("Bound {} to remote vault {} ({})", local_path, record.vault_name, record.vault_id);
                    self.set_state(BindingState::Bound {
                        vault_id: record.vault_id.clone(),
                    });
                    return Ok(record);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.retry_base * attempt;
                    warn!(
                        "Binding attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    self.set_state(BindingState::RetryScheduled { attempt, delay });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(self.abandon(vault_name, attempt, e)),
            }
        }
    }

    async fn try_bind(&self, vault_name: &str, local_path: &str) -> Result<BindingRecord> {
        let mut record = match BindingRecord::load(&self.fs).await? {
            // Vault chosen on an earlier run; only registration is missing.
            Some(record) => record,
            None => {
                let vaults = self.remote.list_vaults().await?;
                let vault = match vaults.into_iter().find(|v| v.name == vault_name) {
                    Some(vault) => vault,
                    None => {
                        info!("No remote vault named {}; creating it", vault_name);
                        self.remote
                            .create_vault(&CreateVaultRequest {
                                name: vault_name.to_string(),
                            })
                            .await?
                    }
                };
                let record = BindingRecord {
                    version: BINDING_VERSION,
                    local_path: local_path.to_string(),
                    vault_id: vault.id,
                    vault_name: vault.name,
                    bound_at: Utc::now(),
                    user_id: Some(vault.user_id),
                    device_registered: false,
                };
                record.save(&self.fs).await?;
                record
            }
        };

        self.remote
            .register_device(
                &record.vault_id,
                &RegisterDeviceRequest {
                    device_id: self.device_id,
                    device_name: self.device_name.clone(),
                },
            )
            .await?;
        record.device_registered = true;
        record.save(&self.fs).await?;
        Ok(record)
    }

    fn abandon(&self, vault_name: &str, attempts: u32, cause: BindingError) -> BindingError {
        let reason = cause.to_string();
        warn!("Giving up binding vault {}: {}", vault_name, reason);
        self.set_state(BindingState::Abandoned {
            reason: reason.clone(),
        });
        self.events.emit(SyncEvent::BindingAbandoned {
            vault_name: vault_name.to_string(),
            attempts,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        BindingError::Abandoned { attempts, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::memory_remote::InMemoryRemote;

    fn binder(
        fs: &Arc<InMemoryFs>,
        remote: &Arc<InMemoryRemote>,
        events: Arc<EventBus>,
    ) -> AutoBinder<Arc<InMemoryFs>, Arc<InMemoryRemote>> {
        AutoBinder::new(Arc::clone(fs), Arc::clone(remote), events, DeviceId::from(0xabc))
            .with_device_name("laptop")
            .with_retry(Duration::from_secs(1), 3)
    }

    #[tokio::test]
    async fn test_creates_missing_vault_and_registers_device() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        let binder = binder(&fs, &remote, Arc::new(EventBus::new()));

        let record = binder.ensure_bound("Notes", "/home/me/Notes").await.unwrap();
        assert_eq!(record.vault_name, "Notes");
        assert!(record.device_registered);
        assert_eq!(remote.vaults().len(), 1);
        assert_eq!(remote.devices(&record.vault_id).len(), 1);
        assert_eq!(remote.devices(&record.vault_id)[0].device_name, "laptop");

        let persisted = BindingRecord::load(&*fs).await.unwrap().unwrap();
        assert_eq!(persisted, record);
        assert_eq!(binder.state(), BindingState::Bound { vault_id: record.vault_id });
    }

    #[tokio::test]
    async fn test_binds_to_existing_vault_by_name() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_vault("Work");
        let notes = remote.seed_vault("Notes");

        let record = binder(&fs, &remote, Arc::new(EventBus::new()))
            .ensure_bound("Notes", "/vaults/notes")
            .await
            .unwrap();
        assert_eq!(record.vault_id, notes.id);
        assert_eq!(remote.vaults().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_after_failed_registration_reuses_vault() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());

        remote.fail_next_registration(RemoteError::api(400, "device rejected"));
        let first = binder(&fs, &remote, Arc::new(EventBus::new()));
        assert!(first.ensure_bound("Notes", "/n").await.is_err());

        // The vault id was persisted before registration was attempted.
        let partial = BindingRecord::load(&*fs).await.unwrap().unwrap();
        assert!(!partial.device_registered);
        assert_eq!(remote.vaults().len(), 1);

        let second = binder(&fs, &remote, Arc::new(EventBus::new()));
        let record = second.ensure_bound("Notes", "/n").await.unwrap();
        assert_eq!(record.vault_id, partial.vault_id);
        assert!(record.device_registered);
        assert_eq!(remote.vaults().len(), 1);
        assert_eq!(remote.devices(&record.vault_id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_network_errors_with_linear_backoff() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_next_api_call(RemoteError::Network("down".into()));
        remote.fail_next_api_call(RemoteError::api(503, "busy"));

        let start = tokio::time::Instant::now();
        let record = binder(&fs, &remote, Arc::new(EventBus::new()))
            .ensure_bound("Notes", "/n")
            .await
            .unwrap();
        assert!(record.device_registered);
        // 1s after the first failure, 2s after the second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandons_when_attempts_exhausted() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        for _ in 0..3 {
            remote.fail_next_api_call(RemoteError::Network("down".into()));
        }
        let events = Arc::new(EventBus::new());
        let abandoned = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&abandoned);
        let _sub = events.subscribe(move |event| {
            if let SyncEvent::BindingAbandoned { attempts, .. } = event {
                seen.lock().unwrap().push(attempts);
            }
        });

        let binder = binder(&fs, &remote, events);
        let err = binder.ensure_bound("Notes", "/n").await.unwrap_err();
        assert!(matches!(err, BindingError::Abandoned { attempts: 3, .. }));
        assert_eq!(*abandoned.lock().unwrap(), vec![3]);
        assert!(matches!(binder.state(), BindingState::Abandoned { .. }));
    }

    #[tokio::test]
    async fn test_auth_errors_abandon_immediately() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_next_api_call(RemoteError::Unauthorized("expired token".into()));

        let err = binder(&fs, &remote, Arc::new(EventBus::new()))
            .ensure_bound("Notes", "/n")
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::Abandoned { attempts: 1, .. }));
        assert!(remote.vaults().is_empty());
    }
}
