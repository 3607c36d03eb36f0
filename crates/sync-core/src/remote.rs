//! Capability traits for reaching the remote service.
//!
//! The engine never knows how requests travel. Implementations:
//! - `InMemoryRemote` - Reference server for tests
//! - `HttpRemote` (in sync-daemon) - reqwest against the cloud API

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{
    CreateVaultRequest, RegisterDeviceRequest, SyncCommitRequest, SyncCommitResponse,
    SyncDiffRequest, SyncDiffResponse, VaultDto,
};

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection, timeout, or other transport-level failure.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success response from the service.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Network(_) => RetryClass::Retryable,
            Self::Unauthorized(_) => RetryClass::ReauthRequired,
            Self::Api { status, .. } => match *status {
                401 | 403 => RetryClass::ReauthRequired,
                408 | 429 | 500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Decode(_) => RetryClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_class() == RetryClass::Retryable
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Request/response API of the remote sync service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `POST diff`
    async fn diff(&self, request: &SyncDiffRequest) -> Result<SyncDiffResponse>;

    /// `POST commit`
    async fn commit(&self, request: &SyncCommitRequest) -> Result<SyncCommitResponse>;

    /// `GET vaults` for the authenticated user.
    async fn list_vaults(&self) -> Result<Vec<VaultDto>>;

    /// `POST vaults`
    async fn create_vault(&self, request: &CreateVaultRequest) -> Result<VaultDto>;

    /// `POST vaults/:id/devices`
    async fn register_device(&self, vault_id: &str, request: &RegisterDeviceRequest) -> Result<()>;
}

/// Byte transfer against presigned URLs handed out in sync actions.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>>;

    async fn put(&self, url: &str, content: &[u8]) -> Result<()>;
}

#[async_trait]
impl<T: RemoteApi + ?Sized> RemoteApi for std::sync::Arc<T> {
    async fn diff(&self, request: &SyncDiffRequest) -> Result<SyncDiffResponse> {
        (**self).diff(request).await
    }

    async fn commit(&self, request: &SyncCommitRequest) -> Result<SyncCommitResponse> {
        (**self).commit(request).await
    }

    async fn list_vaults(&self) -> Result<Vec<VaultDto>> {
        (**self).list_vaults().await
    }

    async fn create_vault(&self, request: &CreateVaultRequest) -> Result<VaultDto> {
        (**self).create_vault(request).await
    }

    async fn register_device(&self, vault_id: &str, request: &RegisterDeviceRequest) -> Result<()> {
        (**self).register_device(vault_id, request).await
    }
}

#[async_trait]
impl<T: BlobTransport + ?Sized> BlobTransport for std::sync::Arc<T> {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        (**self).get(url).await
    }

    async fn put(&self, url: &str, content: &[u8]) -> Result<()> {
        (**self).put(url, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classes() {
        assert_eq!(RemoteError::Network("reset".into()).retry_class(), RetryClass::Retryable);
        assert_eq!(RemoteError::api(503, "down").retry_class(), RetryClass::Retryable);
        assert_eq!(RemoteError::api(429, "slow").retry_class(), RetryClass::Retryable);
        assert_eq!(RemoteError::api(401, "no").retry_class(), RetryClass::ReauthRequired);
        assert_eq!(RemoteError::Unauthorized("x".into()).retry_class(), RetryClass::ReauthRequired);
        assert_eq!(RemoteError::api(404, "gone").retry_class(), RetryClass::Permanent);
        assert!(!RemoteError::Decode("bad json".into()).is_retryable());
    }
}
