//! reqwest client for the remote sync service.
//!
//! API calls carry a bearer token. Blob transfers go straight to the
//! presigned URLs from the diff response and carry no credentials.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use sync_core::protocol::{
    CreateVaultRequest, RegisterDeviceRequest, SyncCommitRequest, SyncCommitResponse,
    SyncDiffRequest, SyncDiffResponse, VaultDto,
};
use sync_core::remote::{BlobTransport, RemoteApi, RemoteError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// Map a non-success status and body to the error taxonomy.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let mut preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Unauthorized(format!("{}: {}", status, preview))
        }
        _ => RemoteError::api(status.as_u16(), preview),
    }
}

impl HttpRemote {
    /// `base_url` is the API root, e.g. `https://sync.example.com/api`.
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| RemoteError::Unauthorized("invalid access token format".into()))?;
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            debug!("API response error ({}): {} bytes", status, body.len());
            return Err(status_error(status, &body));
        }
        debug!("API response status: {}", status);

        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.endpoint(path))
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        Self::parse_response(response).await
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn diff(&self, request: &SyncDiffRequest) -> Result<SyncDiffResponse> {
        self.post(&format!("vaults/{}/sync/diff", request.vault_id), request)
            .await
    }

    async fn commit(&self, request: &SyncCommitRequest) -> Result<SyncCommitResponse> {
        self.post(&format!("vaults/{}/sync/commit", request.vault_id), request)
            .await
    }

    async fn list_vaults(&self) -> Result<Vec<VaultDto>> {
        let response = self
            .client
            .get(self.endpoint("vaults"))
            .headers(self.headers()?)
            .send()
            .await
            .map_err(transport_error)?;
        Self::parse_response(response).await
    }

    async fn create_vault(&self, request: &CreateVaultRequest) -> Result<VaultDto> {
        self.post("vaults", request).await
    }

    async fn register_device(&self, vault_id: &str, request: &RegisterDeviceRequest) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&format!("vaults/{}/devices", vault_id)))
            .headers(self.headers()?)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

#[async_trait]
impl BlobTransport for HttpRemote {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, url: &str, content: &[u8]) -> Result<()> {
        let response = self
            .client
            .put(url)
            .body(content.to_vec())
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}
