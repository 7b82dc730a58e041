//! Chunk store that proxies every upload to a remote tus endpoint.
//!
//! The remote upload URL doubles as the permanent identity, so promotion
//! moves nothing.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{check_range, ChunkStore, StoreError, StoreResult, StoredBlob};
use crate::client::{TransportError, TusClient};
use crate::metadata::UploadMetadata;
use crate::models::UploadId;

#[derive(Clone, Debug)]
struct RemoteUpload {
    url: String,
    /// deferred length to send with the next PATCH
    pending_length: Option<u64>,
}

pub struct RemoteStore {
    client: TusClient,
    uploads: DashMap<UploadId, RemoteUpload>,
}

impl From<TransportError> for StoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound => StoreError::NotFound("remote upload".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl RemoteStore {
    pub fn new(endpoint: &str, api_key: Option<String>) -> StoreResult<Self> {
        let mut client = TusClient::new(endpoint)
            .map_err(|e| StoreError::Config(format!("invalid remote tus endpoint: {e}")))?;
        if let Some(key) = api_key {
            client = client.with_api_key(key);
        }
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: TusClient) -> Self {
        Self {
            client,
            uploads: DashMap::new(),
        }
    }

    fn upload(&self, id: &UploadId) -> StoreResult<RemoteUpload> {
        self.uploads
            .get(id)
            .map(|u| u.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ChunkStore for RemoteStore {
    async fn create(&self, id: &UploadId, length: Option<u64>) -> StoreResult<()> {
        if self.uploads.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let metadata = UploadMetadata::new().with("upload_id", id.to_string());
        let url = self.client.create_upload(length, &metadata).await?;
        tracing::debug!("Proxying upload {} to {}", id, url);
        self.uploads.insert(
            *id,
            RemoteUpload {
                url,
                pending_length: None,
            },
        );
        Ok(())
    }

    async fn append(&self, id: &UploadId, expected_offset: u64, data: Bytes) -> StoreResult<u64> {
        let upload = self.upload(id)?;
        match self
            .client
            .send_chunk(&upload.url, expected_offset, data, upload.pending_length)
            .await
        {
            Ok(offset) => {
                if let Some(mut u) = self.uploads.get_mut(id) {
                    u.pending_length = None;
                }
                Ok(offset)
            }
            Err(TransportError::OffsetMismatch { current }) => {
                let actual = match current {
                    Some(current) => current,
                    None => self.client.status(&upload.url).await?.offset,
                };
                Err(StoreError::OffsetMismatch {
                    expected: expected_offset,
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn position(&self, id: &UploadId) -> StoreResult<u64> {
        let upload = self.upload(id)?;
        Ok(self.client.status(&upload.url).await?.offset)
    }

    async fn declare_length(&self, id: &UploadId, length: u64) -> StoreResult<()> {
        let mut upload = self
            .uploads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        upload.pending_length = Some(length);
        Ok(())
    }

    async fn read_range(&self, id: &UploadId, start: u64, end: u64) -> StoreResult<Bytes> {
        check_range(start, end)?;
        let upload = self.upload(id)?;
        Ok(self.client.download_range(&upload.url, start, end).await?)
    }

    async fn promote(&self, id: &UploadId, _key: &str) -> StoreResult<StoredBlob> {
        let upload = self.upload(id)?;
        let status = self.client.status(&upload.url).await?;
        self.uploads.remove(id);
        Ok(StoredBlob {
            key: upload.url,
            size: status.offset,
        })
    }

    async fn read_stored(&self, blob: &StoredBlob, start: u64, end: u64) -> StoreResult<Bytes> {
        check_range(start, end)?;
        Ok(self.client.download_range(&blob.key, start, end).await?)
    }

    async fn delete(&self, id: &UploadId) -> StoreResult<()> {
        if let Some((_, upload)) = self.uploads.remove(id) {
            self.client.delete_upload(&upload.url).await?;
        }
        Ok(())
    }

    async fn delete_stored(&self, blob: &StoredBlob) -> StoreResult<()> {
        self.client.delete_upload(&blob.key).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "remote"
    }

    async fn health_check(&self) -> StoreResult<()> {
        let caps = self.client.capabilities().await?;
        if !caps.supports_version(crate::headers::PROTOCOL_VERSION) {
            return Err(StoreError::Config(format!(
                "remote endpoint speaks {:?}, need {}",
                caps.versions,
                crate::headers::PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}
