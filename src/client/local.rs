use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::{TransportError, UploadStatus, UploadTransport};
use crate::metadata::UploadMetadata;
use crate::models::UploadId;
use crate::protocol::{Checksum, PatchRequest, UploadEngine};

/// Drives an in-process engine directly, no HTTP involved. Upload urls are
/// `/files/<id>`, the same paths the server hands out.
#[derive(Clone)]
pub struct LocalTransport {
    engine: Arc<UploadEngine>,
}

impl LocalTransport {
    pub fn new(engine: Arc<UploadEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<UploadEngine> {
        &self.engine
    }

    fn id_of(url: &str) -> Result<UploadId, TransportError> {
        url.trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(UploadId::parse)
            .ok_or(TransportError::NotFound)
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn create(
        &self,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> Result<String, TransportError> {
        let session = self.engine.create(length, metadata.clone()).await?;
        Ok(format!("/files/{}", session.id))
    }

    async fn head(&self, url: &str) -> Result<UploadStatus, TransportError> {
        let session = self.engine.head(&Self::id_of(url)?)?;
        Ok(UploadStatus {
            offset: session.offset,
            length: session.total_length,
        })
    }

    async fn patch(&self, url: &str, offset: u64, data: Bytes) -> Result<u64, TransportError> {
        let id = Self::id_of(url)?;
        let checksum = Checksum::sha256(&data);
        let outcome = self
            .engine
            .patch(&id, PatchRequest::new(offset, data).with_checksum(checksum))
            .await?;
        Ok(outcome.offset)
    }

    async fn terminate(&self, url: &str) -> Result<(), TransportError> {
        self.engine.terminate(&Self::id_of(url)?).await?;
        Ok(())
    }
}
