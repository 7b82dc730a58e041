//! In-process chunk store for development and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{check_range, ChunkStore, StoreError, StoreResult, StoredBlob};
use crate::models::UploadId;

#[derive(Default)]
pub struct MemoryStore {
    uploads: DashMap<UploadId, Vec<u8>>,
    stored: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of uploads still in progress
    pub fn pending(&self) -> usize {
        self.uploads.len()
    }

    pub fn contains_stored(&self, key: &str) -> bool {
        self.stored.contains_key(key)
    }
}

fn slice(data: &[u8], start: u64, end: u64) -> Bytes {
    let len = data.len() as u64;
    let end = end.min(len);
    if start >= end {
        return Bytes::new();
    }
    Bytes::copy_from_slice(&data[start as usize..end as usize])
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn create(&self, id: &UploadId, _length: Option<u64>) -> StoreResult<()> {
        match self.uploads.entry(*id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists(id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Vec::new());
                Ok(())
            }
        }
    }

    async fn append(&self, id: &UploadId, expected_offset: u64, data: Bytes) -> StoreResult<u64> {
        let mut buf = self
            .uploads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let position = buf.len() as u64;
        if position != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual: position,
            });
        }
        buf.extend_from_slice(&data);
        Ok(buf.len() as u64)
    }

    async fn position(&self, id: &UploadId) -> StoreResult<u64> {
        self.uploads
            .get(id)
            .map(|buf| buf.len() as u64)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn read_range(&self, id: &UploadId, start: u64, end: u64) -> StoreResult<Bytes> {
        check_range(start, end)?;
        let buf = self
            .uploads
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(slice(&buf, start, end))
    }

    async fn promote(&self, id: &UploadId, key: &str) -> StoreResult<StoredBlob> {
        let (_, buf) = self
            .uploads
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let size = buf.len() as u64;
        // Bytes::from(Vec) takes ownership without copying
        self.stored.insert(key.to_string(), Bytes::from(buf));
        Ok(StoredBlob {
            key: key.to_string(),
            size,
        })
    }

    async fn read_stored(&self, blob: &StoredBlob, start: u64, end: u64) -> StoreResult<Bytes> {
        check_range(start, end)?;
        let data = self
            .stored
            .get(&blob.key)
            .ok_or_else(|| StoreError::NotFound(blob.key.clone()))?;
        Ok(slice(&data, start, end))
    }

    async fn delete(&self, id: &UploadId) -> StoreResult<()> {
        self.uploads.remove(id);
        Ok(())
    }

    async fn delete_stored(&self, blob: &StoredBlob) -> StoreResult<()> {
        self.stored.remove(&blob.key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
