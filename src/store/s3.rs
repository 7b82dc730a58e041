//! S3-compatible object-store chunk store.
//!
//! Objects cannot be appended to, so every patch lands as its own segment
//! object under `cache/<id>/<offset>`. Promotion stitches the segments into
//! `store/<key>`: a single segment is copied server-side, several segments
//! go through a multipart upload.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::TryStreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio_util::io::ReaderStream;
use tracing::instrument;

use super::{check_range, ByteStream, ChunkStore, ReadTarget, StoreError, StoreResult, StoredBlob};
use crate::models::UploadId;

/// S3 requires all parts except the last to be at least 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
struct Segment {
    offset: u64,
    len: u64,
}

impl Segment {
    fn end(&self) -> u64 {
        self.offset + self.len
    }
}

#[derive(Debug, Default)]
struct SegmentLog {
    segments: Vec<Segment>,
    position: u64,
}

pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    uploads: DashMap<UploadId, SegmentLog>,
}

fn backend_err<E: std::error::Error>(e: E) -> StoreError {
    StoreError::Backend(DisplayErrorContext(e).to_string())
}

impl S3Store {
    pub async fn new(
        bucket: &str,
        prefix: Option<String>,
        region: Option<String>,
        endpoint: Option<String>,
        force_path_style: bool,
    ) -> StoreResult<Self> {
        if bucket.is_empty() {
            return Err(StoreError::Config("S3 bucket name is empty".to_string()));
        }

        let region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(aws_config::Region::new(region));
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.to_string(),
            prefix: prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            uploads: DashMap::new(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    fn segment_key(&self, id: &UploadId, offset: u64) -> String {
        // zero-padded so segment keys list in offset order
        self.full_key(&format!("cache/{id}/{offset:020}"))
    }

    fn stored_key(&self, key: &str) -> String {
        self.full_key(&format!("store/{key}"))
    }

    fn segments(&self, id: &UploadId) -> StoreResult<Vec<Segment>> {
        self.uploads
            .get(id)
            .map(|log| log.segments.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_object(&self, key: &str, start: u64, end: u64) -> StoreResult<GetObjectOutput> {
        // S3 ranges are inclusive
        self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={}-{}", start, end - 1))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StoreError::NotFound(key.to_string())
                } else {
                    backend_err(e)
                }
            })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StoreResult<Bytes> {
        if end <= start {
            return Ok(Bytes::new());
        }
        let bytes = self
            .get_object(key, start, end)
            .await?
            .body
            .collect()
            .await
            .map_err(backend_err)?
            .into_bytes();
        Ok(bytes)
    }

    async fn delete_key(&self, key: &str) -> StoreResult<()> {
        // DeleteObject succeeds for missing keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete_segments(&self, id: &UploadId, segments: &[Segment]) {
        for segment in segments {
            let key = self.segment_key(id, segment.offset);
            if let Err(e) = self.delete_key(&key).await {
                tracing::warn!("Failed to delete segment {}: {}", key, e);
            }
        }
    }

    async fn copy_into(&self, from: &str, to: &str) -> StoreResult<()> {
        let copy_source = format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(from, NON_ALPHANUMERIC)
        );
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(to)
            .copy_source(copy_source)
            .send()
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn stitch(&self, id: &UploadId, segments: &[Segment], to: &str) -> StoreResult<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(to)
            .send()
            .await
            .map_err(backend_err)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Backend("S3 did not return upload_id".to_string()))?
            .to_string();

        match self.upload_parts(id, segments, to, &upload_id).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(to)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(backend_err)?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(to)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        key = %to,
                        error = %DisplayErrorContext(&abort),
                        "Failed to abort multipart upload, orphaned parts may remain"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        id: &UploadId,
        segments: &[Segment],
        to: &str,
        upload_id: &str,
    ) -> StoreResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut buffer = BytesMut::with_capacity(MIN_PART_SIZE);
        let last = segments.len().saturating_sub(1);

        for (i, segment) in segments.iter().enumerate() {
            let key = self.segment_key(id, segment.offset);
            let data = self.get_range(&key, 0, segment.len).await?;
            buffer.extend_from_slice(&data);

            if buffer.len() >= MIN_PART_SIZE || i == last {
                let part_number = parts.len() as i32 + 1;
                let body = buffer.split().freeze();
                let output = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(to)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(body.into())
                    .send()
                    .await
                    .map_err(backend_err)?;

                parts.push(
                    CompletedPart::builder()
                        .e_tag(output.e_tag().unwrap_or_default())
                        .part_number(part_number)
                        .build(),
                );
            }
        }

        Ok(parts)
    }
}

#[async_trait]
impl ChunkStore for S3Store {
    async fn create(&self, id: &UploadId, _length: Option<u64>) -> StoreResult<()> {
        if self.uploads.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        self.uploads.insert(*id, SegmentLog::default());
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn append(&self, id: &UploadId, expected_offset: u64, data: Bytes) -> StoreResult<u64> {
        let position = self
            .uploads
            .get(id)
            .map(|log| log.position)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if position != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual: position,
            });
        }
        if data.is_empty() {
            return Ok(position);
        }

        let len = data.len() as u64;
        let key = self.segment_key(id, expected_offset);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(data.into())
            .send()
            .await
            .map_err(backend_err)?;

        let recorded = match self.uploads.get_mut(id) {
            Some(mut log) if log.position == expected_offset => {
                log.segments.push(Segment {
                    offset: expected_offset,
                    len,
                });
                log.position += len;
                Some(log.position)
            }
            _ => None,
        };

        match recorded {
            Some(new_position) => Ok(new_position),
            None => {
                // deleted (or raced) while the segment was in flight
                self.delete_key(&key).await?;
                Err(StoreError::NotFound(id.to_string()))
            }
        }
    }

    async fn position(&self, id: &UploadId) -> StoreResult<u64> {
        self.uploads
            .get(id)
            .map(|log| log.position)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn read_range(&self, id: &UploadId, start: u64, end: u64) -> StoreResult<Bytes> {
        check_range(start, end)?;
        let segments = self.segments(id)?;
        let mut out = BytesMut::with_capacity((end - start) as usize);

        for segment in segments
            .iter()
            .filter(|s| s.offset < end && s.end() > start)
        {
            let local_start = start.saturating_sub(segment.offset);
            let local_end = end.min(segment.end()) - segment.offset;
            let key = self.segment_key(id, segment.offset);
            out.extend_from_slice(&self.get_range(&key, local_start, local_end).await?);
        }

        Ok(out.freeze())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn promote(&self, id: &UploadId, key: &str) -> StoreResult<StoredBlob> {
        let segments = self.segments(id)?;
        let size: u64 = segments.iter().map(|s| s.len).sum();
        let to = self.stored_key(key);

        match segments.as_slice() {
            [] => {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&to)
                    .body(Bytes::new().into())
                    .send()
                    .await
                    .map_err(backend_err)?;
            }
            [single] => {
                self.copy_into(&self.segment_key(id, single.offset), &to)
                    .await?;
            }
            many => self.stitch(id, many, &to).await?,
        }

        self.delete_segments(id, &segments).await;
        self.uploads.remove(id);

        Ok(StoredBlob {
            key: key.to_string(),
            size,
        })
    }

    async fn read_stored(&self, blob: &StoredBlob, start: u64, end: u64) -> StoreResult<Bytes> {
        check_range(start, end)?;
        let end = end.min(blob.size);
        self.get_range(&self.stored_key(&blob.key), start, end).await
    }

    async fn open_stream(
        &self,
        target: &ReadTarget,
        start: u64,
        end: u64,
    ) -> StoreResult<Option<ByteStream>> {
        // in-progress uploads are scattered over segments, let the caller page through them
        let ReadTarget::Stored(blob) = target else {
            return Ok(None);
        };
        let end = end.min(blob.size);
        if end <= start {
            return Ok(Some(Box::pin(futures::stream::empty::<StoreResult<Bytes>>())));
        }

        let output = self.get_object(&self.stored_key(&blob.key), start, end).await?;
        let stream = ReaderStream::new(output.body.into_async_read()).map_err(StoreError::Io);
        Ok(Some(Box::pin(stream)))
    }

    async fn delete(&self, id: &UploadId) -> StoreResult<()> {
        if let Some((_, log)) = self.uploads.remove(id) {
            self.delete_segments(id, &log.segments).await;
        }
        Ok(())
    }

    async fn delete_stored(&self, blob: &StoredBlob) -> StoreResult<()> {
        self.delete_key(&self.stored_key(&blob.key)).await
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
