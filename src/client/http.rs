//! HTTP transport built on reqwest.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use std::time::Duration;

use super::{ServerCapabilities, TransportError, UploadStatus, UploadTransport};
use crate::headers::{
    API_KEY, OFFSET_OCTET_STREAM, PROTOCOL_VERSION, TUS_EXTENSION, TUS_MAX_SIZE, TUS_RESUMABLE,
    TUS_VERSION, UPLOAD_CHECKSUM, UPLOAD_DEFER_LENGTH, UPLOAD_LENGTH, UPLOAD_METADATA,
    UPLOAD_OFFSET,
};
use crate::metadata::UploadMetadata;
use crate::models::ErrorResponse;
use crate::protocol::Checksum;
use crate::utils::parse_u64_header;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// tus client for a single creation endpoint (e.g. `https://host/files`)
#[derive(Debug, Clone)]
pub struct TusClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

fn header_str<'a>(resp: &'a Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(resp: &Response, name: &str) -> Option<u64> {
    header_str(resp, name).and_then(parse_u64_header)
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Turn a non-success response into the matching error.
async fn error_from(resp: Response) -> TransportError {
    let status = resp.status();
    let current = header_u64(&resp, UPLOAD_OFFSET);

    match status.as_u16() {
        404 | 410 => return TransportError::NotFound,
        409 => return TransportError::OffsetMismatch { current },
        423 => return TransportError::Locked,
        460 => return TransportError::ChecksumMismatch,
        _ => {}
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    if status.is_server_error() {
        TransportError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        TransportError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

impl TusClient {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| TransportError::Configuration(format!("{endpoint}: {e}")))?;
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, url)
            .header(TUS_RESUMABLE, PROTOCOL_VERSION);
        match &self.api_key {
            Some(key) => req.header(API_KEY, key),
            None => req,
        }
    }

    /// POST to the creation endpoint; returns the absolute upload url.
    pub async fn create_upload(
        &self,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> Result<String, TransportError> {
        let mut req = self.request(Method::POST, self.endpoint.as_str());
        req = match length {
            Some(length) => req.header(UPLOAD_LENGTH, length),
            None => req.header(UPLOAD_DEFER_LENGTH, "1"),
        };
        if !metadata.is_empty() {
            req = req.header(UPLOAD_METADATA, metadata.encode());
        }

        let resp = req.send().await?;
        if resp.status() != StatusCode::CREATED {
            return Err(error_from(resp).await);
        }

        let location = header_str(&resp, LOCATION.as_str())
            .ok_or_else(|| TransportError::InvalidResponse("missing Location".to_string()))?;
        let url = self
            .endpoint
            .join(location)
            .map_err(|e| TransportError::InvalidResponse(format!("bad Location {location}: {e}")))?;
        Ok(url.to_string())
    }

    /// HEAD an upload.
    pub async fn status(&self, url: &str) -> Result<UploadStatus, TransportError> {
        let resp = self.request(Method::HEAD, url).send().await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let offset = header_u64(&resp, UPLOAD_OFFSET)
            .ok_or_else(|| TransportError::InvalidResponse("missing Upload-Offset".to_string()))?;
        Ok(UploadStatus {
            offset,
            length: header_u64(&resp, UPLOAD_LENGTH),
        })
    }

    /// PATCH one chunk, with its sha256 checksum. `declare_length` sets a
    /// deferred length in the same request.
    pub async fn send_chunk(
        &self,
        url: &str,
        offset: u64,
        data: Bytes,
        declare_length: Option<u64>,
    ) -> Result<u64, TransportError> {
        let mut req = self
            .request(Method::PATCH, url)
            .header(CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .header(UPLOAD_OFFSET, offset)
            .header(UPLOAD_CHECKSUM, Checksum::sha256(&data).to_header());
        if let Some(length) = declare_length {
            req = req.header(UPLOAD_LENGTH, length);
        }

        let resp = req.body(data).send().await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        header_u64(&resp, UPLOAD_OFFSET)
            .ok_or_else(|| TransportError::InvalidResponse("missing Upload-Offset".to_string()))
    }

    /// DELETE an upload. Already gone counts as done.
    pub async fn delete_upload(&self, url: &str) -> Result<(), TransportError> {
        let resp = self.request(Method::DELETE, url).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(()),
            _ => Err(error_from(resp).await),
        }
    }

    /// GET `[start, end)` of an upload.
    pub async fn download_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, TransportError> {
        if end <= start {
            return Ok(Bytes::new());
        }
        let resp = self
            .request(Method::GET, url)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
        let body = resp.bytes().await?;
        if partial {
            return Ok(body);
        }
        // server ignored the range
        let from = (start as usize).min(body.len());
        let to = (end as usize).min(body.len());
        Ok(body.slice(from..to))
    }

    /// OPTIONS on the creation endpoint.
    pub async fn capabilities(&self) -> Result<ServerCapabilities, TransportError> {
        let resp = self
            .client
            .request(Method::OPTIONS, self.endpoint.as_str())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        Ok(ServerCapabilities {
            versions: split_list(header_str(&resp, TUS_VERSION)),
            extensions: split_list(header_str(&resp, TUS_EXTENSION)),
            max_size: header_u64(&resp, TUS_MAX_SIZE),
        })
    }
}

#[async_trait]
impl UploadTransport for TusClient {
    async fn create(
        &self,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> Result<String, TransportError> {
        self.create_upload(length, metadata).await
    }

    async fn head(&self, url: &str) -> Result<UploadStatus, TransportError> {
        self.status(url).await
    }

    async fn patch(&self, url: &str, offset: u64, data: Bytes) -> Result<u64, TransportError> {
        self.send_chunk(url, offset, data, None).await
    }

    async fn terminate(&self, url: &str) -> Result<(), TransportError> {
        self.delete_upload(url).await
    }
}
