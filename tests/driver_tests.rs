use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tusk::client::{
    DriverError, LocalTransport, RetryPolicy, TransportError, TusClient, UploadDriver,
    UploadFile, UploadStatus, UploadTransport,
};
use tusk::config::{Config, StorageConfig};
use tusk::metadata::UploadMetadata;
use tusk::protocol::{EngineConfig, UploadEngine};
use tusk::server::build_router;
use tusk::state::AppState;
use tusk::store::MemoryStore;

fn local_engine(config: EngineConfig) -> Arc<UploadEngine> {
    Arc::new(UploadEngine::new(Arc::new(MemoryStore::new()), config))
}

/// local transport that records calls and can drop patch responses
struct Scripted {
    inner: LocalTransport,
    /// patches that fail with a connection error
    fail_patches: AtomicUsize,
    /// apply the failing patch before reporting the error (lost response)
    apply_then_fail: bool,
    patch_offsets: Mutex<Vec<u64>>,
    heads: AtomicUsize,
}

impl Scripted {
    fn new(engine: Arc<UploadEngine>) -> Self {
        Self {
            inner: LocalTransport::new(engine),
            fail_patches: AtomicUsize::new(0),
            apply_then_fail: false,
            patch_offsets: Mutex::new(Vec::new()),
            heads: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, patches: usize, apply_then_fail: bool) -> Self {
        self.fail_patches = AtomicUsize::new(patches);
        self.apply_then_fail = apply_then_fail;
        self
    }

    fn offsets(&self) -> Vec<u64> {
        self.patch_offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadTransport for Scripted {
    async fn create(
        &self,
        length: Option<u64>,
        metadata: &UploadMetadata,
    ) -> Result<String, TransportError> {
        self.inner.create(length, metadata).await
    }

    async fn head(&self, url: &str) -> Result<UploadStatus, TransportError> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.inner.head(url).await
    }

    async fn patch(&self, url: &str, offset: u64, data: Bytes) -> Result<u64, TransportError> {
        self.patch_offsets.lock().unwrap().push(offset);
        if self
            .fail_patches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            if self.apply_then_fail {
                self.inner.patch(url, offset, data).await?;
            }
            return Err(TransportError::Connection("connection reset".to_string()));
        }
        self.inner.patch(url, offset, data).await
    }

    async fn terminate(&self, url: &str) -> Result<(), TransportError> {
        self.inner.terminate(url).await
    }
}

#[tokio::test]
async fn test_upload_emits_descriptor() {
    let engine = local_engine(EngineConfig::default());
    let driver = UploadDriver::new(LocalTransport::new(engine.clone())).with_chunk_size(6);
    let progress = driver.subscribe_progress();

    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.mp4").with_mime_type("video/mp4");
    let outcome = driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.size, 10);
    assert_eq!(outcome.descriptor.id, outcome.upload_url);
    assert_eq!(outcome.descriptor.storage, "cache");
    assert_eq!(outcome.descriptor.metadata.filename.as_deref(), Some("a.mp4"));
    assert_eq!(outcome.descriptor.metadata.size, 10);
    assert_eq!(
        outcome.descriptor.metadata.mime_type.as_deref(),
        Some("video/mp4")
    );

    let json = serde_json::to_value(&outcome.descriptor).unwrap();
    assert_eq!(json["storage"], "cache");
    assert_eq!(json["metadata"]["mime_type"], "video/mp4");

    let last = *progress.borrow();
    assert_eq!((last.bytes_sent, last.total), (10, 10));

    let id = outcome.upload_url.rsplit('/').next().unwrap();
    let session = engine
        .head(&tusk::models::UploadId::parse(id).unwrap())
        .unwrap();
    assert!(session.is_finalized());
    assert_eq!(session.metadata.filetype(), Some("video/mp4"));
}

#[tokio::test]
async fn test_lost_response_resyncs_from_head() {
    let engine = local_engine(EngineConfig::default());
    let transport = Scripted::new(engine).failing(1, true);
    let driver = UploadDriver::new(transport)
        .with_chunk_size(4)
        .with_retry_policy(RetryPolicy::immediate(3));

    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.bin");
    let outcome = driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.size, 10);

    // the first chunk landed despite the error, so it is never resent
    assert_eq!(driver.transport().offsets(), vec![0, 4, 8]);
    assert_eq!(driver.transport().heads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_chunk_is_resent() {
    let engine = local_engine(EngineConfig::default());
    let transport = Scripted::new(engine).failing(2, false);
    let driver = UploadDriver::new(transport)
        .with_chunk_size(5)
        .with_retry_policy(RetryPolicy::immediate(3));

    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.bin");
    driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(driver.transport().offsets(), vec![0, 0, 0, 5]);
}

#[tokio::test]
async fn test_resume_from_server_offset() {
    let engine = local_engine(EngineConfig::default());
    let transport = Scripted::new(engine);

    // a previous attempt got four bytes in
    let url = transport
        .create(Some(10), &UploadMetadata::new().with("filename", "a.bin"))
        .await
        .unwrap();
    transport
        .inner
        .patch(&url, 0, Bytes::from_static(b"0123"))
        .await
        .unwrap();

    let driver = UploadDriver::new(transport).with_chunk_size(100);
    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.bin");
    let outcome = driver
        .upload(&file, Some(&url), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.upload_url, url);
    assert_eq!(driver.transport().offsets(), vec![4]);
}

#[tokio::test]
async fn test_expired_session_restarts_from_scratch() {
    let engine = local_engine(EngineConfig::default());
    let driver = UploadDriver::new(Scripted::new(engine));
    let stale = "/files/0123456789abcdef0123456789abcdef";

    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.bin");
    let outcome = driver
        .upload(&file, Some(stale), &CancellationToken::new())
        .await
        .unwrap();

    assert_ne!(outcome.upload_url, stale);
    assert_eq!(driver.transport().offsets(), vec![0]);
}

#[tokio::test]
async fn test_retries_exhausted_keeps_upload_resumable() {
    let engine = local_engine(EngineConfig::default());
    let driver = UploadDriver::new(Scripted::new(engine).failing(usize::MAX, false))
        .with_retry_policy(RetryPolicy::immediate(2));

    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.bin");
    let err = driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        DriverError::RetriesExhausted { attempts, source, .. } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(source, TransportError::Connection(_)));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    let url = err.upload_url().expect("upload url is kept");
    assert!(url.starts_with("/files/"));
}

#[tokio::test]
async fn test_definitive_rejection_is_not_retried() {
    let engine = local_engine(EngineConfig {
        max_size: Some(4),
        ..Default::default()
    });
    let driver = UploadDriver::new(Scripted::new(engine));

    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.bin");
    let err = driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DriverError::Rejected {
            upload_url: None,
            source: TransportError::Rejected { status, .. },
        } => assert_eq!(status, 413),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(driver.transport().offsets().is_empty());
}

#[tokio::test]
async fn test_cancelled_upload() {
    let engine = local_engine(EngineConfig::default());
    let driver = UploadDriver::new(LocalTransport::new(engine));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let file = UploadFile::from_bytes(&b"0123456789"[..], "a.bin");
    let err = driver.upload(&file, None, &cancel).await.unwrap_err();
    assert!(matches!(err, DriverError::Cancelled { upload_url: None }));
}

#[tokio::test]
async fn test_upload_from_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("clip.webm");
    std::fs::write(&path, vec![42u8; 3000]).unwrap();

    let engine = local_engine(EngineConfig::default());
    let driver = UploadDriver::new(LocalTransport::new(engine)).with_chunk_size(1024);
    let file = UploadFile::open(&path).await.unwrap();
    assert_eq!(file.size(), 3000);

    let outcome = driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.descriptor.metadata.filename.as_deref(), Some("clip.webm"));
    assert_eq!(outcome.size, 3000);
}

#[tokio::test]
async fn test_empty_file() {
    let engine = local_engine(EngineConfig::default());
    let driver = UploadDriver::new(LocalTransport::new(engine));
    let file = UploadFile::from_bytes(Bytes::new(), "empty.txt");

    let outcome = driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.size, 0);
}

#[tokio::test]
async fn test_http_client_against_loopback_server() {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        public_url: None,
        storage: StorageConfig::Memory,
        max_upload_size: Some(1024 * 1024),
        max_chunk_size: 1024,
        max_metadata_size: 1024,
        upload_ttl_secs: 60,
        gc_interval_secs: 60,
        worker_threads: 1,
        api_key_hash: None,
        cors_origins: Vec::new(),
        rate_limit_per_second: 10,
        rate_limit_burst: 10,
    };
    let engine = local_engine(config.engine_config());
    let app = build_router(Arc::new(AppState::new(engine, None)), &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = TusClient::new(&format!("http://{addr}/files")).unwrap();
    let caps = client.capabilities().await.unwrap();
    assert!(caps.supports_version("1.0.0"));
    assert!(caps.supports_extension("checksum"));
    assert_eq!(caps.max_size, Some(1024 * 1024));

    let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let driver = UploadDriver::new(client.clone()).with_chunk_size(1000);
    let file = UploadFile::from_bytes(data.clone(), "data.bin");
    let outcome = driver
        .upload(&file, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome
        .upload_url
        .starts_with(&format!("http://{addr}/files/")));

    let status = client.status(&outcome.upload_url).await.unwrap();
    assert_eq!(status.offset, 2500);
    assert_eq!(status.length, Some(2500));

    let slice = client
        .download_range(&outcome.upload_url, 1000, 1010)
        .await
        .unwrap();
    assert_eq!(&slice[..], &data[1000..1010]);

    // chunks above the body limit are refused outright
    let other = client
        .create_upload(Some(4096), &UploadMetadata::new())
        .await
        .unwrap();
    let err = client
        .send_chunk(&other, 0, Bytes::from(vec![0u8; 2048]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Rejected { status: 413, .. }));

    client.delete_upload(&outcome.upload_url).await.unwrap();
    assert!(matches!(
        client.status(&outcome.upload_url).await,
        Err(TransportError::NotFound)
    ));
    // already gone
    client.delete_upload(&outcome.upload_url).await.unwrap();
}
