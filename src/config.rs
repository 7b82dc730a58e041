use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::metadata::DEFAULT_MAX_METADATA_SIZE;
use crate::protocol::EngineConfig;

/// longest session lifetime accepted from configuration (100 years)
pub const MAX_UPLOAD_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// which chunk store backs the uploads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// `cache/` and `store/` directories under `root`
    Local { root: PathBuf },
    /// process memory, gone on restart
    Memory,
    S3 {
        bucket: String,
        prefix: Option<String>,
        region: Option<String>,
        endpoint: Option<String>,
        force_path_style: bool,
    },
    /// proxy to another tus server
    Remote {
        endpoint: String,
        api_key: Option<String>,
    },
}

impl StorageConfig {
    fn from_env() -> Self {
        let backend = std::env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        match backend.as_str() {
            "memory" => StorageConfig::Memory,
            "s3" => StorageConfig::S3 {
                bucket: std::env::var("S3_BUCKET").unwrap_or_default(),
                prefix: std::env::var("S3_PREFIX").ok(),
                region: std::env::var("S3_REGION").ok(),
                endpoint: std::env::var("S3_ENDPOINT").ok(),
                force_path_style: std::env::var("S3_FORCE_PATH_STYLE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(false),
            },
            "remote" => StorageConfig::Remote {
                endpoint: std::env::var("REMOTE_TUS_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:9000/files".to_string()),
                api_key: std::env::var("REMOTE_API_KEY").ok(),
            },
            other => {
                if other != "local" {
                    tracing::warn!("⚠️  Unknown STORAGE_BACKEND '{}', using local", other);
                }
                StorageConfig::Local {
                    root: std::env::var("FILES_DIR")
                        .unwrap_or_else(|_| "./files".to_string())
                        .into(),
                }
            }
        }
    }
}

/// application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// listen address
    pub host: String,
    pub port: u16,
    /// externally visible base url used in `Location`; relative paths when unset
    pub public_url: Option<String>,
    pub storage: StorageConfig,
    /// maximum upload length in bytes, advertised as `Tus-Max-Size`
    pub max_upload_size: Option<u64>,
    /// maximum request body, i.e. the largest single chunk
    pub max_chunk_size: usize,
    /// maximum encoded `Upload-Metadata` size
    pub max_metadata_size: usize,
    /// seconds an idle upload stays resumable
    pub upload_ttl_secs: u64,
    /// seconds between expiry sweeps
    pub gc_interval_secs: u64,
    /// number of tokio worker threads
    pub worker_threads: usize,
    /// api key for upload authentication (hashed); open when unset
    pub api_key_hash: Option<String>,
    /// cors allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// rate limit: requests per second per client ip
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
}

impl Config {
    /// load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let api_key_hash = std::env::var("UPLOAD_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(|k| Self::hash_api_key(&k));
        if api_key_hash.is_none() {
            tracing::warn!("⚠️  No UPLOAD_API_KEY set, uploads are open to anyone who can reach the server");
        }

        // parse cors origins
        let cors_origins = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(1080),
            public_url: std::env::var("PUBLIC_URL")
                .ok()
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            storage: StorageConfig::from_env(),
            max_upload_size: std::env::var("MAX_UPLOAD_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(Some(10 * 1024 * 1024 * 1024)) // 10GB default
                .filter(|&s| s > 0),
            max_chunk_size: std::env::var("MAX_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(64 * 1024 * 1024),
            max_metadata_size: std::env::var("MAX_METADATA_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_METADATA_SIZE),
            upload_ttl_secs: std::env::var("UPLOAD_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7 * 24 * 60 * 60),
            gc_interval_secs: std::env::var("GC_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&s| s > 0)
                .unwrap_or(60 * 60),
            worker_threads: std::env::var("WORKER_THREADS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(8),
            api_key_hash,
            cors_origins,
            rate_limit_per_second: std::env::var("RATE_LIMIT_PER_SECOND")
                .ok()
                .and_then(|r| r.parse().ok())
                .filter(|&r| r > 0)
                .unwrap_or(20),
            rate_limit_burst: std::env::var("RATE_LIMIT_BURST")
                .ok()
                .and_then(|r| r.parse().ok())
                .filter(|&r| r > 0)
                .unwrap_or(100),
        }
    }

    /// session lifetime, capped at MAX_UPLOAD_TTL_SECS so expiry dates stay representable
    pub fn upload_ttl(&self) -> chrono::TimeDelta {
        if self.upload_ttl_secs > MAX_UPLOAD_TTL_SECS {
            tracing::warn!(
                "UPLOAD_TTL_SECS {} is above the {} second cap, clamping",
                self.upload_ttl_secs,
                MAX_UPLOAD_TTL_SECS
            );
        }
        let secs = self.upload_ttl_secs.min(MAX_UPLOAD_TTL_SECS) as i64;
        chrono::TimeDelta::try_seconds(secs).unwrap_or_else(|| chrono::TimeDelta::days(7))
    }

    /// settings handed to the upload engine
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_size: self.max_upload_size,
            upload_ttl: self.upload_ttl(),
            max_metadata_size: self.max_metadata_size,
        }
    }

    // hash api key using sha256
    pub fn hash_api_key(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }
}
