use std::env;
use std::path::PathBuf;
use tusk::config::{Config, StorageConfig};

// helper to clear env vars
fn clear_env() {
    for var in [
        "HOST",
        "PORT",
        "PUBLIC_URL",
        "STORAGE_BACKEND",
        "FILES_DIR",
        "S3_BUCKET",
        "S3_PREFIX",
        "S3_REGION",
        "S3_ENDPOINT",
        "S3_FORCE_PATH_STYLE",
        "REMOTE_TUS_URL",
        "REMOTE_API_KEY",
        "MAX_UPLOAD_SIZE",
        "MAX_CHUNK_SIZE",
        "MAX_METADATA_SIZE",
        "UPLOAD_TTL_SECS",
        "GC_INTERVAL_SECS",
        "WORKER_THREADS",
        "UPLOAD_API_KEY",
        "CORS_ORIGINS",
        "RATE_LIMIT_PER_SECOND",
        "RATE_LIMIT_BURST",
    ] {
        env::remove_var(var);
    }
}

#[test]
fn test_hash_api_key() {
    let key = "secret";
    let hash = Config::hash_api_key(key);
    // sha256 hex string is 64 chars
    assert_eq!(hash.len(), 64);

    // deterministic
    assert_eq!(hash, Config::hash_api_key(key));

    // different keys produce different hashes
    assert_ne!(hash, Config::hash_api_key("other"));
}

#[test]
fn test_config_behavior() {
    // Run these sequentially to avoid race conditions with environment variables

    // 1. Test Defaults
    clear_env();

    let config = Config::from_env();

    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 1080);
    assert_eq!(config.public_url, None);
    assert_eq!(
        config.storage,
        StorageConfig::Local {
            root: PathBuf::from("./files")
        }
    );
    assert_eq!(config.max_upload_size, Some(10 * 1024 * 1024 * 1024));
    assert_eq!(config.max_metadata_size, 4096);
    assert_eq!(config.upload_ttl_secs, 7 * 24 * 60 * 60);
    assert_eq!(config.gc_interval_secs, 3600);
    assert_eq!(config.worker_threads, 8);
    assert_eq!(config.api_key_hash, None);
    assert_eq!(config.cors_origins.len(), 2);

    let engine = config.engine_config();
    assert_eq!(engine.upload_ttl, chrono::Duration::days(7));
    assert_eq!(engine.max_size, config.max_upload_size);

    // 2. Test From Env
    clear_env();

    env::set_var("PORT", "9090");
    env::set_var("PUBLIC_URL", "https://uploads.example.com/");
    env::set_var("FILES_DIR", "/tmp/test_files");
    env::set_var("WORKER_THREADS", "4");
    env::set_var("UPLOAD_API_KEY", "supersecret");
    env::set_var("UPLOAD_TTL_SECS", "60");
    env::set_var("MAX_UPLOAD_SIZE", "0");

    let config = Config::from_env();

    assert_eq!(config.port, 9090);
    assert_eq!(
        config.public_url.as_deref(),
        Some("https://uploads.example.com")
    );
    assert_eq!(
        config.storage,
        StorageConfig::Local {
            root: PathBuf::from("/tmp/test_files")
        }
    );
    assert_eq!(config.worker_threads, 4);
    assert_eq!(
        config.api_key_hash,
        Some(Config::hash_api_key("supersecret"))
    );
    assert_eq!(config.engine_config().upload_ttl, chrono::Duration::seconds(60));
    // zero means unlimited
    assert_eq!(config.max_upload_size, None);

    // 3. Test backends
    clear_env();

    env::set_var("STORAGE_BACKEND", "S3");
    env::set_var("S3_BUCKET", "uploads");
    env::set_var("S3_ENDPOINT", "http://127.0.0.1:9000");
    env::set_var("S3_FORCE_PATH_STYLE", "true");

    let config = Config::from_env();
    assert_eq!(
        config.storage,
        StorageConfig::S3 {
            bucket: "uploads".to_string(),
            prefix: None,
            region: None,
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            force_path_style: true,
        }
    );

    clear_env();
    env::set_var("STORAGE_BACKEND", "memory");
    assert_eq!(Config::from_env().storage, StorageConfig::Memory);

    clear_env();
    env::set_var("STORAGE_BACKEND", "remote");
    env::set_var("REMOTE_TUS_URL", "http://upstream:1080/files");
    assert_eq!(
        Config::from_env().storage,
        StorageConfig::Remote {
            endpoint: "http://upstream:1080/files".to_string(),
            api_key: None,
        }
    );

    // Cleanup
    clear_env();
}
