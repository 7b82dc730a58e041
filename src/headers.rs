//! tus protocol header names and fixed values shared by server and client.

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION: &str = "tus-version";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const TUS_MAX_SIZE: &str = "tus-max-size";
pub const TUS_CHECKSUM_ALGORITHM: &str = "tus-checksum-algorithm";

pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_EXPIRES: &str = "upload-expires";
pub const UPLOAD_CHECKSUM: &str = "upload-checksum";

pub const API_KEY: &str = "x-api-key";

/// the only protocol version this server speaks
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// extensions advertised on OPTIONS
pub const SUPPORTED_EXTENSIONS: &str =
    "creation,creation-defer-length,creation-with-upload,termination,expiration,checksum";

pub const CHECKSUM_ALGORITHMS: &str = "sha256";

/// content type required on PATCH bodies
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";
