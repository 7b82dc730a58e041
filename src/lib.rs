//! Resumable upload server and client speaking the tus 1.0.0 protocol.

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod headers;
pub mod metadata;
pub mod middleware;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;
pub mod store;
pub mod utils;

pub use error::UploadError;
pub use metadata::UploadMetadata;
pub use models::{AttachmentDescriptor, UploadId, UploadSession};
pub use protocol::UploadEngine;
