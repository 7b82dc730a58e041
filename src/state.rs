use std::sync::Arc;

use crate::models::UploadId;
use crate::protocol::UploadEngine;

/// shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<UploadEngine>,
    /// base for `Location` headers; relative `/files/<id>` when unset
    pub public_url: Option<String>,
}

impl AppState {
    pub fn new(engine: Arc<UploadEngine>, public_url: Option<String>) -> Self {
        Self { engine, public_url }
    }

    /// url the client uses for every later request on this upload
    pub fn upload_url(&self, id: &UploadId) -> String {
        match &self.public_url {
            Some(base) => format!("{}/files/{}", base, id),
            None => format!("/files/{}", id),
        }
    }
}
