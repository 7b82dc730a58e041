//! `Upload-Metadata` header codec.
//!
//! The header is a comma separated list of `key base64(value)` pairs. Keys are
//! unique, non-empty and free of spaces and commas; the value part may be
//! omitted. Pair order is preserved.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// default cap on the encoded header length
pub const DEFAULT_MAX_METADATA_SIZE: usize = 4 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata(Vec<(String, String)>);

impl UploadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder-style insert; a repeated key replaces the earlier value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.0.push((key, value)),
        }
        self
    }

    /// decode a header value, enforcing `max_size` on the raw header
    pub fn parse(header: &str, max_size: usize) -> Result<Self, UploadError> {
        if header.len() > max_size {
            return Err(UploadError::InvalidMetadata(format!(
                "header is {} bytes, limit is {}",
                header.len(),
                max_size
            )));
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        for raw in header.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            let mut parts = raw.split(' ').filter(|p| !p.is_empty());
            let key = parts
                .next()
                .ok_or_else(|| UploadError::InvalidMetadata("empty key".to_string()))?;
            let encoded = parts.next();
            if parts.next().is_some() {
                return Err(UploadError::InvalidMetadata(format!(
                    "pair for key {key:?} has more than two parts"
                )));
            }
            if pairs.iter().any(|(k, _)| k == key) {
                return Err(UploadError::InvalidMetadata(format!(
                    "duplicate key {key:?}"
                )));
            }

            let value = match encoded {
                Some(encoded) => {
                    let bytes = STANDARD.decode(encoded).map_err(|e| {
                        UploadError::InvalidMetadata(format!(
                            "value for key {key:?} is not valid base64: {e}"
                        ))
                    })?;
                    String::from_utf8(bytes).map_err(|_| {
                        UploadError::InvalidMetadata(format!(
                            "value for key {key:?} is not valid UTF-8"
                        ))
                    })?
                }
                None => String::new(),
            };

            pairs.push((key.to_string(), value));
        }

        Ok(Self(pairs))
    }

    /// re-encode for HEAD responses and outgoing client requests
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{} {}", k, STANDARD.encode(v.as_bytes()))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// client-supplied file name (`filename`, falling back to `name`)
    pub fn filename(&self) -> Option<&str> {
        self.get("filename")
            .or_else(|| self.get("name"))
            .filter(|v| !v.is_empty())
    }

    /// client-supplied mime type (`filetype`, falling back to `type`)
    pub fn filetype(&self) -> Option<&str> {
        self.get("filetype")
            .or_else(|| self.get("type"))
            .filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_in_order() {
        // "a.mp4" and "video/mp4"
        let meta =
            UploadMetadata::parse("filename YS5tcDQ=,filetype dmlkZW8vbXA0,flag", 1024).unwrap();
        let keys: Vec<_> = meta.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["filename", "filetype", "flag"]);
        assert_eq!(meta.filename(), Some("a.mp4"));
        assert_eq!(meta.filetype(), Some("video/mp4"));
        assert_eq!(meta.get("flag"), Some(""));
    }

    #[test]
    fn encode_is_parseable() {
        let meta = UploadMetadata::new()
            .with("filename", "clip one.mov")
            .with("empty", "");
        let encoded = meta.encode();
        assert!(encoded.ends_with(",empty"));
        assert_eq!(UploadMetadata::parse(&encoded, 1024).unwrap(), meta);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(UploadMetadata::parse("filename !!!", 1024).is_err());
        assert!(UploadMetadata::parse("a YQ==,a Yg==", 1024).is_err());
        assert!(UploadMetadata::parse("a YQ== extra", 1024).is_err());
        // invalid utf-8 (0xff)
        assert!(UploadMetadata::parse("a /w==", 1024).is_err());
        assert!(UploadMetadata::parse(&"k YQ==,".repeat(100), 64).is_err());
    }
}
