use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::RenderRequest;

/// Length of a hex-encoded SHA-256 digest.
pub const CACHE_KEY_HEX_LEN: usize = 64;

pub const OBJECT_EXTENSION: &str = "webp";

/// Lowercase hex SHA-256 digest addressing one stored screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which request parameters feed the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// Target URL only; every viewport shares one object.
    #[default]
    Url,
    /// Target URL plus width, height and full-page mode.
    UrlAndViewport,
}

pub fn derive_key(normalized_target_url: &str) -> CacheKey {
    CacheKey(hex::encode(Sha256::digest(normalized_target_url.as_bytes())))
}

/// Key for a parsed request. The target URL is taken in its parsed,
/// serialized form so that trivially different spellings share one object.
pub fn key_for_request(request: &RenderRequest, scope: KeyScope) -> CacheKey {
    let url = request.target_url().as_str();
    match scope {
        KeyScope::Url => derive_key(url),
        KeyScope::UrlAndViewport => {
            let viewport = request.viewport();
            let material = format!(
                "{}\n{}x{}\n{}",
                url,
                viewport.width,
                viewport.height,
                request.full_page()
            );
            derive_key(&material)
        }
    }
}

/// Blob store object name: `<prefix>/<hex-digest>.webp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectName(String);

impl ObjectName {
    pub fn new(prefix: &str, key: &CacheKey) -> Self {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            Self(format!("{key}.{OBJECT_EXTENSION}"))
        } else {
            Self(format!("{prefix}/{key}.{OBJECT_EXTENSION}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
