use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache_key::ObjectName;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {object}: {source}")]
    Io {
        object: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Backend(String),
}

/// Identifies one successful `try_claim`. Releasing with a token that no
/// longer matches the live claim leaves that claim alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Key-value blob storage addressed by [`ObjectName`].
///
/// `try_claim` must be exclusive: while a claim on an object is live, every
/// other `try_claim` for that object returns `None`. A claim lapses after
/// `ttl` even if it is never released, and may then be taken over.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn head(&self, object: &ObjectName) -> StoreResult<bool>;
    async fn put(&self, object: &ObjectName, bytes: Bytes) -> StoreResult<()>;
    async fn try_claim(
        &self,
        object: &ObjectName,
        ttl: Duration,
    ) -> StoreResult<Option<ClaimToken>>;
    async fn release(&self, object: &ObjectName, claim: &ClaimToken) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    objects: HashMap<String, Bytes>,
    claims: HashMap<String, (ClaimToken, Instant)>,
    next_claim: u64,
}

/// Process-local store, used in tests and single-node development.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, object: &ObjectName) -> Option<Bytes> {
        self.inner.lock().await.objects.get(object.as_str()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.objects.len()
    }

    pub async fn is_claimed(&self, object: &ObjectName) -> bool {
        let inner = self.inner.lock().await;
        inner
            .claims
            .get(object.as_str())
            .is_some_and(|(_, deadline)| *deadline > Instant::now())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn head(&self, object: &ObjectName) -> StoreResult<bool> {
        Ok(self.inner.lock().await.objects.contains_key(object.as_str()))
    }

    async fn put(&self, object: &ObjectName, bytes: Bytes) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .objects
            .insert(object.as_str().to_string(), bytes);
        Ok(())
    }

    async fn try_claim(
        &self,
        object: &ObjectName,
        ttl: Duration,
    ) -> StoreResult<Option<ClaimToken>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some((_, deadline)) = inner.claims.get(object.as_str()) {
            if *deadline > now {
                return Ok(None);
            }
        }
        inner.next_claim += 1;
        let token = ClaimToken::new(inner.next_claim.to_string());
        inner
            .claims
            .insert(object.as_str().to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, object: &ObjectName, claim: &ClaimToken) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .claims
            .get(object.as_str())
            .is_some_and(|(token, _)| token == claim)
        {
            inner.claims.remove(object.as_str());
        }
        Ok(())
    }
}
