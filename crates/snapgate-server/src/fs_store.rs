use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use snapgate_core::{BlobStore, ClaimToken, ObjectName, StoreError, StoreResult};
use tokio::{fs, io::AsyncWriteExt};

const CLAIM_SUFFIX: &str = "claim";

/// Objects as plain files under `root`; claims as exclusive-create marker
/// files next to them, each holding the token of its holder.
pub struct FsBlobStore {
    root: PathBuf,
    sequence: AtomicU64,
}

/// True when `path` is made only of normal segments, so joining it onto a
/// directory can never leave that directory.
pub fn is_plain_relative_path(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_)))
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn object_path(&self, object: &ObjectName) -> StoreResult<PathBuf> {
        let relative = Path::new(object.as_str());
        if !is_plain_relative_path(relative) {
            return Err(StoreError::Backend(format!(
                "object name '{}' escapes the store root",
                object
            )));
        }
        Ok(self.root.join(relative))
    }

    fn claim_path(&self, object: &ObjectName) -> StoreResult<PathBuf> {
        let mut path = self.object_path(object)?.into_os_string();
        path.push(".");
        path.push(CLAIM_SUFFIX);
        Ok(PathBuf::from(path))
    }

    async fn ensure_parent(&self, path: &Path, object: &ObjectName) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(object, source))?;
        }
        Ok(())
    }

    async fn create_claim(
        &self,
        path: &Path,
        object: &ObjectName,
    ) -> StoreResult<Option<ClaimToken>> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(mut file) => {
                let token = ClaimToken::new(format!(
                    "{}-{}-{}",
                    std::process::id(),
                    chrono::Utc::now().timestamp_millis(),
                    self.next_sequence()
                ));
                file.write_all(token.as_str().as_bytes())
                    .await
                    .map_err(|source| io_error(object, source))?;
                Ok(Some(token))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(source) => Err(io_error(object, source)),
        }
    }

    async fn claim_is_stale(&self, path: &Path, ttl: Duration) -> bool {
        let Ok(metadata) = fs::metadata(path).await else {
            return true;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age >= ttl)
            .unwrap_or(ttl.is_zero())
    }
}

fn io_error(object: &ObjectName, source: std::io::Error) -> StoreError {
    StoreError::Io {
        object: object.to_string(),
        source,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn head(&self, object: &ObjectName) -> StoreResult<bool> {
        let path = self.object_path(object)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(object, source)),
        }
    }

    async fn put(&self, object: &ObjectName, bytes: Bytes) -> StoreResult<()> {
        let path = self.object_path(object)?;
        self.ensure_parent(&path, object).await?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(
            ".{}.{}.tmp",
            std::process::id(),
            self.next_sequence()
        ));
        let tmp = PathBuf::from(tmp);

        if let Err(source) = fs::write(&tmp, &bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(object, source));
        }
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_error(object, source))
    }

    async fn try_claim(
        &self,
        object: &ObjectName,
        ttl: Duration,
    ) -> StoreResult<Option<ClaimToken>> {
        let path = self.claim_path(object)?;
        self.ensure_parent(&path, object).await?;

        if let Some(token) = self.create_claim(&path, object).await? {
            return Ok(Some(token));
        }

        if !self.claim_is_stale(&path, ttl).await {
            return Ok(None);
        }

        tracing::warn!("taking over stale claim on {object}");
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(object, source)),
        }
        self.create_claim(&path, object).await
    }

    async fn release(&self, object: &ObjectName, claim: &ClaimToken) -> StoreResult<()> {
        let path = self.claim_path(object)?;
        let holder = match fs::read_to_string(&path).await {
            Ok(holder) => holder,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(io_error(object, source)),
        };
        if holder.trim() != claim.as_str() {
            tracing::debug!("claim on {object} has been taken over; leaving it in place");
            return Ok(());
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(object, source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapgate_core::derive_key;
    use tempfile::tempdir;

    fn object(url: &str) -> ObjectName {
        ObjectName::new("screenshots", &derive_key(url))
    }

    #[tokio::test]
    async fn put_then_head() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let name = object("https://example.com/");

        assert!(!store.head(&name).await.expect("head"));
        store
            .put(&name, Bytes::from_static(b"RIFF....WEBP"))
            .await
            .expect("put");
        assert!(store.head(&name).await.expect("head"));

        let on_disk = std::fs::read(dir.path().join(name.as_str())).expect("read object");
        assert_eq!(on_disk, b"RIFF....WEBP");
    }

    #[tokio::test]
    async fn put_overwrites_existing_object() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let name = object("https://example.com/");

        store.put(&name, Bytes::from_static(b"one")).await.expect("put");
        store.put(&name, Bytes::from_static(b"two")).await.expect("put");
        let on_disk = std::fs::read(dir.path().join(name.as_str())).expect("read object");
        assert_eq!(on_disk, b"two");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("screenshots"))
            .expect("list")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let name = object("https://example.com/");
        let ttl = Duration::from_secs(60);

        let claim = store.try_claim(&name, ttl).await.expect("claim").expect("free");
        assert!(store.try_claim(&name, ttl).await.expect("contended").is_none());
        store.release(&name, &claim).await.expect("release");
        assert!(store.try_claim(&name, ttl).await.expect("reclaim").is_some());
        assert!(!store.head(&name).await.expect("claim is not an object"));
    }

    #[tokio::test]
    async fn stale_claim_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let name = object("https://example.com/");

        let stale = store
            .try_claim(&name, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("free");
        let current = store
            .try_claim(&name, Duration::ZERO)
            .await
            .expect("stale claim")
            .expect("taken over");
        assert_ne!(stale, current);
    }

    #[tokio::test]
    async fn stale_holder_cannot_release_successor_claim() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let name = object("https://example.com/");
        let claim_file = dir.path().join(format!("{}.claim", name.as_str()));

        let stale = store
            .try_claim(&name, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("free");
        let current = store
            .try_claim(&name, Duration::ZERO)
            .await
            .expect("stale claim")
            .expect("taken over");

        store.release(&name, &stale).await.expect("stale release");
        assert!(claim_file.exists());
        assert!(store
            .try_claim(&name, Duration::from_secs(60))
            .await
            .expect("contended")
            .is_none());

        store.release(&name, &current).await.expect("release");
        assert!(!claim_file.exists());
    }

    #[tokio::test]
    async fn release_without_claim_is_ok() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store
            .release(&object("https://example.com/"), &ClaimToken::new("nobody"))
            .await
            .expect("release");
    }

    #[tokio::test]
    async fn escaping_object_names_are_refused() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let name = ObjectName::new("../outside", &derive_key("https://example.com/"));
        assert!(store.head(&name).await.is_err());
    }

    #[test]
    fn plain_relative_paths() {
        assert!(is_plain_relative_path(Path::new("screenshots/abc.webp")));
        assert!(is_plain_relative_path(Path::new("abc.webp")));
        assert!(!is_plain_relative_path(Path::new("./screenshots/abc.webp")));
        assert!(!is_plain_relative_path(Path::new("../abc.webp")));
        assert!(!is_plain_relative_path(Path::new("/abc.webp")));
    }
}
