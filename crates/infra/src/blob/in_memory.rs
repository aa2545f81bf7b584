use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::fetch::{FetchError, FetchTransport};

use super::{BlobError, BlobPage, BlobStore, StoredBlob, public_url};

#[derive(Debug, Clone)]
struct Entry {
    blob: StoredBlob,
    bytes: Vec<u8>,
}

/// In-memory object store for tests/dev.
///
/// Also serves reads by URL, so the processing worker can fetch originals from
/// it the same way it would over HTTP. Failures can be injected for deletes and
/// reads to exercise batch isolation and retries.
#[derive(Debug)]
pub struct InMemoryBlobStore {
    origin: String,
    objects: RwLock<BTreeMap<String, Entry>>,
    failing_deletes: AtomicUsize,
    failing_fetches: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(BTreeMap::new()),
            failing_deletes: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn url_for(&self, pathname: &str) -> String {
        public_url(&self.origin, pathname)
    }

    /// Make the next `n` `delete_many` calls fail.
    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|e| e.blob.url == url)
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backdate an object, e.g. to make it eligible for orphan collection.
    pub fn set_uploaded_at(&self, url: &str, at: chrono::DateTime<Utc>) {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = objects.values_mut().find(|e| e.blob.url == url) {
            entry.blob.uploaded_at = at;
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, pathname: &str, bytes: Vec<u8>, _content_type: &str) -> Result<StoredBlob, BlobError> {
        let blob = StoredBlob {
            url: self.url_for(pathname),
            pathname: pathname.to_string(),
            size: bytes.len() as u64,
            uploaded_at: Utc::now(),
        };
        self.objects
            .write()
            .map_err(|_| BlobError::Transport("object map lock poisoned".to_string()))?
            .insert(pathname.to_string(), Entry { blob: blob.clone(), bytes });
        Ok(blob)
    }

    async fn list(&self, prefix: &str, cursor: Option<String>, limit: usize) -> Result<BlobPage, BlobError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| BlobError::Transport("object map lock poisoned".to_string()))?;

        let mut blobs: Vec<StoredBlob> = objects
            .range(cursor.clone().unwrap_or_default()..)
            .filter(|(path, _)| cursor.as_deref() != Some(path.as_str()))
            .filter(|(path, _)| path.starts_with(prefix))
            .take(limit + 1)
            .map(|(_, e)| e.blob.clone())
            .collect();

        let cursor = if blobs.len() > limit {
            blobs.truncate(limit);
            blobs.last().map(|b| b.pathname.clone())
        } else {
            None
        };
        Ok(BlobPage { blobs, cursor })
    }

    async fn head(&self, url: &str) -> Result<Option<StoredBlob>, BlobError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| BlobError::Transport("object map lock poisoned".to_string()))?;
        Ok(objects.values().find(|e| e.blob.url == url).map(|e| e.blob.clone()))
    }

    async fn delete_many(&self, urls: &[String]) -> Result<(), BlobError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_deletes) {
            return Err(BlobError::Status {
                status: 503,
                body: "injected delete failure".to_string(),
            });
        }
        let mut objects = self
            .objects
            .write()
            .map_err(|_| BlobError::Transport("object map lock poisoned".to_string()))?;
        objects.retain(|_, e| !urls.contains(&e.blob.url));
        Ok(())
    }

    fn owns(&self, url: &str) -> bool {
        url.strip_prefix(&self.origin)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[async_trait]
impl FetchTransport for InMemoryBlobStore {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if Self::take_failure(&self.failing_fetches) {
            return Err(FetchError::Transport {
                url: url.to_string(),
                reason: "injected fetch failure".to_string(),
            });
        }
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|e| e.blob.url == url)
            .map(|e| e.bytes.clone())
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}
