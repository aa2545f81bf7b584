//! Object storage for uploaded originals and composited results.
//!
//! Objects are addressed by their public URL once written. Only URLs under the
//! store's own public origin are ever deleted; anything else (external avatars,
//! legacy hosts) is left alone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tryon_core::{TaskId, UserId};

pub mod http;
pub mod in_memory;

pub use http::HttpBlobStore;
pub use in_memory::InMemoryBlobStore;

pub type DynBlobStore = Arc<dyn BlobStore>;

/// Root prefix for everything this service writes.
pub const TRYON_PREFIX: &str = "tryon/";

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    pub url: String,
    pub pathname: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPage {
    pub blobs: Vec<StoredBlob>,
    /// Opaque continuation token; `None` on the last page.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BlobError {
    #[error("blob request failed: {0}")]
    Transport(String),
    #[error("blob service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid blob service response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, pathname: &str, bytes: Vec<u8>, content_type: &str) -> Result<StoredBlob, BlobError>;

    async fn list(&self, prefix: &str, cursor: Option<String>, limit: usize) -> Result<BlobPage, BlobError>;

    /// Metadata of the object at `url`, `None` if it does not exist.
    async fn head(&self, url: &str) -> Result<Option<StoredBlob>, BlobError>;

    /// Delete objects by URL. Unknown URLs are ignored.
    async fn delete_many(&self, urls: &[String]) -> Result<(), BlobError>;

    /// Whether `url` points into this store.
    fn owns(&self, url: &str) -> bool;
}

/// Originals are keyed by task as well as time, so same-millisecond
/// submissions from one user never share an object.
pub fn subject_path(user: UserId, task: TaskId, timestamp_ms: i64, ext: &str) -> String {
    format!("{TRYON_PREFIX}{user}/{timestamp_ms}-{task}-subject.{ext}")
}

pub fn item_path(user: UserId, task: TaskId, timestamp_ms: i64, ext: &str) -> String {
    format!("{TRYON_PREFIX}{user}/{timestamp_ms}-{task}-item.{ext}")
}

pub fn result_path(user: UserId, task: TaskId, ext: &str) -> String {
    format!("{TRYON_PREFIX}result/{user}/{task}.{ext}")
}

/// Best-effort image type detection from magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "application/octet-stream",
    }
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// Join a public origin and a pathname into an object URL.
pub(crate) fn public_url(origin: &str, pathname: &str) -> String {
    format!("{}/{}", origin.trim_end_matches('/'), pathname.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_share_the_managed_prefix() {
        let (user, task) = (UserId::new(), TaskId::new());
        assert!(subject_path(user, task, 1, "png").starts_with(TRYON_PREFIX));
        assert!(item_path(user, task, 1, "png").ends_with(&format!("1-{task}-item.png")));
        assert!(result_path(user, TaskId::new(), "png").starts_with("tryon/result/"));
    }

    #[test]
    fn sniffs_common_image_types() {
        assert_eq!(sniff_content_type(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(sniff_content_type(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_content_type(b"hello"), "application/octet-stream");
    }

    #[test]
    fn joins_urls_without_double_slashes() {
        assert_eq!(public_url("https://cdn.test/", "/tryon/a.png"), "https://cdn.test/tryon/a.png");
    }
}
