//! Object store client for an HTTP blob service.
//!
//! Wire contract:
//! - `PUT {api}/{pathname}` with the raw body, answers `{url, pathname, size, uploadedAt}`
//! - `GET {api}?prefix=..&limit=..&cursor=..` answers `{blobs: [...], cursor, hasMore}`
//! - `GET {api}/head?url=..` answers one blob's metadata, or 404
//! - `POST {api}/delete` with `{urls: [...]}`

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::config::BlobConfig;

use super::{BlobError, BlobPage, BlobStore, StoredBlob};

#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    api_url: String,
    public_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutResponse {
    url: String,
    pathname: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    uploaded_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    blobs: Vec<StoredBlob>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

impl HttpBlobStore {
    pub fn new(client: reqwest::Client, config: &BlobConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BlobError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BlobError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn transport(err: reqwest::Error) -> BlobError {
    BlobError::Transport(err.to_string())
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, pathname: &str, bytes: Vec<u8>, content_type: &str) -> Result<StoredBlob, BlobError> {
        let size = bytes.len() as u64;
        let req = self
            .client
            .put(format!("{}/{}", self.api_url, pathname))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        let resp = Self::check(self.authorized(req).send().await.map_err(transport)?).await?;
        let body: PutResponse = resp
            .json()
            .await
            .map_err(|e| BlobError::Decode(e.to_string()))?;

        debug!(pathname = %body.pathname, size, "blob stored");
        Ok(StoredBlob {
            url: body.url,
            pathname: body.pathname,
            size: body.size.unwrap_or(size),
            uploaded_at: body.uploaded_at.unwrap_or_else(Utc::now),
        })
    }

    async fn list(&self, prefix: &str, cursor: Option<String>, limit: usize) -> Result<BlobPage, BlobError> {
        let mut query = vec![("prefix", prefix.to_string()), ("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let req = self.client.get(&self.api_url).query(&query);
        let resp = Self::check(self.authorized(req).send().await.map_err(transport)?).await?;
        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| BlobError::Decode(e.to_string()))?;

        Ok(BlobPage {
            blobs: body.blobs,
            cursor: if body.has_more { body.cursor } else { None },
        })
    }

    async fn head(&self, url: &str) -> Result<Option<StoredBlob>, BlobError> {
        let req = self.client.get(format!("{}/head", self.api_url)).query(&[("url", url)]);
        let resp = self.authorized(req).send().await.map_err(transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let blob = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| BlobError::Decode(e.to_string()))?;
        Ok(Some(blob))
    }

    async fn delete_many(&self, urls: &[String]) -> Result<(), BlobError> {
        if urls.is_empty() {
            return Ok(());
        }
        let req = self
            .client
            .post(format!("{}/delete", self.api_url))
            .json(&serde_json::json!({ "urls": urls }));
        Self::check(self.authorized(req).send().await.map_err(transport)?).await?;
        Ok(())
    }

    fn owns(&self, url: &str) -> bool {
        url.strip_prefix(&self.public_url)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}
