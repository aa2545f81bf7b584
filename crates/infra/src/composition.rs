//! Image composition service client.
//!
//! The service receives the subject image, the item image and free-text
//! instructions. It answers with an image (as a URL, a `data:` URI or inline
//! base64) or, when it declines, with text only.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::blob::sniff_content_type;
use crate::config::ComposerConfig;

pub type DynComposer = Arc<dyn ImageComposer>;

#[derive(Debug, Clone)]
pub struct CompositionRequest {
    pub subject: Vec<u8>,
    pub item: Vec<u8>,
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositionOutput {
    /// Result already hosted elsewhere.
    Url(String),
    /// Result bytes that still need storing.
    Inline { bytes: Vec<u8>, content_type: String },
    /// No image; the service's explanation.
    Refusal(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompositionError {
    #[error("composition request failed: {0}")]
    Transport(String),
    #[error("composition service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid composition response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ImageComposer: Send + Sync {
    async fn compose(&self, request: CompositionRequest) -> Result<CompositionOutput, CompositionError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComposeBody<'a> {
    instructions: &'a str,
    images: [InlineImage; 2],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineImage {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComposeResponse {
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl ComposeResponse {
    fn into_output(self) -> Result<CompositionOutput, CompositionError> {
        if let Some(url) = self.image_url.filter(|u| !u.is_empty()) {
            if url.starts_with("data:") {
                let (content_type, bytes) = decode_data_uri(&url)?;
                return Ok(CompositionOutput::Inline { bytes, content_type });
            }
            return Ok(CompositionOutput::Url(url));
        }

        if let Some(data) = self.image_base64.filter(|d| !d.is_empty()) {
            let bytes = STANDARD
                .decode(data.trim())
                .map_err(|e| CompositionError::Decode(format!("image payload: {e}")))?;
            let content_type = self
                .mime_type
                .unwrap_or_else(|| sniff_content_type(&bytes).to_string());
            return Ok(CompositionOutput::Inline { bytes, content_type });
        }

        let text = self
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "The service returned no image.".to_string());
        Ok(CompositionOutput::Refusal(text))
    }
}

/// Split a `data:<mime>;base64,<payload>` URI.
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>), CompositionError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| CompositionError::Decode("not a data URI".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| CompositionError::Decode("data URI without payload".to_string()))?;
    let content_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| CompositionError::Decode("data URI is not base64".to_string()))?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| CompositionError::Decode(format!("data URI payload: {e}")))?;
    let content_type = if content_type.is_empty() {
        sniff_content_type(&bytes).to_string()
    } else {
        content_type.to_string()
    };
    Ok((content_type, bytes))
}

/// JSON-over-HTTP composer.
#[derive(Debug, Clone)]
pub struct HttpComposer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: std::time::Duration,
}

impl HttpComposer {
    pub fn new(client: reqwest::Client, config: &ComposerConfig) -> Self {
        Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl ImageComposer for HttpComposer {
    async fn compose(&self, request: CompositionRequest) -> Result<CompositionOutput, CompositionError> {
        let body = ComposeBody {
            instructions: &request.instructions,
            images: [
                InlineImage {
                    mime_type: sniff_content_type(&request.subject),
                    data: STANDARD.encode(&request.subject),
                },
                InlineImage {
                    mime_type: sniff_content_type(&request.item),
                    data: STANDARD.encode(&request.item),
                },
            ],
        };

        let mut req = self.client.post(&self.url).timeout(self.timeout).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CompositionError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompositionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<ComposeResponse>()
            .await
            .map_err(|e| CompositionError::Decode(e.to_string()))?
            .into_output()
    }
}
