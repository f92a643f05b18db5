pub mod http;

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::decode::data_uri;
use crate::decode::document::RawDocument;
use crate::error::{DecodeError, GenerationError};

/// Caller-assigned identifier of a logical request. Unique within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Encoded reference image sent alongside the prompt.
#[derive(Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ReferenceImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Read an image file, taking the MIME type from its extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let mime_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(mime_for_extension)
            .unwrap_or("image/png");
        Ok(Self::new(bytes, mime_type))
    }

    /// `data:<mime>;base64,<payload>` form used in the outbound content array.
    pub fn data_uri(&self) -> String {
        data_uri::encode(&self.bytes, &self.mime_type)
    }
}

impl fmt::Debug for ReferenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

/// One logical unit of work. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: RequestId,
    pub prompt: String,
    pub images: Vec<ReferenceImage>,
    /// Per-attempt timeout override. Bounds each attempt, not the whole retry loop.
    pub timeout: Option<Duration>,
}

impl GenerationRequest {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(id),
            prompt: prompt.into(),
            images: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_image(mut self, image: ReferenceImage) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A generated image. Produced exactly once per successful request.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Ordered fragments of a streamed response.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<RawDocument, GenerationError>> + Send>>;

/// What one attempt got back from the wire, before image extraction.
pub enum RawResponse {
    Complete(RawDocument),
    Stream(FragmentStream),
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete(doc) => f.debug_tuple("Complete").field(&doc.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// One outbound call per invocation. Implementations never retry.
pub trait Transport: Send + Sync + 'static {
    /// Issue one generation request for `model`, bounded by `timeout`.
    fn send(
        &self,
        request: &GenerationRequest,
        model: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<RawResponse, GenerationError>> + Send;

    /// Download an image referenced by an http(s) URL in a response.
    fn fetch_image(
        &self,
        url: &str,
        _timeout: Duration,
    ) -> impl Future<Output = Result<DecodedImage, GenerationError>> + Send {
        std::future::ready(Err(GenerationError::Decode(DecodeError::RemoteDisabled(
            url.to_string(),
        ))))
    }
}

/// A shared transport can back several schedulers.
impl<T: Transport> Transport for Arc<T> {
    fn send(
        &self,
        request: &GenerationRequest,
        model: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<RawResponse, GenerationError>> + Send {
        (**self).send(request, model, timeout)
    }

    fn fetch_image(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<DecodedImage, GenerationError>> + Send {
        (**self).fetch_image(url, timeout)
    }
}
