use std::fmt;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::{StreamExt, future};
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Value, json};

use crate::classify::{parse_retry_hint, parse_retry_value};
use crate::config::Config;
use crate::decode::document::RawDocument;
use crate::dispatch::{DecodedImage, FragmentStream, GenerationRequest, RawResponse, Transport};
use crate::error::GenerationError;

/// Generated images arrive inline as base64, so this is far above a text-only cap.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;
/// Error bodies are only previewed.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// OpenRouter-compatible chat-completions client. One call per `send`; never retries.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    models_endpoint: String,
    api_key: Option<String>,
    referer: String,
    title: String,
    stream: bool,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("referer", &self.referer)
            .field("title", &self.title)
            .field("stream", &self.stream)
            .finish()
    }
}

impl HttpTransport {
    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.max_concurrency.max(1))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            endpoint: config.endpoint(),
            models_endpoint: config.models_endpoint(),
            api_key: config.api_key.clone(),
            referer: config.referer.clone(),
            title: config.app_title.clone(),
            stream: config.stream,
        }
    }

    /// Authorization plus the attribution headers OpenRouter uses for app rankings.
    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn request_body(&self, request: &GenerationRequest, model: &str) -> Value {
        let mut content = vec![json!({"type": "text", "text": request.prompt})];
        content.extend(request.images.iter().map(|image| {
            json!({"type": "image_url", "image_url": {"url": image.data_uri()}})
        }));
        json!({
            "model": model,
            "modalities": ["image", "text"],
            "messages": [{"role": "user", "content": content}],
            "stream": self.stream,
        })
    }

    /// `GET {api_base}/models`; returns how many models the provider lists.
    pub async fn probe_models(&self, timeout: Duration) -> Result<usize, GenerationError> {
        let response = self
            .authorized(self.client.get(&self.models_endpoint))
            .timeout(timeout)
            .send()
            .await?;
        let response = check_status(response).await?;
        let bytes = read_capped(response).await?;
        let doc = RawDocument::from_slice(&bytes)?;
        let count = doc
            .field(doc.root(), "data")
            .and_then(|data| doc.as_array(data))
            .map_or(0, |items| items.len());
        tracing::info!(endpoint = %self.models_endpoint, count, "models probe ok");
        Ok(count)
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &GenerationRequest,
        model: &str,
        timeout: Duration,
    ) -> Result<RawResponse, GenerationError> {
        let body = self.request_body(request, model);
        tracing::debug!(
            request_id = %request.id,
            model,
            images = request.images.len(),
            stream = self.stream,
            "sending generation request"
        );

        let response = self
            .authorized(self.client.post(&self.endpoint))
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        if self.stream {
            return Ok(RawResponse::Stream(sse_fragments(response)));
        }
        let bytes = read_capped(response).await?;
        Ok(RawResponse::Complete(RawDocument::from_slice(&bytes)?))
    }

    async fn fetch_image(&self, url: &str, timeout: Duration) -> Result<DecodedImage, GenerationError> {
        let remote_err = |message: String| GenerationError::RemoteFetch {
            url: url.to_string(),
            message,
        };
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| remote_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(remote_err(format!("status {status}")));
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("image/png")
            .to_string();
        let bytes = read_capped(response).await?;
        tracing::debug!(%url, mime_type = %mime_type, len = bytes.len(), "fetched remote image");
        Ok(DecodedImage { bytes, mime_type })
    }
}

/// Non-2xx responses become [`GenerationError::Status`] carrying the upstream
/// message and any retry hint from the `Retry-After` header or the JSON body.
async fn check_status(response: Response) -> Result<Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let header_hint = retry_after_header(response.headers());
    let body = response.bytes().await.unwrap_or_default();
    let body = &body[..body.len().min(MAX_ERROR_BODY_BYTES)];

    let doc = RawDocument::from_slice(body).ok();
    let message = doc
        .as_ref()
        .and_then(|doc| {
            let error = doc.field(doc.root(), "error")?;
            doc.field(error, "message")
                .and_then(|m| doc.as_str(m))
                .or_else(|| doc.as_str(error))
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    let retry_after = header_hint
        .or_else(|| doc.as_ref().and_then(|doc| parse_retry_hint(doc, doc.root())));

    tracing::debug!(status = status.as_u16(), ?retry_after, "upstream returned error status");
    Err(GenerationError::Status {
        status: status.as_u16(),
        message,
        retry_after,
    })
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_value)
}

async fn read_capped(response: Response) -> Result<Vec<u8>, GenerationError> {
    if let Some(len) = response.content_length() {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > MAX_RESPONSE_BYTES {
            return Err(GenerationError::ResponseTooLarge {
                size: len,
                max: MAX_RESPONSE_BYTES,
            });
        }
    }
    let bytes = response.bytes().await?;
    if bytes.len() > MAX_RESPONSE_BYTES {
        return Err(GenerationError::ResponseTooLarge {
            size: bytes.len(),
            max: MAX_RESPONSE_BYTES,
        });
    }
    Ok(Vec::from(bytes))
}

/// SSE `data:` payloads as parsed fragments, ending at `[DONE]` or connection close.
fn sse_fragments(response: Response) -> FragmentStream {
    let events = response
        .bytes_stream()
        .eventsource()
        .take_while(|event| {
            future::ready(!matches!(event, Ok(e) if e.data.trim() == "[DONE]"))
        })
        .filter_map(|event| {
            future::ready(match event {
                Ok(e) if e.data.trim().is_empty() => None,
                Ok(e) => Some(RawDocument::from_slice(e.data.as_bytes()).map_err(GenerationError::from)),
                Err(e) => Some(Err(GenerationError::Stream(e.to_string()))),
            })
        });
    Box::pin(events)
}
