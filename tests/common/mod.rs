//! Scripted in-process transport shared by the scheduler and attempt-loop tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream;
use serde_json::json;
use tokio::time::Instant;

use stillgen::decode::data_uri;
use stillgen::decode::document::RawDocument;
use stillgen::dispatch::{DecodedImage, GenerationRequest, RawResponse, RequestId, Transport};
use stillgen::error::GenerationError;

/// What the fake returns for one attempt.
#[derive(Debug, Clone)]
pub enum Reply {
    Image(&'static [u8]),
    /// Image as a typed part of `message.content`.
    ContentPart(&'static [u8]),
    /// Streamed: a text delta, then the image.
    StreamedImage(&'static str, &'static [u8]),
    Remote(&'static str),
    NoImage,
    Status(u16, &'static str),
    RateLimited(Duration),
    Hang,
}

/// Image message in the `message.images[]` shape.
pub fn image_document(bytes: &[u8]) -> RawDocument {
    RawDocument::from_value(&json!({"choices": [{"message": {
        "role": "assistant",
        "images": [{"type": "image_url", "image_url": {"url": data_uri::encode(bytes, "image/png")}}]
    }}]}))
}

impl Reply {
    fn into_response(self) -> Result<RawResponse, GenerationError> {
        match self {
            Reply::Image(bytes) => Ok(RawResponse::Complete(image_document(bytes))),
            Reply::ContentPart(bytes) => Ok(RawResponse::Complete(RawDocument::from_value(
                &json!({"choices": [{"message": {"content": [
                    {"type": "text", "text": "Here you go."},
                    {"type": "image_url", "image_url": {"url": data_uri::encode(bytes, "image/png")}}
                ]}}]}),
            ))),
            Reply::StreamedImage(text, bytes) => {
                let fragments: Vec<Result<RawDocument, GenerationError>> = vec![
                    Ok(RawDocument::from_value(
                        &json!({"choices": [{"delta": {"content": text}}]}),
                    )),
                    Ok(RawDocument::from_value(&json!({"choices": [{"delta": {
                        "images": [{"image_url": {"url": data_uri::encode(bytes, "image/png")}}]
                    }}]}))),
                ];
                Ok(RawResponse::Stream(Box::pin(stream::iter(fragments))))
            }
            Reply::Remote(url) => Ok(RawResponse::Complete(RawDocument::from_value(
                &json!({"choices": [{"message": {"content": [
                    {"type": "image_url", "image_url": {"url": url}}
                ]}}]}),
            ))),
            Reply::NoImage => Ok(RawResponse::Complete(RawDocument::from_value(
                &json!({"choices": [{"message": {"content": "I cannot draw that."}}]}),
            ))),
            Reply::Status(status, message) => Err(GenerationError::Status {
                status,
                message: message.to_string(),
                retry_after: None,
            }),
            Reply::RateLimited(retry_after) => Err(GenerationError::Status {
                status: 429,
                message: "Rate limit exceeded".to_string(),
                retry_after: Some(retry_after),
            }),
            Reply::Hang => unreachable!("hang is handled before conversion"),
        }
    }
}

/// Replies are consumed per request id in order; the last one repeats.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<RequestId, VecDeque<Reply>>>,
    latency: Duration,
    remote: Option<&'static [u8]>,
    calls: Mutex<Vec<(RequestId, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            latency,
            remote: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn script(self, id: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(RequestId::from(id), replies.into_iter().collect());
        self
    }

    /// Serve `bytes` for any remote image URL.
    pub fn with_remote(mut self, bytes: &'static [u8]) -> Self {
        self.remote = Some(bytes);
        self
    }

    pub fn calls_for(&self, id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(rid, _)| rid.as_str() == id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, id: &RequestId) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(id)
            .unwrap_or_else(|| panic!("no script for {id}"));
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &GenerationRequest,
        _model: &str,
        _timeout: Duration,
    ) -> Result<RawResponse, GenerationError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.id.clone(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self.next_reply(&request.id);
        if matches!(reply, Reply::Hang) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.latency).await;
        reply.into_response()
    }

    async fn fetch_image(&self, url: &str, _timeout: Duration) -> Result<DecodedImage, GenerationError> {
        match self.remote {
            Some(bytes) => Ok(DecodedImage {
                bytes: bytes.to_vec(),
                mime_type: "image/webp".to_string(),
            }),
            None => Err(GenerationError::RemoteFetch {
                url: url.to_string(),
                message: "status 404 Not Found".to_string(),
            }),
        }
    }
}
