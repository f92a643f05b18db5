use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::classify::ErrorClass;
use crate::dispatch::RequestId;
use crate::store::RequestState;

/// Why a located image URL could not be turned into bytes, or why none was located.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no image found in response")]
    NoImageFound,

    #[error("image url is not a data URI")]
    MissingScheme,

    #[error("data URI has no comma separating header and payload")]
    MissingComma,

    #[error("data URI is not base64-encoded")]
    NotBase64Encoded,

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("remote image url not allowed: {0}")]
    RemoteDisabled(String),
}

/// Failure of one physical attempt.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("upstream returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream error document: {message}")]
    ErrorDocument {
        code: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid JSON in response: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("stream ended without image")]
    StreamEndedWithoutImage,

    #[error("stream error: {0}")]
    Stream(String),

    #[error("failed to fetch remote image {url}: {message}")]
    RemoteFetch { url: String, message: String },

    #[error("response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: usize, max: usize },
}

impl GenerationError {
    /// Server-supplied retry-after hint, when one was carried with the failure.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } | Self::ErrorDocument { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// HTTP-ish status attached to the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::ErrorDocument { code, .. } => *code,
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Message safe to hand to a presentation layer.
    /// Never echoes response bodies longer than a short preview or image payloads.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(e) if e.is_connect() => "could not connect to provider".to_string(),
            Self::Transport(_) => "request to provider failed".to_string(),
            Self::Timeout(d) => format!("request timed out after {}ms", d.as_millis()),
            Self::Status {
                status, message, ..
            } => format!("provider returned {status}: {}", preview(message)),
            Self::ErrorDocument { message, .. } => {
                format!("provider error: {}", preview(message))
            }
            Self::InvalidJson(_) => "failed to parse provider response".to_string(),
            Self::Decode(DecodeError::NoImageFound) => "no image returned by provider".to_string(),
            Self::Decode(DecodeError::RemoteDisabled(_)) => {
                "provider returned a remote image url and remote fetch is disabled".to_string()
            }
            Self::Decode(e) => format!("malformed image in response: {e}"),
            Self::StreamEndedWithoutImage => "stream ended without an image".to_string(),
            Self::Stream(_) => "response stream failed".to_string(),
            Self::RemoteFetch { message, .. } => {
                format!("failed to download image: {}", preview(message))
            }
            Self::ResponseTooLarge { size, .. } => {
                format!("provider response too large ({size} bytes)")
            }
        }
    }
}

/// First 200 chars of an upstream message.
fn preview(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= 200 {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(200).collect();
    format!("{head}...")
}

/// Terminal failure of one logical request, as published to the result store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub request_id: RequestId,
    pub class: ErrorClass,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorRecord {
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Rejected result-store mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("request {0} is already registered")]
    AlreadyRegistered(RequestId),

    #[error("request {0} is not registered")]
    UnknownRequest(RequestId),

    #[error("request {id}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        id: RequestId,
        from: RequestState,
        to: RequestState,
    },
}

/// Configuration file could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Batch-level failures. Per-request failures never take this path.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(RequestId),

    #[error("request id {0} already used by an earlier batch")]
    AlreadySubmitted(RequestId),

    #[error("request {0} has a blank prompt")]
    BlankPrompt(RequestId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no tokio runtime to run the batch on")]
    NoRuntime,

    #[error("batch supervisor failed: {0}")]
    Supervisor(#[from] tokio::task::JoinError),
}
