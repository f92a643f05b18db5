use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::decode::document::{Node, NodeId, RawDocument};
use crate::error::{DecodeError, GenerationError};

/// Error taxonomy published with every failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Unauthorized,
    NotFound,
    RateLimited,
    Timeout,
    SafetyRejected,
    NoImageFound,
    MalformedResponse,
    Unknown,
}

impl ErrorClass {
    /// Only timeouts and unknown failures are re-attempted. Rate limits are
    /// transient but must be resubmitted as a new logical request.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::SafetyRejected => "safety_rejected",
            Self::NoImageFound => "no_image_found",
            Self::MalformedResponse => "malformed_response",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: ErrorClass,
    pub retryable: bool,
    /// Only ever set for [`ErrorClass::RateLimited`].
    pub retry_after: Option<Duration>,
}

impl Classification {
    fn new(class: ErrorClass, retry_after: Option<Duration>) -> Self {
        Self {
            class,
            retryable: class.is_retryable(),
            retry_after: retry_after.filter(|_| class == ErrorClass::RateLimited),
        }
    }
}

/// Keyword groups checked in order against the lowercased failure text.
/// Earlier groups win, so "invalid api key: model not found" is Unauthorized.
const KEYWORDS: &[(ErrorClass, &[&str])] = &[
    (
        ErrorClass::Unauthorized,
        &[
            "unauthorized",
            "invalid api key",
            "no auth credentials",
            "authentication",
            "forbidden",
        ],
    ),
    (
        ErrorClass::RateLimited,
        &[
            "rate limit",
            "rate-limit",
            "ratelimit",
            "too many requests",
            "quota exceeded",
            "resource_exhausted",
        ],
    ),
    (
        ErrorClass::SafetyRejected,
        &[
            "safety",
            "content policy",
            "content_policy",
            "moderation",
            "prohibited",
            "flagged",
        ],
    ),
    (
        ErrorClass::NotFound,
        &[
            "not found",
            "no endpoints found",
            "not a valid model",
            "unknown model",
            "does not exist",
        ],
    ),
    (
        ErrorClass::Timeout,
        &["timed out", "timeout", "deadline exceeded"],
    ),
];

/// Map one attempt's failure to a class, a retry flag and an optional hint.
pub fn classify(err: &GenerationError) -> Classification {
    let class = match err {
        GenerationError::Timeout(_) => ErrorClass::Timeout,
        GenerationError::Transport(e) if e.is_timeout() => ErrorClass::Timeout,
        GenerationError::Transport(e) => match e.status() {
            Some(status) => class_for_status(status.as_u16(), &e.to_string()),
            None => keyword_class(&e.to_string()).unwrap_or(ErrorClass::Unknown),
        },
        GenerationError::Status {
            status, message, ..
        } => class_for_status(*status, message),
        GenerationError::ErrorDocument { code, message, .. } => match code {
            Some(code) => class_for_status(*code, message),
            None => keyword_class(message).unwrap_or(ErrorClass::Unknown),
        },
        GenerationError::Decode(DecodeError::NoImageFound)
        | GenerationError::StreamEndedWithoutImage => ErrorClass::NoImageFound,
        GenerationError::Decode(_)
        | GenerationError::InvalidJson(_)
        | GenerationError::ResponseTooLarge { .. } => ErrorClass::MalformedResponse,
        GenerationError::Stream(message) | GenerationError::RemoteFetch { message, .. } => {
            keyword_class(message).unwrap_or(ErrorClass::Unknown)
        }
    };
    Classification::new(class, err.retry_after())
}

/// Status codes are authoritative where they are specific; otherwise fall back to keywords.
fn class_for_status(status: u16, text: &str) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Unauthorized,
        404 => ErrorClass::NotFound,
        429 => ErrorClass::RateLimited,
        408 | 504 | 524 => ErrorClass::Timeout,
        _ => keyword_class(text).unwrap_or_else(|| {
            if (400..500).contains(&status) {
                ErrorClass::MalformedResponse
            } else {
                ErrorClass::Unknown
            }
        }),
    }
}

fn keyword_class(text: &str) -> Option<ErrorClass> {
    let lowered = text.to_ascii_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
        .map(|(class, _)| *class)
}

/// Keys under which providers have been seen to carry a retry-after hint.
const RETRY_KEYS: &[&str] = &[
    "retry_after",
    "retry_after_seconds",
    "retryAfter",
    "retry-after",
    "Retry-After",
    "retryDelay",
];

/// Best-effort search for a retry hint below `start`. Absence is not an error.
pub fn parse_retry_hint(doc: &RawDocument, start: NodeId) -> Option<Duration> {
    let mut visited = HashSet::new();
    find_hint(doc, start, 0, &mut visited)
}

fn find_hint(
    doc: &RawDocument,
    id: NodeId,
    depth: usize,
    visited: &mut HashSet<NodeId>,
) -> Option<Duration> {
    if depth > 4 || !visited.insert(id) {
        return None;
    }
    match doc.node(id)? {
        Node::Object(fields) => {
            let direct = fields.iter().find_map(|(key, value)| {
                if !RETRY_KEYS.contains(&key.as_str()) {
                    return None;
                }
                match doc.node(*value)? {
                    Node::Number(n) => n.as_f64().and_then(seconds),
                    Node::String(s) => parse_retry_value(s),
                    _ => None,
                }
            });
            direct.or_else(|| {
                fields
                    .iter()
                    .find_map(|(_, child)| find_hint(doc, *child, depth + 1, visited))
            })
        }
        Node::Array(items) => items
            .iter()
            .find_map(|child| find_hint(doc, *child, depth + 1, visited)),
        _ => None,
    }
}

/// Parse `"12"`, `"1.5"`, `"12s"` or `"1500ms"`. HTTP-date values are not supported.
pub fn parse_retry_value(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse::<f64>().ok().and_then(|v| seconds(v / 1000.0));
    }
    let secs = raw.strip_suffix('s').unwrap_or(raw).trim();
    secs.parse::<f64>().ok().and_then(seconds)
}

fn seconds(v: f64) -> Option<Duration> {
    (0.0..86_400.0).contains(&v).then(|| Duration::from_secs_f64(v))
}
