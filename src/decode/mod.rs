//! Image extraction from chat-completion responses.
//!
//! Providers put generated images in several places. Strategies run in a fixed
//! order and the first one that yields a URL wins:
//!
//! 1. `message.images[0].image_url.url` (extension array)
//! 2. first `message.content[i]` with `type == "image_url"` (multimodal parts)
//! 3. `message.content` itself, when it is a `data:` string
//! 4. any `data:image/...;base64,...` substring anywhere under `message`

pub mod data_uri;
pub mod document;
pub mod stream;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::classify::parse_retry_hint;
use crate::dispatch::DecodedImage;
use crate::error::{DecodeError, GenerationError};
use document::{Node, NodeId, RawDocument};

/// Maximum container nesting the deep scan will descend into.
pub const MAX_SCAN_DEPTH: usize = 64;

/// Characters that end an embedded data URI during the deep scan.
const URI_DELIMITERS: &[char] = &['"', '\'', '`', '(', ')', '[', ']', '{', '}', '<', '>'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ExtensionArray,
    ContentParts,
    BareString,
    DeepScan,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExtensionArray => "extension_array",
            Self::ContentParts => "content_parts",
            Self::BareString => "bare_string",
            Self::DeepScan => "deep_scan",
        })
    }
}

/// Result of a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Image(DecodedImage),
    /// An http(s) URL that still needs to be downloaded.
    Remote(String),
}

/// Decode one complete response document.
///
/// An `error` object at the root is reported as [`GenerationError::ErrorDocument`].
/// A response with no image anywhere is [`DecodeError::NoImageFound`]; a located
/// but unparsable URL is a different [`DecodeError`].
pub fn decode_response(doc: &RawDocument) -> Result<Extracted, GenerationError> {
    if let Some(err) = error_document(doc) {
        return Err(err);
    }
    let message = doc
        .first_choice()
        .and_then(|choice| doc.field(choice, "message"))
        .ok_or(DecodeError::NoImageFound)?;
    let (strategy, url) = locate(doc, message).ok_or(DecodeError::NoImageFound)?;
    tracing::debug!(%strategy, "located image url");
    resolve(&url).map_err(GenerationError::from)
}

/// Run the strategies against one message-shaped node.
pub fn locate(doc: &RawDocument, message: NodeId) -> Option<(Strategy, String)> {
    if let Some(url) = extension_array(doc, message) {
        return Some((Strategy::ExtensionArray, url));
    }
    if let Some(url) = content_parts(doc, message) {
        return Some((Strategy::ContentParts, url));
    }
    if let Some(url) = bare_string(doc, message) {
        return Some((Strategy::BareString, url));
    }
    deep_scan(doc, message).map(|url| (Strategy::DeepScan, url))
}

/// Turn a located URL into an image or a pending remote fetch.
pub fn resolve(url: &str) -> Result<Extracted, DecodeError> {
    if data_uri::is_remote(url) {
        return Ok(Extracted::Remote(url.trim().to_string()));
    }
    data_uri::parse(url).map(Extracted::Image)
}

fn extension_array(doc: &RawDocument, message: NodeId) -> Option<String> {
    let images = doc.field(message, "images")?;
    let first = doc.item(images, 0)?;
    let url = doc.lookup(first, &["image_url", "url"])?;
    doc.as_str(url).map(str::to_string)
}

fn content_parts(doc: &RawDocument, message: NodeId) -> Option<String> {
    let content = doc.field(message, "content")?;
    doc.as_array(content)?.iter().find_map(|&part| {
        let kind = doc.field(part, "type").and_then(|t| doc.as_str(t))?;
        if kind != "image_url" {
            return None;
        }
        let url = doc.lookup(part, &["image_url", "url"])?;
        doc.as_str(url).map(str::to_string)
    })
}

fn bare_string(doc: &RawDocument, message: NodeId) -> Option<String> {
    let content = doc.field(message, "content")?;
    let text = doc.as_str(content)?;
    (text.starts_with(data_uri::SCHEME) || data_uri::is_remote(text)).then(|| text.to_string())
}

/// Depth-first search for the first embedded `data:image/...;base64,...` substring.
pub fn deep_scan(doc: &RawDocument, start: NodeId) -> Option<String> {
    let mut visited = HashSet::new();
    scan(doc, start, 0, &mut visited)
}

fn scan(
    doc: &RawDocument,
    id: NodeId,
    depth: usize,
    visited: &mut HashSet<NodeId>,
) -> Option<String> {
    match doc.node(id)? {
        Node::String(s) => find_embedded_uri(s),
        Node::Array(items) => {
            if depth >= MAX_SCAN_DEPTH || !visited.insert(id) {
                return None;
            }
            items
                .iter()
                .find_map(|&child| scan(doc, child, depth + 1, visited))
        }
        Node::Object(fields) => {
            if depth >= MAX_SCAN_DEPTH || !visited.insert(id) {
                return None;
            }
            fields
                .iter()
                .find_map(|(_, child)| scan(doc, *child, depth + 1, visited))
        }
        Node::Null | Node::Bool(_) | Node::Number(_) => None,
    }
}

/// Smallest `data:image/...` substring of `text` bounded by a delimiter or the end.
pub fn find_embedded_uri(text: &str) -> Option<String> {
    let mut offset = 0;
    while let Some(pos) = text[offset..].find(data_uri::IMAGE_PREFIX) {
        let start = offset + pos;
        let tail = &text[start..];
        let end = tail
            .find(|c: char| c.is_whitespace() || URI_DELIMITERS.contains(&c))
            .unwrap_or(tail.len());
        let candidate = &tail[..end];
        let is_base64 = candidate
            .split_once(',')
            .is_some_and(|(header, _)| header.ends_with(";base64"));
        if is_base64 {
            return Some(candidate.to_string());
        }
        offset = start + data_uri::IMAGE_PREFIX.len();
    }
    None
}

/// `{"error": {...}}` at the root of an otherwise successful body or fragment.
pub fn error_document(doc: &RawDocument) -> Option<GenerationError> {
    let err = doc.field(doc.root(), "error")?;
    let (message, code) = if doc.is_object(err) {
        let message = doc
            .field(err, "message")
            .and_then(|m| doc.as_str(m))
            .unwrap_or("unspecified provider error")
            .to_string();
        let code = doc
            .field(err, "code")
            .and_then(|c| doc.as_f64(c).or_else(|| doc.as_str(c)?.parse().ok()))
            .filter(|c| (100.0..600.0).contains(c))
            .map(|c| c as u16);
        (message, code)
    } else {
        (doc.as_str(err)?.to_string(), None)
    };
    let retry_after: Option<Duration> = parse_retry_hint(doc, err);
    Some(GenerationError::ErrorDocument {
        code,
        message,
        retry_after,
    })
}
