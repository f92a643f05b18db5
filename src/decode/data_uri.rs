use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::dispatch::DecodedImage;
use crate::error::DecodeError;

pub const SCHEME: &str = "data:";

/// Marker the deep scan looks for inside arbitrary strings.
pub const IMAGE_PREFIX: &str = "data:image/";

const BASE64_MARKER: &str = ";base64";

/// MIME used when the header names none (`data:;base64,...`).
const DEFAULT_MIME: &str = "image/png";

pub fn encode(bytes: &[u8], mime_type: &str) -> String {
    format!("{SCHEME}{mime_type}{BASE64_MARKER},{}", BASE64.encode(bytes))
}

/// Decode `data:<mime>;base64,<payload>`. The payload is everything after the first comma.
pub fn parse(url: &str) -> Result<DecodedImage, DecodeError> {
    let rest = url.trim().strip_prefix(SCHEME).ok_or(DecodeError::MissingScheme)?;
    let (header, payload) = rest.split_once(',').ok_or(DecodeError::MissingComma)?;

    let mut params = header.split(';');
    let mime = params.next().map(str::trim).unwrap_or_default();
    if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(DecodeError::NotBase64Encoded);
    }

    // Providers occasionally wrap long payloads.
    let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64.decode(payload.as_bytes())?;

    Ok(DecodedImage {
        bytes,
        mime_type: if mime.is_empty() {
            DEFAULT_MIME.to_string()
        } else {
            mime.to_string()
        },
    })
}

/// True for strings that should be fetched rather than decoded.
pub fn is_remote(url: &str) -> bool {
    let url = url.trim_start();
    url.starts_with("http://") || url.starts_with("https://")
}
