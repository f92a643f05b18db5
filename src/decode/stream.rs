use futures_util::{Stream, StreamExt};

use crate::decode::document::RawDocument;
use crate::decode::{self, Extracted, Strategy, data_uri};
use crate::error::GenerationError;

/// Consume streamed fragments until one yields an image.
///
/// Each fragment is searched at `choices[0].delta`, falling back to
/// `choices[0].message` for providers that send a full message in the last
/// chunk. Plain text deltas are passed to `on_text` as they arrive. The
/// stream is dropped as soon as an image (or an error) is found.
pub async fn decode_stream<S, F>(fragments: S, mut on_text: F) -> Result<Extracted, GenerationError>
where
    S: Stream<Item = Result<RawDocument, GenerationError>>,
    F: FnMut(&str),
{
    futures_util::pin_mut!(fragments);
    let mut seen = 0usize;

    while let Some(fragment) = fragments.next().await {
        let doc = fragment?;
        seen += 1;

        if let Some(err) = decode::error_document(&doc) {
            return Err(err);
        }
        let Some(choice) = doc.first_choice() else {
            continue;
        };
        let Some(delta) = doc
            .field(choice, "delta")
            .or_else(|| doc.field(choice, "message"))
        else {
            continue;
        };

        // A text delta may begin with a link; only structured parts carry remote images.
        let located = decode::locate(&doc, delta).filter(|(strategy, url)| {
            *strategy != Strategy::BareString || !data_uri::is_remote(url)
        });
        if let Some((strategy, url)) = located {
            tracing::debug!(%strategy, fragment = seen, "located image url in stream");
            return decode::resolve(&url).map_err(GenerationError::from);
        }

        let text = doc
            .field(delta, "content")
            .and_then(|c| doc.as_str(c))
            .filter(|t| !t.is_empty());
        if let Some(text) = text {
            on_text(text);
        }
    }

    tracing::debug!(fragments = seen, "stream exhausted without image");
    Err(GenerationError::StreamEndedWithoutImage)
}
