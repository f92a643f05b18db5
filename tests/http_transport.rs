//! HTTP transport against raw TCP mock servers.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use stillgen::classify::{ErrorClass, classify};
use stillgen::config::Config;
use stillgen::decode::stream::decode_stream;
use stillgen::decode::{Extracted, decode_response};
use stillgen::dispatch::http::HttpTransport;
use stillgen::dispatch::{GenerationRequest, RawResponse, ReferenceImage, Transport};
use stillgen::error::GenerationError;

const TIMEOUT: Duration = Duration::from_secs(10);
const B1_URI: &str = "data:image/png;base64,YjE=";

/// Helper: bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Read one full HTTP/1.1 request (headers plus Content-Length body).
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn http_response(status: &str, extra_headers: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n{extra_headers}Connection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Serve one canned response; the handle yields the raw request text.
fn serve_once(listener: TcpListener, response: Vec<u8>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        socket.write_all(&response).await.unwrap();
        socket.shutdown().await.ok();
        request
    })
}

fn json_response(status: &str, extra_headers: &str, body: &str) -> Vec<u8> {
    http_response(status, extra_headers, "application/json", body.as_bytes())
}

fn config(port: u16, stream: bool) -> Config {
    Config {
        api_key: Some("sk-or-test".to_string()),
        api_base: format!("http://127.0.0.1:{port}/v1"),
        stream,
        ..Config::default()
    }
}

fn request() -> GenerationRequest {
    GenerationRequest::new("shot-1", "a lighthouse at dusk")
        .with_image(ReferenceImage::new(b"style".to_vec(), "image/jpeg"))
}

async fn send(port: u16, stream: bool) -> Result<RawResponse, GenerationError> {
    let transport = HttpTransport::from_config(&config(port, stream)).unwrap();
    transport.send(&request(), "acme/pixel-9", TIMEOUT).await
}

fn complete(raw: RawResponse) -> stillgen::decode::document::RawDocument {
    match raw {
        RawResponse::Complete(doc) => doc,
        other => panic!("expected complete response, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Complete responses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn complete_response_and_outbound_shape() {
    let (listener, port) = mock_listener().await;
    let body = format!(
        r#"{{"choices":[{{"message":{{"role":"assistant","images":[{{"type":"image_url","image_url":{{"url":"{B1_URI}"}}}}]}}}}]}}"#
    );
    let server = serve_once(listener, json_response("200 OK", "", &body));

    let doc = complete(send(port, false).await.unwrap());
    match decode_response(&doc).unwrap() {
        Extracted::Image(img) => assert_eq!(img.bytes, b"b1"),
        other => panic!("expected inline image, got {other:?}"),
    }

    let raw = server.await.unwrap();
    let lower = raw.to_ascii_lowercase();
    assert!(raw.starts_with("POST /v1/chat/completions "), "{raw}");
    assert!(lower.contains("authorization: bearer sk-or-test"), "{raw}");
    assert!(lower.contains("http-referer: http://localhost"), "{raw}");
    assert!(lower.contains("x-title: stillgen"), "{raw}");
    assert!(raw.contains(r#""modalities":["image","text"]"#), "{raw}");
    assert!(raw.contains(r#""model":"acme/pixel-9""#), "{raw}");
    assert!(raw.contains("data:image/jpeg;base64,c3R5bGU="), "{raw}");
    assert!(raw.contains(r#""stream":false"#), "{raw}");
}

#[tokio::test]
async fn error_document_in_success_body() {
    let (listener, port) = mock_listener().await;
    let body = r#"{"error":{"message":"Provider returned error","code":502,"metadata":{"retry_after":4}}}"#;
    let server = serve_once(listener, json_response("200 OK", "", body));

    let doc = complete(send(port, false).await.unwrap());
    let err = decode_response(&doc).unwrap_err();
    match &err {
        GenerationError::ErrorDocument { code, message, .. } => {
            assert_eq!(*code, Some(502));
            assert_eq!(message, "Provider returned error");
        }
        other => panic!("expected error document, got {other:?}"),
    }
    assert_eq!(classify(&err).class, ErrorClass::Unknown);
    server.await.unwrap();
}

#[tokio::test]
async fn invalid_json_body() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(listener, json_response("200 OK", "", "<html>gateway</html>"));

    let err = send(port, false).await.unwrap_err();
    assert!(matches!(err, GenerationError::InvalidJson(_)), "{err:?}");
    assert_eq!(classify(&err).class, ErrorClass::MalformedResponse);
    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Error statuses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_carries_retry_after_header() {
    let (listener, port) = mock_listener().await;
    let body = r#"{"error":{"message":"Rate limit exceeded: free-models-per-min","code":429}}"#;
    let server = serve_once(
        listener,
        json_response("429 Too Many Requests", "Retry-After: 7\r\n", body),
    );

    let err = send(port, false).await.unwrap_err();
    assert_eq!(err.status(), Some(429));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    let classification = classify(&err);
    assert_eq!(classification.class, ErrorClass::RateLimited);
    assert!(!classification.retryable);
    assert_eq!(classification.retry_after, Some(Duration::from_secs(7)));
    server.await.unwrap();
}

#[tokio::test]
async fn rate_limit_hint_from_body_when_header_missing() {
    let (listener, port) = mock_listener().await;
    let body = r#"{"error":{"message":"quota","code":429,"details":[{"retryDelay":"30s"}]}}"#;
    let server = serve_once(listener, json_response("429 Too Many Requests", "", body));

    let err = send(port, false).await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    server.await.unwrap();
}

#[tokio::test]
async fn unauthorized_uses_upstream_message() {
    let (listener, port) = mock_listener().await;
    let body = r#"{"error":{"message":"No auth credentials found","code":401}}"#;
    let server = serve_once(listener, json_response("401 Unauthorized", "", body));

    let err = send(port, false).await.unwrap_err();
    match &err {
        GenerationError::Status { status, message, .. } => {
            assert_eq!(*status, 401);
            assert_eq!(message, "No auth credentials found");
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert_eq!(classify(&err).class, ErrorClass::Unauthorized);
    server.await.unwrap();
}

#[tokio::test]
async fn server_error_with_plain_text_body_is_retryable() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(
        listener,
        http_response("503 Service Unavailable", "", "text/plain", b"upstream overloaded"),
    );

    let err = send(port, false).await.unwrap_err();
    let classification = classify(&err);
    assert_eq!(classification.class, ErrorClass::Unknown);
    assert!(classification.retryable);
    assert!(err.user_message().contains("upstream overloaded"));
    server.await.unwrap();
}

#[tokio::test]
async fn unresponsive_server_times_out() {
    let (listener, port) = mock_listener().await;
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let transport = HttpTransport::from_config(&config(port, false)).unwrap();
    let err = transport
        .send(&request(), "acme/pixel-9", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert_eq!(classify(&err).class, ErrorClass::Timeout);
    assert!(classify(&err).retryable);
    server.abort();
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

fn sse_text(content: &str) -> String {
    format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n")
}

fn sse_image(uri: &str) -> String {
    format!(
        "data: {{\"choices\":[{{\"delta\":{{\"images\":[{{\"type\":\"image_url\",\"image_url\":{{\"url\":\"{uri}\"}}}}]}}}}]}}\n\n"
    )
}

fn serve_sse(listener: TcpListener, events: Vec<String>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        socket.write_all(SSE_HEADERS).await.unwrap();
        for event in events {
            socket.write_all(event.as_bytes()).await.unwrap();
        }
        socket.shutdown().await.ok();
        request
    })
}

#[tokio::test]
async fn streaming_response_yields_text_then_image() {
    let (listener, port) = mock_listener().await;
    let server = serve_sse(
        listener,
        vec![
            ": OPENROUTER PROCESSING\n\n".to_string(),
            sse_text("Here is "),
            sse_text("your still."),
            sse_image(B1_URI),
            "data: [DONE]\n\n".to_string(),
        ],
    );

    let fragments = match send(port, true).await.unwrap() {
        RawResponse::Stream(fragments) => fragments,
        other => panic!("expected stream, got {other:?}"),
    };
    let mut texts = Vec::new();
    let extracted = decode_stream(fragments, |t| texts.push(t.to_string())).await.unwrap();

    match extracted {
        Extracted::Image(img) => assert_eq!(img.bytes, b"b1"),
        other => panic!("expected inline image, got {other:?}"),
    }
    assert_eq!(texts, vec!["Here is ", "your still."]);
    let raw = server.await.unwrap();
    assert!(raw.contains(r#""stream":true"#), "{raw}");
}

#[tokio::test]
async fn stream_without_image_is_reported() {
    let (listener, port) = mock_listener().await;
    let server = serve_sse(
        listener,
        vec![sse_text("I can only describe it."), "data: [DONE]\n\n".to_string()],
    );

    let RawResponse::Stream(fragments) = send(port, true).await.unwrap() else {
        panic!("expected stream");
    };
    let err = decode_stream(fragments, |_| {}).await.unwrap_err();
    assert!(matches!(err, GenerationError::StreamEndedWithoutImage), "{err:?}");
    assert_eq!(classify(&err).class, ErrorClass::NoImageFound);
    server.await.unwrap();
}

#[tokio::test]
async fn stream_error_event_is_classified() {
    let (listener, port) = mock_listener().await;
    let server = serve_sse(
        listener,
        vec![
            sse_text("working"),
            "data: {\"error\":{\"message\":\"Rate limit exceeded\",\"code\":429}}\n\n".to_string(),
        ],
    );

    let RawResponse::Stream(fragments) = send(port, true).await.unwrap() else {
        panic!("expected stream");
    };
    let err = decode_stream(fragments, |_| {}).await.unwrap_err();
    assert_eq!(classify(&err).class, ErrorClass::RateLimited);
    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Remote images and probe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_image_uses_content_type() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(
        listener,
        http_response("200 OK", "", "image/jpeg; charset=binary", b"\xff\xd8jpeg"),
    );

    let transport = HttpTransport::from_config(&config(port, false)).unwrap();
    let image = transport
        .fetch_image(&format!("http://127.0.0.1:{port}/out.jpg"), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(image.mime_type, "image/jpeg");
    assert_eq!(image.bytes, b"\xff\xd8jpeg");
    let raw = server.await.unwrap();
    assert!(raw.starts_with("GET /out.jpg "), "{raw}");
}

#[tokio::test]
async fn fetch_image_failure_status() {
    let (listener, port) = mock_listener().await;
    let server = serve_once(listener, http_response("404 Not Found", "", "text/plain", b"gone"));

    let transport = HttpTransport::from_config(&config(port, false)).unwrap();
    let err = transport
        .fetch_image(&format!("http://127.0.0.1:{port}/out.png"), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::RemoteFetch { .. }), "{err:?}");
    server.await.unwrap();
}

#[tokio::test]
async fn probe_counts_models() {
    let (listener, port) = mock_listener().await;
    let body = r#"{"data":[{"id":"acme/pixel-9"},{"id":"acme/pixel-10"}]}"#;
    let server = serve_once(listener, json_response("200 OK", "", body));

    let transport = HttpTransport::from_config(&config(port, false)).unwrap();
    assert_eq!(transport.probe_models(TIMEOUT).await.unwrap(), 2);
    let raw = server.await.unwrap();
    assert!(raw.starts_with("GET /v1/models "), "{raw}");
    assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-or-test"));
}
